//! JSON-over-HTTP query surface. Each accepted request is handled on its own
//! thread; the engine state lives in the process-global file cache and the
//! JSON stores in the data directory.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};
use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{debug, error, info};

use crate::error::{TsdbError, TsdbResult};
use crate::query;
use crate::store;
use crate::writer::now_ms;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub ui_dir: Option<PathBuf>,
}

#[derive(Debug)]
struct ApiError {
    status: u16,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        ApiError {
            status: 400,
            code: "bad_request",
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        ApiError {
            status: 404,
            code: "not_found",
            message: message.into(),
        }
    }
}

impl From<TsdbError> for ApiError {
    fn from(e: TsdbError) -> Self {
        match e {
            TsdbError::BadRequest(message) => ApiError::bad_request(message),
            TsdbError::Io(e) => ApiError {
                status: 500,
                code: "io_error",
                message: e.to_string(),
            },
            other => ApiError {
                status: 500,
                code: "tsdb_parse_error",
                message: other.to_string(),
            },
        }
    }
}

fn header(name: &str, value: &str) -> Header {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("static header")
}

fn cors_headers() -> Vec<Header> {
    vec![
        header("Access-Control-Allow-Origin", "*"),
        header("Access-Control-Allow-Methods", "GET, PUT, OPTIONS"),
        header("Access-Control-Allow-Headers", "Content-Type"),
    ]
}

fn respond_json(request: Request, status: u16, payload: &JsonValue) {
    let body = payload.to_string();
    let mut response = Response::from_string(body)
        .with_status_code(status)
        .with_header(header("Content-Type", "application/json; charset=utf-8"))
        .with_header(header("Cache-Control", "no-store"));
    for h in cors_headers() {
        response = response.with_header(h);
    }
    if let Err(e) = request.respond(response) {
        debug!(error = %e, "client went away before the response was written");
    }
}

fn respond_error(request: Request, err: ApiError) {
    let payload = json!({"error": {"code": err.code, "message": err.message}});
    respond_json(request, err.status, &payload);
}

fn respond_bytes(request: Request, status: u16, body: Vec<u8>, content_type: &str) {
    let response = Response::from_data(body)
        .with_status_code(status)
        .with_header(header("Content-Type", content_type))
        .with_header(header("Cache-Control", "no-store"));
    if let Err(e) = request.respond(response) {
        debug!(error = %e, "client went away before the response was written");
    }
}

fn split_request_url(raw: &str) -> Result<(String, HashMap<String, String>), ApiError> {
    let parsed = url::Url::parse(&format!("http://localhost{raw}"))
        .map_err(|e| ApiError::bad_request(format!("invalid request URL: {e}")))?;
    let mut params = HashMap::new();
    for (key, value) in parsed.query_pairs() {
        params
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    Ok((parsed.path().to_string(), params))
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn required_param<'a>(
    params: &'a HashMap<String, String>,
    name: &str,
) -> Result<&'a str, ApiError> {
    params
        .get(name)
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("Missing required query parameter: {name}")))
}

fn parse_window(
    params: &HashMap<String, String>,
    start_required: bool,
) -> Result<(i64, i64), ApiError> {
    let start_ms = match params.get("start").map(|s| s.as_str()).filter(|s| !s.is_empty()) {
        Some(raw) => query::parse_timestamp(raw)?,
        None if start_required => {
            return Err(ApiError::bad_request("Missing required query parameter: start"))
        }
        None => 0,
    };
    let end_ms = match params.get("end").map(|s| s.as_str()).filter(|s| !s.is_empty()) {
        Some(raw) => query::parse_timestamp(raw)?,
        None if start_required => {
            return Err(ApiError::bad_request("Missing required query parameter: end"))
        }
        None => now_ms() as i64,
    };
    if end_ms < start_ms {
        return Err(ApiError::bad_request("end must be >= start"));
    }
    Ok((start_ms, end_ms))
}

fn handle_series(
    config: &ServerConfig,
    params: &HashMap<String, String>,
) -> Result<JsonValue, ApiError> {
    let (start_ms, end_ms) = parse_window(params, false)?;
    let response = query::list_series(&config.data_dir, start_ms, end_ms);
    serde_json::to_value(response).map_err(|e| ApiError {
        status: 500,
        code: "internal_error",
        message: e.to_string(),
    })
}

fn handle_events(
    config: &ServerConfig,
    params: &HashMap<String, String>,
) -> Result<JsonValue, ApiError> {
    let series = required_param(params, "series")?;
    let (start_ms, end_ms) = parse_window(params, true)?;
    let max_events_raw = required_param(params, "maxEvents")?;
    let max_events: i64 = max_events_raw
        .parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid maxEvents: {max_events_raw}")))?;
    if max_events <= 0 {
        return Err(ApiError::bad_request("maxEvents must be > 0"));
    }

    let response =
        query::query_events(&config.data_dir, series, start_ms, end_ms, max_events as usize)?;
    serde_json::to_value(response).map_err(|e| ApiError {
        status: 500,
        code: "internal_error",
        message: e.to_string(),
    })
}

fn dashboard_name_from_path(path: &str) -> Result<String, ApiError> {
    let raw = &path["/dashboards/".len()..];
    let name = percent_decode(raw).trim().to_string();
    if name.is_empty() {
        return Err(ApiError::bad_request("Dashboard name must not be empty"));
    }
    if name.contains('/') {
        return Err(ApiError::bad_request("Dashboard name must not contain '/'"));
    }
    if name == "Default" {
        return Err(ApiError::bad_request(
            "'Default' is reserved and synthesized; save under a different name",
        ));
    }
    Ok(name)
}

fn read_body_json(request: &mut Request) -> Result<JsonValue, ApiError> {
    let mut body = String::new();
    request
        .as_reader()
        .read_to_string(&mut body)
        .map_err(|e| ApiError::bad_request(format!("Unreadable request body: {e}")))?;
    if body.is_empty() {
        return Err(ApiError::bad_request("Empty request body"));
    }
    serde_json::from_str(&body).map_err(|_| ApiError::bad_request("Invalid JSON body"))
}

/// Unwrap `{"<key>": {…}}` envelopes and require an object payload.
fn unwrap_object(payload: JsonValue, key: &str) -> Result<store::JsonObject, ApiError> {
    let JsonValue::Object(mut object) = payload else {
        return Err(ApiError::bad_request(format!(
            "{} payload must be an object",
            capitalized(key)
        )));
    };
    match object.remove(key) {
        Some(JsonValue::Object(inner)) => Ok(inner),
        Some(_) => Err(ApiError::bad_request(format!(
            "{} payload must be an object",
            capitalized(key)
        ))),
        None => Ok(object),
    }
}

fn capitalized(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn handle_static(config: &ServerConfig, path: &str) -> Option<Result<(Vec<u8>, String), ApiError>> {
    let ui_dir = config.ui_dir.as_deref()?;
    let rel = if path == "/" || path == "/index.html" {
        "index.html".to_string()
    } else if let Some(rest) = path.strip_prefix("/static/") {
        percent_decode(rest).trim_start_matches('/').to_string()
    } else {
        return None;
    };

    let full_path = ui_dir.join(&rel);
    let canonical_dir = match ui_dir.canonicalize() {
        Ok(dir) => dir,
        Err(_) => return Some(Err(ApiError::not_found(format!("Static file not found: {rel}")))),
    };
    let canonical = match full_path.canonicalize() {
        Ok(path) => path,
        Err(_) => return Some(Err(ApiError::not_found(format!("Static file not found: {rel}")))),
    };
    if !canonical.starts_with(&canonical_dir) {
        return Some(Err(ApiError::bad_request("Invalid static path")));
    }
    if !canonical.is_file() {
        return Some(Err(ApiError::not_found(format!("Static file not found: {rel}"))));
    }
    match std::fs::read(&canonical) {
        Ok(body) => Some(Ok((body, mime_for(&canonical).to_string()))),
        Err(e) => Some(Err(ApiError {
            status: 500,
            code: "io_error",
            message: e.to_string(),
        })),
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

fn handle_get(config: &ServerConfig, path: &str, params: &HashMap<String, String>) -> Result<JsonValue, ApiError> {
    match path {
        "/health" => Ok(json!({"ok": true})),
        "/series" => handle_series(config, params),
        "/events" => handle_events(config, params),
        "/dashboards" => {
            let dashboards = store::load_dashboards(&config.data_dir);
            let mut names: Vec<&String> = dashboards.keys().collect();
            names.sort();
            Ok(json!({ "dashboards": names }))
        }
        "/settings" => {
            let settings = store::load_settings(&config.data_dir);
            Ok(json!({ "settings": settings }))
        }
        _ if path.starts_with("/dashboards/") => {
            let name = dashboard_name_from_path(path)?;
            let dashboards = store::load_dashboards(&config.data_dir);
            match dashboards.get(&name) {
                Some(dashboard) => Ok(json!({"name": name, "dashboard": dashboard})),
                None => Err(ApiError::not_found(format!("Dashboard not found: {name}"))),
            }
        }
        _ => Err(ApiError::not_found(format!("Unknown endpoint: {path}"))),
    }
}

fn handle_put(
    config: &ServerConfig,
    path: &str,
    request: &mut Request,
) -> Result<JsonValue, ApiError> {
    if path.starts_with("/dashboards/") {
        let name = dashboard_name_from_path(path)?;
        let dashboard = unwrap_object(read_body_json(request)?, "dashboard")?;
        let mut dashboards = store::load_dashboards(&config.data_dir);
        dashboards.insert(name.clone(), JsonValue::Object(dashboard));
        store::save_dashboards(&config.data_dir, &dashboards)?;
        return Ok(json!({"ok": true, "name": name}));
    }
    if path == "/settings" {
        let settings = unwrap_object(read_body_json(request)?, "settings")?;
        store::save_settings(&config.data_dir, &settings)?;
        return Ok(json!({"ok": true}));
    }
    Err(ApiError::not_found(format!("Unknown endpoint: {path}")))
}

fn handle_request(config: &ServerConfig, mut request: Request) {
    let (path, params) = match split_request_url(request.url()) {
        Ok(split) => split,
        Err(err) => return respond_error(request, err),
    };

    match request.method() {
        Method::Options => {
            let mut response = Response::empty(204)
                .with_header(header("Access-Control-Max-Age", "600"));
            for h in cors_headers() {
                response = response.with_header(h);
            }
            if let Err(e) = request.respond(response) {
                debug!(error = %e, "client went away before the response was written");
            }
        }
        Method::Get => {
            if let Some(result) = handle_static(config, &path) {
                return match result {
                    Ok((body, content_type)) => respond_bytes(request, 200, body, &content_type),
                    Err(err) => respond_error(request, err),
                };
            }
            match handle_get(config, &path, &params) {
                Ok(payload) => respond_json(request, 200, &payload),
                Err(err) => respond_error(request, err),
            }
        }
        Method::Put => match handle_put(config, &path, &mut request) {
            Ok(payload) => respond_json(request, 200, &payload),
            Err(err) => respond_error(request, err),
        },
        _ => respond_error(
            request,
            ApiError::not_found(format!("Unknown endpoint: {path}")),
        ),
    }
}

/// Bind and serve until the process is stopped. Each request runs on its own
/// thread; the shared state is the process-global file cache.
pub fn run_server(config: ServerConfig) -> TsdbResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let server = Server::http(&addr)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrInUse, e.to_string()))?;
    info!(
        addr = %addr,
        data_dir = %config.data_dir.display(),
        "serving TSDB REST API"
    );
    let config = Arc::new(config);
    for request in server.incoming_requests() {
        let config = Arc::clone(&config);
        std::thread::spawn(move || handle_request(&config, request));
    }
    error!("server socket closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            data_dir: dir.to_path_buf(),
            ui_dir: None,
        }
    }

    #[test]
    fn url_splitting_decodes_query_params() {
        let (path, params) =
            split_request_url("/events?series=solar%2Fac%2Fpower&start=0&end=10&maxEvents=5")
                .unwrap();
        assert_eq!(path, "/events");
        assert_eq!(params["series"], "solar/ac/power");
        assert_eq!(params["maxEvents"], "5");
    }

    #[test]
    fn dashboard_names_are_validated() {
        assert_eq!(
            dashboard_name_from_path("/dashboards/My%20Board").unwrap(),
            "My Board"
        );
        assert!(dashboard_name_from_path("/dashboards/").is_err());
        assert!(dashboard_name_from_path("/dashboards/a%2Fb").is_err());
        assert!(dashboard_name_from_path("/dashboards/Default").is_err());
    }

    #[test]
    fn events_requires_all_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());

        let params: HashMap<String, String> =
            [("series".to_string(), "a".to_string())].into_iter().collect();
        let err = handle_events(&cfg, &params).unwrap_err();
        assert_eq!(err.status, 400);

        let params: HashMap<String, String> = [
            ("series", "a"),
            ("start", "10"),
            ("end", "5"),
            ("maxEvents", "10"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let err = handle_events(&cfg, &params).unwrap_err();
        assert_eq!(err.status, 400);
        assert!(err.message.contains("end must be >= start"));

        let params: HashMap<String, String> = [
            ("series", "a"),
            ("start", "0"),
            ("end", "10"),
            ("maxEvents", "0"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let err = handle_events(&cfg, &params).unwrap_err();
        assert!(err.message.contains("maxEvents must be > 0"));
    }

    #[test]
    fn health_and_unknown_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let params = HashMap::new();

        let payload = handle_get(&cfg, "/health", &params).unwrap();
        assert_eq!(payload, json!({"ok": true}));

        let err = handle_get(&cfg, "/nope", &params).unwrap_err();
        assert_eq!(err.status, 404);
        assert_eq!(err.code, "not_found");
    }

    #[test]
    fn series_endpoint_defaults_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let payload = handle_get(&cfg, "/series", &HashMap::new()).unwrap();
        assert_eq!(payload["start"], json!(0));
        assert!(payload["series"].as_array().unwrap().is_empty());
    }

    #[test]
    fn unwrap_object_accepts_bare_and_wrapped() {
        let bare = unwrap_object(json!({"a": 1}), "dashboard").unwrap();
        assert_eq!(bare["a"], json!(1));
        let wrapped = unwrap_object(json!({"dashboard": {"b": 2}}), "dashboard").unwrap();
        assert_eq!(wrapped["b"], json!(2));
        assert!(unwrap_object(json!([1, 2]), "dashboard").is_err());
        assert!(unwrap_object(json!({"dashboard": 7}), "dashboard").is_err());
    }

    #[test]
    fn percent_decoding_handles_plain_and_encoded() {
        assert_eq!(percent_decode("abc"), "abc");
        assert_eq!(percent_decode("a%20b"), "a b");
        assert_eq!(percent_decode("a%2Fb"), "a/b");
        assert_eq!(percent_decode("bad%2"), "bad%2");
    }
}
