//! HTTP-polling collector: fetch configured JSON endpoints, flatten them
//! into `/`-separated series names, and batch the observations into the
//! current UTC day's log through an appender. The queue is flushed every few
//! seconds and once more on a clean interrupt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, TimeZone, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::appender::TsdbAppender;
use crate::config::{CollectorConfig, HttpSource};
use crate::error::{TsdbError, TsdbResult};
use crate::value::{observation_from_text, Observation};
use crate::writer::now_ms;

const FLUSH_INTERVAL: Duration = Duration::from_secs(10);
const IDLE_SLEEP: Duration = Duration::from_millis(200);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

pub fn quantize_timestamp_ms(timestamp_ms: u64, quantize_ms: u64) -> u64 {
    if quantize_ms == 0 {
        return timestamp_ms;
    }
    (timestamp_ms / quantize_ms) * quantize_ms
}

/// Flatten a JSON object into dot-joined leaf paths. Only objects recurse;
/// arrays and scalars are leaves, rendered as their JSON text (strings stay
/// raw). A non-object document flattens to nothing.
pub fn flatten_json(document: &JsonValue) -> Option<HashMap<String, String>> {
    let JsonValue::Object(_) = document else {
        return None;
    };
    let mut flat = HashMap::new();
    walk("", document, &mut flat);
    Some(flat)
}

fn walk(prefix: &str, value: &JsonValue, flat: &mut HashMap<String, String>) {
    match value {
        JsonValue::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                walk(&path, child, flat);
            }
        }
        JsonValue::String(text) => {
            flat.insert(prefix.to_string(), text.clone());
        }
        other => {
            flat.insert(prefix.to_string(), other.to_string());
        }
    }
}

/// Expand the `base_url/` shorthand in a source URL.
pub fn resolve_http_url(url: &str, base_url: &str) -> String {
    let text = url.trim();
    if let Some(rest) = text.strip_prefix("base_url/") {
        let base = base_url.trim();
        if base.is_empty() {
            return text.to_string();
        }
        return format!("{}/{}", base.trim_end_matches('/'), rest.trim_start_matches('/'));
    }
    text.to_string()
}

fn fetch_json(agent: &ureq::Agent, url: &str) -> Result<JsonValue, String> {
    let response = agent.get(url).call().map_err(|e| e.to_string())?;
    response.into_json().map_err(|e| e.to_string())
}

/// Poll one source and emit `(timestamp, series, observation)` triples for
/// its configured value paths.
fn poll_source(
    agent: &ureq::Agent,
    source: &HttpSource,
    base_url: &str,
    quantize_ms: u64,
) -> Vec<(u64, String, Observation)> {
    let url = resolve_http_url(&source.url, base_url);
    if url.is_empty() {
        return Vec::new();
    }
    let document = match fetch_json(agent, &url) {
        Ok(document) => document,
        Err(error) => {
            warn!(url = %url, error = %error, "http fetch failed");
            return Vec::new();
        }
    };
    let Some(flat) = flatten_json(&document) else {
        warn!(url = %url, "http fetch returned non-object JSON");
        return Vec::new();
    };

    let ts_ms = quantize_timestamp_ms(now_ms(), quantize_ms);
    let base_topic = source.base_topic.trim().trim_matches('/');
    let mut events = Vec::new();
    for select in &source.values {
        let path = select.path.trim();
        if path.is_empty() {
            continue;
        }
        let Some(raw) = flat.get(path) else {
            continue;
        };
        let leaf = select
            .topic
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| path.replace('.', "/"));
        let series = if base_topic.is_empty() {
            leaf
        } else {
            format!("{base_topic}/{leaf}")
        };
        events.push((ts_ms, series, observation_from_text(raw.trim())));
    }
    debug!(url = %url, keys = flat.len(), emitted = events.len(), "http poll");
    events
}

fn day_of_timestamp(timestamp_ms: u64) -> Option<NaiveDate> {
    Utc.timestamp_millis_opt(timestamp_ms as i64)
        .single()
        .map(|dt| dt.date_naive())
}

/// Write a batch into per-UTC-day appenders, creating daily files on first
/// use.
fn flush_batch(
    data_dir: &Path,
    appenders: &mut HashMap<NaiveDate, TsdbAppender>,
    batch: Vec<(u64, String, Observation)>,
) -> TsdbResult<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let count = batch.len();
    let mut by_day: HashMap<NaiveDate, Vec<(u64, String, Observation)>> = HashMap::new();
    for event in batch {
        let Some(day) = day_of_timestamp(event.0) else {
            continue;
        };
        by_day.entry(day).or_default().push(event);
    }
    for (day, day_events) in by_day {
        if !appenders.contains_key(&day) {
            let path = data_dir.join(format!("data_{}.tsdb", day.format("%Y-%m-%d")));
            info!(
                path = %path.display(),
                existing = path.exists(),
                "opening TSDB file"
            );
            appenders.insert(day, TsdbAppender::open(path)?);
        }
        if let Some(appender) = appenders.get_mut(&day) {
            appender.append_events(&day_events)?;
        }
    }
    info!(events = count, "flushed batch");
    Ok(())
}

pub struct CollectorOptions {
    pub config: CollectorConfig,
    pub data_dir: PathBuf,
    pub quantize_ms: u64,
}

/// Run the polling loop until interrupted. Returns an error when no source
/// is configured.
pub fn run_collector(options: CollectorOptions) -> TsdbResult<()> {
    let sources: Vec<HttpSource> = options
        .config
        .http
        .urls
        .iter()
        .filter(|s| !s.url.trim().is_empty())
        .cloned()
        .collect();
    if sources.is_empty() {
        return Err(TsdbError::BadRequest(
            "collector requires at least one HTTP source in the config".into(),
        ));
    }
    let base_url = options.config.http.base_url.clone();
    let poll_interval = Duration::from_millis(
        options
            .config
            .http
            .poll_interval_ms
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
            .max(MIN_POLL_INTERVAL_MS),
    );
    std::fs::create_dir_all(&options.data_dir)?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    }

    let agent = ureq::AgentBuilder::new().timeout(FETCH_TIMEOUT).build();
    let mut queue: Vec<(u64, String, Observation)> = Vec::new();
    let mut appenders: HashMap<NaiveDate, TsdbAppender> = HashMap::new();
    let mut last_flush = Instant::now();
    let mut next_poll = Instant::now();

    info!(
        sources = sources.len(),
        poll_interval_ms = poll_interval.as_millis() as u64,
        data_dir = %options.data_dir.display(),
        "collector started"
    );

    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= next_poll {
            for source in &sources {
                queue.extend(poll_source(&agent, source, &base_url, options.quantize_ms));
            }
            next_poll = now + poll_interval;
        }

        if now.duration_since(last_flush) >= FLUSH_INTERVAL {
            let batch = std::mem::take(&mut queue);
            flush_batch(&options.data_dir, &mut appenders, batch)?;
            last_flush = now;
        }
        std::thread::sleep(IDLE_SLEEP);
    }

    // Clean interrupt: flush whatever is still queued.
    let batch = std::mem::take(&mut queue);
    flush_batch(&options.data_dir, &mut appenders, batch)?;
    info!("collector stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::read_tsdb_file;
    use crate::value::Value;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn timestamps_quantize_downward() {
        assert_eq!(quantize_timestamp_ms(1234, 0), 1234);
        assert_eq!(quantize_timestamp_ms(1234, 100), 1200);
        assert_eq!(quantize_timestamp_ms(1200, 100), 1200);
    }

    #[test]
    fn flattening_recurses_objects_only() {
        let doc = json!({
            "total": {"Power": {"v": 123.4, "u": "W"}},
            "inverters": [{"name": "HM600"}],
            "reachable": true
        });
        let flat = flatten_json(&doc).unwrap();
        assert_eq!(flat["total.Power.v"], "123.4");
        assert_eq!(flat["total.Power.u"], "W");
        assert_eq!(flat["reachable"], "true");
        // Arrays are leaves, kept as their JSON text.
        assert_eq!(flat["inverters"], r#"[{"name":"HM600"}]"#);

        assert!(flatten_json(&json!([1, 2, 3])).is_none());
    }

    #[test]
    fn url_shorthand_expands_against_the_base() {
        assert_eq!(
            resolve_http_url("base_url/api/status", "http://dtu.local/"),
            "http://dtu.local/api/status"
        );
        assert_eq!(
            resolve_http_url("base_url/api/status", ""),
            "base_url/api/status"
        );
        assert_eq!(
            resolve_http_url(" http://a.local/json ", "http://dtu.local"),
            "http://a.local/json"
        );
    }

    #[test]
    fn batches_split_by_utc_day() {
        let dir = tempdir().unwrap();
        let mut appenders = HashMap::new();
        let day_ms = 86_400_000u64;
        flush_batch(
            dir.path(),
            &mut appenders,
            vec![
                (1_000, "a".into(), Observation::numeric(1.0)),
                (day_ms + 1_000, "a".into(), Observation::numeric(2.0)),
            ],
        )
        .unwrap();

        let first = read_tsdb_file(dir.path().join("data_1970-01-01.tsdb")).unwrap();
        let second = read_tsdb_file(dir.path().join("data_1970-01-02.tsdb")).unwrap();
        assert_eq!(
            first.series_values("a"),
            vec![(1_000, Value::Double(1.0))]
        );
        assert_eq!(
            second.series_values("a"),
            vec![(day_ms + 1_000, Value::Double(2.0))]
        );
    }
}
