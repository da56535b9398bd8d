//! Dashboards and settings: opaque JSON objects persisted next to the log
//! files with an atomic write-then-rename.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use crate::error::TsdbResult;

pub type JsonObject = Map<String, JsonValue>;

fn dashboards_path(data_dir: &Path) -> PathBuf {
    data_dir.join("dashboards.json")
}

fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

/// Load a JSON object from `path`, unwrapping an optional `{wrapper_key: …}`
/// envelope. Missing, malformed or non-object content reads as empty.
fn load_object(path: &Path, wrapper_key: &str) -> JsonObject {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return JsonObject::new(),
    };
    let parsed: JsonValue = match serde_json::from_str(&raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring malformed JSON store");
            return JsonObject::new();
        }
    };
    let JsonValue::Object(mut object) = parsed else {
        return JsonObject::new();
    };
    if let Some(JsonValue::Object(inner)) = object.remove(wrapper_key) {
        return inner;
    }
    object
}

fn save_object(path: &Path, wrapper_key: &str, object: &JsonObject) -> TsdbResult<()> {
    let mut payload = JsonObject::new();
    payload.insert(wrapper_key.to_string(), JsonValue::Object(object.clone()));
    let mut body = serde_json::to_string_pretty(&JsonValue::Object(payload))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    body.push('\n');

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Named dashboards; only object-valued entries are kept.
pub fn load_dashboards(data_dir: &Path) -> JsonObject {
    load_object(&dashboards_path(data_dir), "dashboards")
        .into_iter()
        .filter(|(_, value)| value.is_object())
        .collect()
}

pub fn save_dashboards(data_dir: &Path, dashboards: &JsonObject) -> TsdbResult<()> {
    save_object(&dashboards_path(data_dir), "dashboards", dashboards)
}

pub fn load_settings(data_dir: &Path) -> JsonObject {
    load_object(&settings_path(data_dir), "settings")
}

pub fn save_settings(data_dir: &Path, settings: &JsonObject) -> TsdbResult<()> {
    save_object(&settings_path(data_dir), "settings", settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn dashboards_round_trip() {
        let dir = tempdir().unwrap();
        assert!(load_dashboards(dir.path()).is_empty());

        let mut dashboards = JsonObject::new();
        dashboards.insert("Power".into(), json!({"panels": [1, 2, 3]}));
        save_dashboards(dir.path(), &dashboards).unwrap();

        let loaded = load_dashboards(dir.path());
        assert_eq!(loaded, dashboards);
        // No stray temp file left behind.
        assert!(!dir.path().join("dashboards.json.tmp").exists());
    }

    #[test]
    fn settings_accept_bare_and_wrapped_objects() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("settings.json"), r#"{"theme":"dark"}"#).unwrap();
        assert_eq!(load_settings(dir.path())["theme"], json!("dark"));

        std::fs::write(
            dir.path().join("settings.json"),
            r#"{"settings":{"theme":"light"}}"#,
        )
        .unwrap();
        assert_eq!(load_settings(dir.path())["theme"], json!("light"));
    }

    #[test]
    fn malformed_stores_read_as_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("settings.json"), "{not json").unwrap();
        assert!(load_settings(dir.path()).is_empty());
        std::fs::write(dir.path().join("dashboards.json"), "[1,2,3]").unwrap();
        assert!(load_dashboards(dir.path()).is_empty());
    }

    #[test]
    fn non_object_dashboards_are_dropped() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("dashboards.json"),
            r#"{"dashboards":{"A":{"x":1},"broken":42}}"#,
        )
        .unwrap();
        let loaded = load_dashboards(dir.path());
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("A"));
    }
}
