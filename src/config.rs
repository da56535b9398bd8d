//! Collector configuration file (TOML).

use std::path::Path;

use serde::Deserialize;

use crate::error::TsdbResult;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectorConfig {
    #[serde(default)]
    pub data_dir: Option<String>,
    /// Quantize incoming timestamps to this many milliseconds; 0 disables.
    #[serde(default)]
    pub quantize_timestamps: Option<u64>,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub urls: Vec<HttpSource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSource {
    pub url: String,
    #[serde(default)]
    pub base_topic: String,
    #[serde(default)]
    pub values: Vec<ValueSelect>,
}

/// One value picked out of a flattened JSON document.
#[derive(Debug, Clone, Deserialize)]
pub struct ValueSelect {
    /// Dot-joined key path inside the fetched document.
    pub path: String,
    /// Series name leaf; defaults to `path` with dots turned into slashes.
    #[serde(default)]
    pub topic: Option<String>,
}

/// Load the collector config; a missing file reads as the default config.
pub fn load_collector_config(path: &Path) -> TsdbResult<CollectorConfig> {
    if !path.exists() {
        return Ok(CollectorConfig::default());
    }
    let text = std::fs::read_to_string(path)?;
    toml::from_str(&text)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()).into())
}
