use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PtqError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Run the optimizer before compiling installed queries.
    pub optimize_queries: bool,
    /// When false every bag packs and unpacks nothing.
    pub baggage_enabled: bool,
    /// Report an empty result record for sinks that saw no rows.
    pub emit_if_no_results: bool,
    /// Length of one reporting interval; stamped on every collected result.
    pub report_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            optimize_queries: true,
            baggage_enabled: true,
            emit_if_no_results: false,
            report_interval_ms: 1000,
        }
    }
}

impl EngineConfig {
    /// Load a config from a JSON file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            PtqError::InvalidConfig(format!("{}: {e}", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"emit_if_no_results": true}"#)
            .expect("config");
        assert!(cfg.emit_if_no_results);
        assert!(cfg.optimize_queries);
        assert!(cfg.baggage_enabled);
        assert_eq!(cfg.report_interval_ms, 1000);
    }

    #[test]
    fn malformed_file_is_invalid_config() {
        let dir = std::env::temp_dir().join(format!("ptq_cfg_{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("tmp dir");
        let path = dir.join("bad.json");
        std::fs::write(&path, "{ not json").expect("write");
        let err = EngineConfig::from_json_file(&path).expect_err("must fail");
        assert!(err.to_string().starts_with("invalid configuration"));
        let _ = std::fs::remove_dir_all(dir);
    }
}
