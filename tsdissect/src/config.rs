//! Configuration file support.
//!
//! ```toml
//! [sync]
//! window = 5000
//!
//! [demux]
//! auto_classify = true
//! unbounded_capacity = 20000
//! report_limit = 100
//! progress_interval = 10000
//!
//! [output]
//! format = "json"
//!
//! [logging]
//! level = "debug"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{DissectError, Result};
use crate::ts_analyzer::DemuxConfig;

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "tsdissect.toml";

/// Configuration file format.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DissectConfig {
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub demux: DemuxSection,
    #[serde(default)]
    pub output: OutputSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncSection {
    pub window: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DemuxSection {
    pub auto_classify: Option<bool>,
    pub unbounded_capacity: Option<usize>,
    pub report_limit: Option<u64>,
    pub progress_interval: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSection {
    /// "table" or "json".
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    pub level: Option<String>,
}

impl DissectConfig {
    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DissectError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: DissectConfig = toml::from_str(contents)?;
        if config.sync.window == Some(0) {
            return Err(DissectError::Config("sync.window must be positive".into()));
        }
        Ok(config)
    }

    /// Explicit path, or the default file if it exists in the working directory.
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        explicit.map(Path::to_path_buf).or_else(|| {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            default_path.exists().then_some(default_path)
        })
    }

    /// Demultiplexer settings, with defaults for unset values.
    pub fn demux_config(&self) -> DemuxConfig {
        let defaults = DemuxConfig::default();
        DemuxConfig {
            sync_window: self.sync.window.unwrap_or(defaults.sync_window),
            auto_classify: self.demux.auto_classify.unwrap_or(defaults.auto_classify),
            unbounded_capacity: self
                .demux
                .unbounded_capacity
                .unwrap_or(defaults.unbounded_capacity),
            report_limit: self.demux.report_limit.unwrap_or(defaults.report_limit),
            progress_interval: self
                .demux
                .progress_interval
                .unwrap_or(defaults.progress_interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = DissectConfig::from_toml_str("").unwrap();
        let demux = config.demux_config();
        assert_eq!(demux.sync_window, 5000);
        assert!(demux.auto_classify);
        assert_eq!(demux.unbounded_capacity, 20_000);
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = DissectConfig::from_toml_str(
            r#"
            [sync]
            window = 1024

            [demux]
            auto_classify = false
            report_limit = 5

            [output]
            format = "json"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        let demux = config.demux_config();
        assert_eq!(demux.sync_window, 1024);
        assert!(!demux.auto_classify);
        assert_eq!(demux.report_limit, 5);
        assert_eq!(config.output.format.as_deref(), Some("json"));
        assert_eq!(config.logging.level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            DissectConfig::from_toml_str("[sync]\nwindow = 0\n"),
            Err(DissectError::Config(_))
        ));
        assert!(matches!(
            DissectConfig::from_toml_str("[demux]\nunknown = 1\n"),
            Err(DissectError::Config(_))
        ));
    }
}
