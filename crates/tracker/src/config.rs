//! Tracker configuration

use anyhow::{Context, Result};
use serde::Deserialize;

/// Daemon configuration, read from `TRACKER_`-prefixed environment
/// variables.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Address (host:port) of the control plane watch feed.
    pub feed_addr: String,

    /// Namespace to watch; empty watches the global scope.
    #[serde(default)]
    pub namespace: String,

    /// Path of the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Port for the health/metrics HTTP server.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Ignore stored checkpoints and rebuild from the feed's current
    /// state on startup.
    #[serde(default)]
    pub initialize: bool,
}

fn default_db_path() -> String {
    "voltrack.db".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl TrackerConfig {
    /// Loads configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("TRACKER").try_parsing(true))
            .build()
            .context("failed to read configuration from environment")?;

        config
            .try_deserialize()
            .context("invalid tracker configuration (is TRACKER_FEED_ADDR set?)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(default_db_path(), "voltrack.db");
        assert_eq!(default_api_port(), 8080);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: TrackerConfig = serde_json::from_str(
            r#"{"feed_addr": "10.0.0.1:8080"}"#,
        )
        .unwrap();
        assert_eq!(config.feed_addr, "10.0.0.1:8080");
        assert_eq!(config.namespace, "");
        assert_eq!(config.api_port, 8080);
        assert!(!config.initialize);
    }
}
