use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Runtime settings for a download.
///
/// The four required fields mirror what the engine actually consumes; the
/// timeout knobs default to values that work against slow public peers.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory the destination files are created under.
    pub download_path: PathBuf,
    /// Port reported to the tracker in the announce request.
    pub listen_port: u16,
    /// Ceiling on concurrently connected peers.
    pub max_connections: usize,
    /// Ceiling on piece-level requests outstanding per peer session.
    pub max_outstanding_requests: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    120
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_path: PathBuf::from("."),
            listen_port: 6881,
            max_connections: 10,
            max_outstanding_requests: 5,
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

impl Config {
    /// Loads and validates a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let config: Config = toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }
        if self.max_outstanding_requests == 0 {
            return Err(Error::Config(
                "max_outstanding_requests must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_toml() {
        let config: Config = toml::from_str(
            r#"
            download_path = "/tmp/downloads"
            listen_port = 6881
            max_connections = 8
            max_outstanding_requests = 4
            connect_timeout_secs = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.download_path, PathBuf::from("/tmp/downloads"));
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.connect_timeout_secs, 3);
        // Omitted optional field falls back to its default.
        assert_eq!(config.read_timeout_secs, 120);
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let result: std::result::Result<Config, _> = toml::from_str(
            r#"
            download_path = "/tmp/downloads"
            listen_port = 6881
            max_connections = 8
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn zero_connection_cap_rejected() {
        let config = Config {
            max_connections: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_request_ceiling_rejected() {
        let config = Config {
            max_outstanding_requests: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
