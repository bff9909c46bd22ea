use rollcall_core::{default_data_dir, ConfigError, ConfigSource, RecognitionConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_MATCH_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Daemon configuration, loaded from `ROLLCALL_*` variables over the
/// optional `ROLLCALL_CONFIG` file.
#[derive(Debug, Clone)]
pub struct Config {
    pub recognition: RecognitionConfig,
    /// HTTP listen address (default: 127.0.0.1:8000).
    pub bind: SocketAddr,
    /// Path to the SQLite attendance database.
    pub db_path: PathBuf,
    /// Upper bound on one frame's locate + embed + match.
    pub match_timeout: Duration,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&ConfigSource::from_env()?)
    }

    pub fn from_source(source: &ConfigSource) -> Result<Self, ConfigError> {
        let timeout_ms: u64 = source.parse_or("match_timeout_ms", DEFAULT_MATCH_TIMEOUT_MS)?;
        if timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "match_timeout_ms".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            recognition: RecognitionConfig::from_source(source)?,
            bind: source.parse_or("bind", SocketAddr::from(([127, 0, 0, 1], 8000)))?,
            db_path: source.path_or("db_path", || default_data_dir().join("attendance.db")),
            match_timeout: Duration::from_millis(timeout_ms),
            max_body_bytes: source.parse_or("max_body_bytes", DEFAULT_MAX_BODY_BYTES)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_source(&ConfigSource::default()).unwrap();
        assert_eq!(config.bind.to_string(), "127.0.0.1:8000");
        assert_eq!(config.match_timeout, Duration::from_secs(5));
        assert_eq!(config.max_body_bytes, 10 * 1024 * 1024);
        assert!(config.db_path.ends_with("rollcall/attendance.db"));
    }

    #[test]
    fn test_overrides() {
        let source = ConfigSource::default()
            .with_file_str("bind = \"0.0.0.0:9000\"\nmatch_timeout_ms = 250\nthreshold = 0.5")
            .unwrap()
            .with_env("db_path", "/var/lib/rollcall/a.db");
        let config = Config::from_source(&source).unwrap();
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.match_timeout, Duration::from_millis(250));
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rollcall/a.db"));
        assert!((config.recognition.threshold - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_values() {
        for (key, value) in [("bind", "nowhere"), ("match_timeout_ms", "0"), ("max_body_bytes", "-1")] {
            let source = ConfigSource::default().with_env(key, value);
            assert!(Config::from_source(&source).is_err(), "{key}={value}");
        }
    }
}
