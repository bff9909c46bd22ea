//! Layered configuration: `ROLLCALL_*` environment variables over an
//! optional TOML file (named by `ROLLCALL_CONFIG`) over built-in defaults.

use crate::matcher::{DistanceMetric, MarginMatcher};
use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const ENV_PREFIX: &str = "ROLLCALL_";
const CONFIG_FILE_VAR: &str = "ROLLCALL_CONFIG";

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

pub const DEFAULT_GALLERY_DIR: &str = "known_faces";
pub const DEFAULT_THRESHOLD: f32 = 0.60;
pub const DEFAULT_MARGIN: f32 = 0.05;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// `$XDG_DATA_HOME/rollcall`, else `~/.local/share/rollcall`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}

/// Key/value lookup across the environment and the config file.
///
/// Keys are lowercase snake case (`threshold`); the matching environment
/// variable is the uppercased key with the `ROLLCALL_` prefix
/// (`ROLLCALL_THRESHOLD`). Environment values win.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    env: HashMap<String, String>,
    file: toml::Table,
}

impl ConfigSource {
    /// Snapshot `ROLLCALL_*` variables and read the file named by
    /// `ROLLCALL_CONFIG`, if set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env: HashMap<String, String> = std::env::vars()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        let file = match env.get(CONFIG_FILE_VAR) {
            Some(path) => read_table(Path::new(path))?,
            None => toml::Table::new(),
        };
        Ok(Self { env, file })
    }

    pub fn new(env: HashMap<String, String>, file: toml::Table) -> Self {
        Self { env, file }
    }

    /// Parse a TOML document as the file layer.
    pub fn with_file_str(mut self, text: &str) -> Result<Self, ConfigError> {
        self.file = text.parse().map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Ok(self)
    }

    pub fn with_env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.insert(env_name(key), value.into());
        self
    }

    /// Raw string value for `key`, if either layer sets it.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(v) = self.env.get(&env_name(key)) {
            return Some(v.clone());
        }
        match self.file.get(key)? {
            toml::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Parse `key`, falling back to `default` when unset.
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    pub fn path_or(&self, key: &str, default: impl FnOnce() -> PathBuf) -> PathBuf {
        self.get(key).map(PathBuf::from).unwrap_or_else(default)
    }

    /// Booleans accept 1/0, true/false, on/off and yes/no.
    pub fn flag_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => Ok(true),
            "0" | "false" | "off" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
                reason: "expected a boolean".to_string(),
            }),
        }
    }
}

fn env_name(key: &str) -> String {
    format!("{ENV_PREFIX}{}", key.to_ascii_uppercase())
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    text.parse().map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Model location, gallery location and matching policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionConfig {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Directory of enrolled reference photos.
    pub gallery_dir: PathBuf,
    pub metric: DistanceMetric,
    /// Largest distance still accepted as a match.
    pub threshold: f32,
    /// Required distance gap between the best and second-best identity.
    pub margin: f32,
    /// Apply CLAHE before locating faces.
    pub enhance: bool,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            gallery_dir: PathBuf::from(DEFAULT_GALLERY_DIR),
            metric: DistanceMetric::Cosine,
            threshold: DEFAULT_THRESHOLD,
            margin: DEFAULT_MARGIN,
            enhance: true,
        }
    }
}

impl RecognitionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&ConfigSource::from_env()?)
    }

    pub fn from_source(source: &ConfigSource) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            model_dir: source.path_or("model_dir", || defaults.model_dir.clone()),
            gallery_dir: source.path_or("gallery_dir", || defaults.gallery_dir.clone()),
            metric: source.parse_or("metric", defaults.metric)?,
            threshold: source.parse_or("threshold", defaults.threshold)?,
            margin: source.parse_or("margin", defaults.margin)?,
            enhance: source.flag_or("enhance", defaults.enhance)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Threshold must be positive and finite; margin finite and non-negative.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "threshold".to_string(),
                value: self.threshold.to_string(),
                reason: "must be a positive finite number".to_string(),
            });
        }
        if !self.margin.is_finite() || self.margin < 0.0 {
            return Err(ConfigError::Invalid {
                key: "margin".to_string(),
                value: self.margin.to_string(),
                reason: "must be a non-negative finite number".to_string(),
            });
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(SCRFD_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join(ARCFACE_MODEL_FILE)
    }

    pub fn matcher(&self) -> MarginMatcher {
        MarginMatcher::new(self.metric, self.threshold, self.margin)
    }
}
