//! Middleware configuration.
//!
//! Mirrors the knobs the host hands to the middleware: where the log stream
//! goes, how often its files rotate, where redacted form values are kept and
//! how much of a request body may be buffered. Parsing a config file is the
//! host's job; this module only fills in defaults and validates.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Deserialize;

use crate::error::ConfigError;

/// Directory name used for the log stream when `log_dir` is not set.
pub const DEFAULT_LOG_DIR: &str = "zerolog";

/// Directory name used for the redaction store when `hash_dir` is `"on"`.
pub const DEFAULT_HASH_DIR: &str = "hashdata";

/// Request bodies larger than this are rejected with `413`. Same as axum's
/// `DefaultBodyLimit`.
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Rotation granularity for the log and redaction files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitBy {
    #[default]
    Day,
    Hour,
}

impl FromStr for SplitBy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(SplitBy::Day),
            "hour" => Ok(SplitBy::Hour),
            other => Err(ConfigError::InvalidSplitBy(other.to_string())),
        }
    }
}

impl fmt::Display for SplitBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitBy::Day => f.write_str("day"),
            SplitBy::Hour => f.write_str("hour"),
        }
    }
}

/// Raw settings as received from the host, before defaults are applied.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub split_by: Option<String>,
    /// Empty disables redaction, `"on"` selects the default directory.
    #[serde(default)]
    pub hash_dir: Option<String>,
    /// Bytes; unset or `0` selects [`DEFAULT_BODY_LIMIT`].
    #[serde(default)]
    pub body_limit: Option<usize>,
}

/// Validated configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub log_dir: PathBuf,
    pub split_by: SplitBy,
    /// `None` disables redaction entirely.
    pub hash_dir: Option<PathBuf>,
    pub body_limit: usize,
}

impl Config {
    /// Applies defaults relative to the running executable and validates.
    pub fn provision(raw: RawConfig) -> Result<Self, ConfigError> {
        let exe_dir = executable_dir()?;
        Self::provision_in(raw, &exe_dir)
    }

    /// Same as [`Config::provision`], resolving defaults against `base`.
    pub fn provision_in(raw: RawConfig, base: &Path) -> Result<Self, ConfigError> {
        let log_dir = match raw.log_dir {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => base.join(DEFAULT_LOG_DIR),
        };

        let split_by = match raw.split_by.as_deref() {
            None | Some("") => SplitBy::default(),
            Some(value) => value.parse()?,
        };

        let hash_dir = match raw.hash_dir.as_deref() {
            None | Some("") => None,
            Some("on") => Some(base.join(DEFAULT_HASH_DIR)),
            Some(dir) => Some(PathBuf::from(dir)),
        };

        let body_limit = match raw.body_limit {
            None | Some(0) => DEFAULT_BODY_LIMIT,
            Some(limit) => limit,
        };

        Ok(Config {
            log_dir,
            split_by,
            hash_dir,
            body_limit,
        })
    }

    /// Parses a JSON object with `log_dir`, `split_by`, `hash_dir` and
    /// `body_limit` keys.
    pub fn from_json(json: &str, base: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(json)?;
        Self::provision_in(raw, base)
    }
}

fn executable_dir() -> Result<PathBuf, ConfigError> {
    let exe = std::env::current_exe().map_err(ConfigError::NoExecutableDir)?;
    Ok(exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")))
}
