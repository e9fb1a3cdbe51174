//! Command-line interface configuration.

use argh::FromArgs;
use std::{net::SocketAddr, path::PathBuf};

use crate::config::RawConfig;

/// Reverse proxy and static file server with per-request JSON logging
#[derive(Debug, FromArgs)]
pub struct Cli {
    /// path to static files directory (e.g. 'dist/')
    #[argh(option, long = "static-dir")]
    pub static_dir: PathBuf,

    /// backend API address (e.g. '127.0.0.1:8081')
    #[argh(option)]
    pub api: String,

    /// API path prefix (default: '/pz')
    #[argh(option, long = "api-path", default = "String::from(\"/pz\")")]
    pub api_path: String,

    /// server bind address (default: '127.0.0.1:8000')
    #[argh(option, default = "SocketAddr::from(([127, 0, 0, 1], 8000))")]
    pub bind: SocketAddr,

    /// request log directory (default: 'zerolog' next to the executable)
    #[argh(option, long = "log-dir")]
    pub log_dir: Option<PathBuf>,

    /// log file rotation, 'day' or 'hour' (default: 'day')
    #[argh(option, long = "split-by")]
    pub split_by: Option<String>,

    /// redaction store directory, 'on' for 'hashdata' next to the executable
    #[argh(option, long = "hash-dir")]
    pub hash_dir: Option<String>,

    /// largest request body accepted, in bytes (default: 2 MiB)
    #[argh(option, long = "body-limit")]
    pub body_limit: Option<usize>,
}

impl Cli {
    /// Logging settings as given on the command line, before defaults.
    pub fn raw_config(&self) -> RawConfig {
        RawConfig {
            log_dir: self.log_dir.clone(),
            split_by: self.split_by.clone(),
            hash_dir: self.hash_dir.clone(),
            body_limit: self.body_limit,
        }
    }
}
