//! Error types.

use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

/// Setup-time configuration errors. Fatal before any request is served.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("zlog split_by must be day or hour, got {0:?}")]
    InvalidSplitBy(String),

    #[error("cannot resolve default directory next to the executable")]
    NoExecutableDir(#[source] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failures opening or appending to a log or redaction destination.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: tracing_appender::rolling::InitError,
    },

    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors raised while a request travels through a chain.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("failed to read request body: {0}")]
    RequestBody(#[source] axum::Error),

    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("failed to read downstream response body: {0}")]
    ResponseBody(#[source] axum::Error),

    #[error("downstream handler already ran for this request")]
    DownstreamConsumed,

    #[error("client closed the connection")]
    ClientClosed,
}

impl ChainError {
    /// Status answered for this error when nothing was written yet. A client
    /// that went away gets nothing.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ChainError::RequestBody(_) => Some(StatusCode::BAD_REQUEST),
            ChainError::PayloadTooLarge(_) => Some(StatusCode::PAYLOAD_TOO_LARGE),
            ChainError::ResponseBody(_) => Some(StatusCode::BAD_GATEWAY),
            ChainError::DownstreamConsumed => Some(StatusCode::INTERNAL_SERVER_ERROR),
            ChainError::ClientClosed => None,
        }
    }
}

impl IntoResponse for ChainError {
    fn into_response(self) -> Response {
        match &self {
            ChainError::RequestBody(err) => {
                error!(error = %err, "Rejecting request with unreadable body")
            }
            ChainError::PayloadTooLarge(limit) => {
                warn!(limit, "Rejecting request body over the limit")
            }
            ChainError::ResponseBody(err) => error!(error = %err, "Downstream response body failed"),
            ChainError::DownstreamConsumed => error!("Downstream handler invoked twice"),
            ChainError::ClientClosed => {}
        }
        self.status()
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response()
    }
}
