//! Startup wiring: base logger, standard chain and redaction store.

use std::sync::{Arc, OnceLock};

use axum::http::HeaderName;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

use crate::{
    chain::Chain,
    config::Config,
    logger::{LogWriter, Logger},
    sink::{FileRedactionSink, RedactionSink, open_log_writer},
    stages::{
        AccessRecorder, DeleteResponseHeader, DumpRequest, DumpResponse, InstallLogger, RemoteAddr,
        RequestHeader, RequestIdStage, ResponseHeader, ValueKind,
    },
};

/// Header carrying the request id in both directions.
pub const REQUEST_ID_HEADER: &str = "Request-Id";

/// Response header logged as a float and hidden from clients.
pub const COST_HEADER: &str = "Cost";

/// Static fields stamped on every record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub service: String,
    pub host: String,
}

impl ServiceIdentity {
    /// Executable name and `HOSTNAME`, with fallbacks.
    pub fn detect() -> Self {
        let service = std::env::current_exe()
            .ok()
            .and_then(|exe| {
                exe.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|host| !host.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        Self { service, host }
    }
}

/// The assembled middleware: the base logger and the chain built around it.
/// A pipeline opened from config owns the log stream's worker; dropping the
/// last clone flushes it.
#[derive(Debug, Clone)]
pub struct Pipeline {
    logger: Logger,
    chain: Chain,
    guard: Option<Arc<WorkerGuard>>,
}

static GLOBAL: OnceLock<Pipeline> = OnceLock::new();

impl Pipeline {
    /// Builds the standard chain in its fixed order.
    pub fn new(logger: Logger, sink: Option<Arc<dyn RedactionSink>>) -> Self {
        let chain = Chain::new()
            .append(InstallLogger::new(logger.clone()))
            .append(AccessRecorder::new())
            .append(RemoteAddr::new("server"))
            .append(RequestHeader::new("X-Forwarded-For"))
            .append(RequestHeader::user_agent())
            .append(RequestHeader::referer())
            .append(RequestIdStage::new("req_id", REQUEST_ID_HEADER))
            // keep in order
            .append(DeleteResponseHeader::new(HeaderName::from_static("cost")))
            .append(ResponseHeader::new(
                HeaderName::from_static("cost"),
                COST_HEADER,
                ValueKind::Float,
            ))
            .append(DumpResponse::new("response"))
            .append(DumpRequest::new("request"))
            .with_redaction_sink(sink);
        Self {
            logger,
            chain,
            guard: None,
        }
    }

    /// Caps how many request body bytes the middleware buffers.
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.chain = self.chain.with_body_limit(limit);
        self
    }

    /// Opens the configured destinations and builds the standard chain.
    /// Unusable directories degrade to stdout logging and no redaction.
    pub fn from_config(config: &Config, identity: &ServiceIdentity) -> Self {
        let (writer, guard) = open_log_writer(&config.log_dir, config.split_by);
        let sink = config
            .hash_dir
            .as_deref()
            .and_then(|dir| FileRedactionSink::open_optional(dir, config.split_by));
        Self {
            guard: Some(Arc::new(guard)),
            ..Self::new(base_logger(writer, identity), sink).with_body_limit(config.body_limit)
        }
    }

    /// Process-wide pipeline, built from `config` on first use. Later calls
    /// return the first pipeline and ignore their argument.
    pub fn global(config: &Config) -> &'static Pipeline {
        GLOBAL.get_or_init(|| {
            info!(log_dir = %config.log_dir.display(), "Building global request logging pipeline");
            Self::from_config(config, &ServiceIdentity::detect())
        })
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }
}

/// Base logger carrying the `service` and `host` fields.
pub fn base_logger(writer: LogWriter, identity: &ServiceIdentity) -> Logger {
    Logger::new(writer)
        .with_field("service", identity.service.as_str())
        .with_field("host", identity.host.as_str())
}
