//! The stages a logging chain is built from.
//!
//! Field stages copy one value from the request into the request's logger
//! and always delegate. The response-side stages act once the rest of the
//! chain has returned, reading what the endpoint wrote through the capture.

use std::{
    fmt,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::http::{HeaderName, HeaderValue, request::Parts};
use futures::future::BoxFuture;
use tracing::warn;
use ulid::Ulid;

use crate::{
    capture::ResponseWriter,
    chain::{ChainResult, Next, Stage},
    context::RequestContext,
    dump::{dump_request, dump_response},
    logger::{FieldValue, Logger},
    redact::{DEFAULT_THRESHOLD, Redactor},
};

/// Gives every request its own clone of the base logger.
#[derive(Debug, Clone)]
pub struct InstallLogger {
    logger: Logger,
}

impl InstallLogger {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

impl Stage for InstallLogger {
    fn call<'a>(&'a self, cx: &'a mut RequestContext, next: Next<'a>) -> BoxFuture<'a, ChainResult> {
        cx.install_logger(self.logger.for_request());
        next.run(cx)
    }
}

/// Summary of one served request.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessEvent {
    pub method: String,
    pub url: String,
    pub status: u16,
    pub size: usize,
    pub duration: Duration,
}

type AccessCallback = dyn Fn(&RequestContext, &AccessEvent) + Send + Sync;

/// Times the rest of the chain and reports one [`AccessEvent`] per request,
/// whether or not the downstream handler failed.
#[derive(Clone)]
pub struct AccessRecorder {
    record: Arc<AccessCallback>,
}

impl AccessRecorder {
    /// Emits a `debug` record with `method`, `url`, `status`, `size` and
    /// `duration` in milliseconds.
    pub fn new() -> Self {
        Self::with(log_access)
    }

    pub fn with(record: impl Fn(&RequestContext, &AccessEvent) + Send + Sync + 'static) -> Self {
        Self {
            record: Arc::new(record),
        }
    }
}

impl Default for AccessRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AccessRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessRecorder").finish_non_exhaustive()
    }
}

impl Stage for AccessRecorder {
    fn call<'a>(&'a self, cx: &'a mut RequestContext, next: Next<'a>) -> BoxFuture<'a, ChainResult> {
        Box::pin(async move {
            let start = Instant::now();
            let result = next.run(cx).await;
            let event = AccessEvent {
                method: cx.request().method.to_string(),
                url: cx.request().uri.to_string(),
                status: cx.response().status_or_default().as_u16(),
                size: cx.response().bytes_written(),
                duration: start.elapsed(),
            };
            (self.record)(cx, &event);
            result
        })
    }
}

fn log_access(cx: &RequestContext, event: &AccessEvent) {
    let Some(logger) = cx.logger() else {
        return;
    };
    logger
        .debug()
        .str("method", event.method.as_str())
        .str("url", event.url.as_str())
        .uint("status", u64::from(event.status))
        .uint("size", event.size as u64)
        .float("duration", event.duration.as_secs_f64() * 1000.0)
        .msg("");
}

/// Logs the host part of the peer address.
#[derive(Debug, Clone)]
pub struct RemoteAddr {
    field: String,
}

impl RemoteAddr {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl Stage for RemoteAddr {
    fn call<'a>(&'a self, cx: &'a mut RequestContext, next: Next<'a>) -> BoxFuture<'a, ChainResult> {
        if let Some(addr) = cx.remote_addr() {
            let host = addr.ip().to_string();
            cx.update_context(|c| {
                c.str(self.field.as_str(), host);
            });
        }
        next.run(cx)
    }
}

/// Logs a request header under its own name.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    name: String,
}

impl RequestHeader {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn user_agent() -> Self {
        Self::new("User-Agent")
    }

    pub fn referer() -> Self {
        Self::new("Referer")
    }
}

impl Stage for RequestHeader {
    fn call<'a>(&'a self, cx: &'a mut RequestContext, next: Next<'a>) -> BoxFuture<'a, ChainResult> {
        let value = cx
            .request()
            .headers
            .get(self.name.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        if let Some(value) = value {
            cx.update_context(|c| {
                c.str(self.name.as_str(), value);
            });
        }
        next.run(cx)
    }
}

/// What part of the request line a [`RequestField`] logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPart {
    Url,
    Method,
    /// `METHOD URL`
    Line,
}

/// Logs the URL, the method, or both.
#[derive(Debug, Clone)]
pub struct RequestField {
    field: String,
    part: RequestPart,
}

impl RequestField {
    pub fn url(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            part: RequestPart::Url,
        }
    }

    pub fn method(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            part: RequestPart::Method,
        }
    }

    pub fn line(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            part: RequestPart::Line,
        }
    }
}

impl Stage for RequestField {
    fn call<'a>(&'a self, cx: &'a mut RequestContext, next: Next<'a>) -> BoxFuture<'a, ChainResult> {
        let request = cx.request();
        let value = match self.part {
            RequestPart::Url => request.uri.to_string(),
            RequestPart::Method => request.method.to_string(),
            RequestPart::Line => format!("{} {}", request.method, request.uri),
        };
        cx.update_context(|c| {
            c.str(self.field.as_str(), value);
        });
        next.run(cx)
    }
}

/// The request id resolved for a request, available to downstream handlers
/// as a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Returns the id carried by `header` if it is a valid ULID.
pub fn id_from_request(parts: &Parts, header: &str) -> Option<Ulid> {
    parts
        .headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<Ulid>().ok())
}

/// Resolves a request id: the caller's if it parses, a fresh ULID otherwise.
///
/// The id is logged under `field` when that is non-empty, and written to
/// `header` on both the inbound request and the response when the header
/// name is non-empty.
#[derive(Debug, Clone)]
pub struct RequestIdStage {
    field: String,
    header: Option<HeaderName>,
}

impl RequestIdStage {
    pub fn new(field: impl Into<String>, header: &str) -> Self {
        let header = if header.is_empty() {
            None
        } else {
            match HeaderName::from_str(header) {
                Ok(name) => Some(name),
                Err(err) => {
                    warn!(header, error = %err, "Invalid request id header, not propagating ids");
                    None
                }
            }
        };
        Self {
            field: field.into(),
            header,
        }
    }
}

impl Stage for RequestIdStage {
    fn call<'a>(&'a self, cx: &'a mut RequestContext, next: Next<'a>) -> BoxFuture<'a, ChainResult> {
        let supplied = self
            .header
            .as_ref()
            .and_then(|header| id_from_request(cx.request(), header.as_str()));
        let id = supplied.unwrap_or_else(Ulid::new).to_string();

        if !self.field.is_empty() {
            cx.update_context(|c| {
                c.str(self.field.as_str(), id.as_str());
            });
        }
        if let Some(header) = &self.header {
            if let Ok(value) = HeaderValue::from_str(&id) {
                cx.request_mut().headers.insert(header.clone(), value.clone());
                cx.response_mut().headers_mut().insert(header.clone(), value);
            }
        }
        cx.request_mut().extensions.insert(RequestId(id));
        next.run(cx)
    }
}

/// Keeps a response header from ever reaching the client.
#[derive(Debug, Clone)]
pub struct DeleteResponseHeader {
    name: HeaderName,
}

impl DeleteResponseHeader {
    pub fn new(name: HeaderName) -> Self {
        Self { name }
    }
}

impl Stage for DeleteResponseHeader {
    fn call<'a>(&'a self, cx: &'a mut RequestContext, next: Next<'a>) -> BoxFuture<'a, ChainResult> {
        cx.response_mut().delete_header(self.name.clone());
        next.run(cx)
    }
}

/// Native type a response header value is logged as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueKind {
    Bool,
    Int,
    Uint,
    Float,
    #[default]
    Str,
}

impl FromStr for ValueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bool" => Ok(ValueKind::Bool),
            "int" => Ok(ValueKind::Int),
            "uint" => Ok(ValueKind::Uint),
            "float" => Ok(ValueKind::Float),
            "str" => Ok(ValueKind::Str),
            other => Err(format!("unknown value kind {other:?}")),
        }
    }
}

impl ValueKind {
    /// Parses `raw` as this kind, falling back to the raw string.
    pub fn parse(self, raw: &str) -> FieldValue {
        let parsed = match self {
            ValueKind::Bool => parse_bool(raw).map(FieldValue::Bool),
            ValueKind::Int => raw.parse().ok().map(FieldValue::Int),
            ValueKind::Uint => raw.parse().ok().map(FieldValue::Uint),
            ValueKind::Float => raw.parse().ok().map(FieldValue::Float),
            ValueKind::Str => None,
        };
        parsed.unwrap_or_else(|| FieldValue::Str(raw.to_string()))
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Logs a response header, once the response is written, as a typed field
/// keyed by the header name.
#[derive(Debug, Clone)]
pub struct ResponseHeader {
    name: HeaderName,
    field: String,
    kind: ValueKind,
}

impl ResponseHeader {
    pub fn new(name: HeaderName, field: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name,
            field: field.into(),
            kind,
        }
    }

    /// Logs header `name` under the same key.
    pub fn parse(name: &str, kind: ValueKind) -> Result<Self, axum::http::header::InvalidHeaderName> {
        Ok(Self::new(HeaderName::from_str(name)?, name, kind))
    }
}

impl Stage for ResponseHeader {
    fn call<'a>(&'a self, cx: &'a mut RequestContext, next: Next<'a>) -> BoxFuture<'a, ChainResult> {
        Box::pin(async move {
            let result = next.run(cx).await;
            let value = cx
                .response()
                .headers()
                .get(&self.name)
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .filter(|v| !v.is_empty());
            if let Some(raw) = value {
                let value = self.kind.parse(&raw);
                cx.update_context(|c| {
                    c.set(self.field.as_str(), value);
                });
            }
            result
        })
    }
}

/// Logs the request line, captured status, headers and body of the response.
#[derive(Debug, Clone)]
pub struct DumpResponse {
    field: String,
}

impl DumpResponse {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl Stage for DumpResponse {
    fn call<'a>(&'a self, cx: &'a mut RequestContext, next: Next<'a>) -> BoxFuture<'a, ChainResult> {
        Box::pin(async move {
            let result = next.run(cx).await;
            if let Some(logger) = cx.logger() {
                let dump = dump_response(cx.request(), cx.response());
                logger.info().str(&self.field, dump).msg("");
            }
            result
        })
    }
}

/// Logs the full request. With a redaction store attached to the chain,
/// oversized form values are replaced by their hash first.
#[derive(Debug, Clone)]
pub struct DumpRequest {
    field: String,
    threshold: usize,
}

impl DumpRequest {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }
}

impl Stage for DumpRequest {
    fn call<'a>(&'a self, cx: &'a mut RequestContext, next: Next<'a>) -> BoxFuture<'a, ChainResult> {
        Box::pin(async move {
            let result = next.run(cx).await;
            if let Some(logger) = cx.logger() {
                let dump = dump_request(cx.request(), cx.body());
                let dump = match cx.redaction_sink() {
                    Some(sink) => Redactor::new(Arc::clone(sink))
                        .with_threshold(self.threshold)
                        .redact(&dump)
                        .into_owned(),
                    None => dump,
                };
                logger.info().str(&self.field, dump).msg("");
            }
            result
        })
    }
}
