//! Per-request state threaded through a chain.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Body,
    http::{Request, request::Parts},
};
use bytes::Bytes;

use crate::{
    capture::{ResponseCapture, ResponseWriter},
    logger::{ContextLogger, Fields},
    sink::RedactionSink,
};

/// Everything a stage may read or change for one request: the inbound
/// request with its buffered body, the request's own logger and the single
/// capturing writer in front of the client.
#[derive(Debug)]
pub struct RequestContext {
    parts: Parts,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
    logger: Option<ContextLogger>,
    response: ResponseCapture,
    redaction_sink: Option<Arc<dyn RedactionSink>>,
}

impl RequestContext {
    pub fn new(parts: Parts, body: Bytes, writer: Box<dyn ResponseWriter>) -> Self {
        Self {
            parts,
            body,
            remote_addr: None,
            logger: None,
            response: ResponseCapture::wrap(writer),
            redaction_sink: None,
        }
    }

    pub fn from_request(request: Request<Bytes>, writer: Box<dyn ResponseWriter>) -> Self {
        let (parts, body) = request.into_parts();
        Self::new(parts, body, writer)
    }

    pub fn with_remote_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.remote_addr = addr;
        self
    }

    pub fn request(&self) -> &Parts {
        &self.parts
    }

    pub fn request_mut(&mut self) -> &mut Parts {
        &mut self.parts
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// The request's logger, if one was installed.
    pub fn logger(&self) -> Option<&ContextLogger> {
        self.logger.as_ref()
    }

    pub fn install_logger(&mut self, logger: ContextLogger) {
        self.logger = Some(logger);
    }

    /// Adds or overwrites fields on the request's logger. Without an
    /// installed logger this does nothing.
    pub fn update_context(&mut self, f: impl FnOnce(&mut Fields)) {
        if let Some(logger) = self.logger.as_mut() {
            logger.update_context(f);
        }
    }

    pub fn response(&self) -> &ResponseCapture {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut ResponseCapture {
        &mut self.response
    }

    pub fn redaction_sink(&self) -> Option<&Arc<dyn RedactionSink>> {
        self.redaction_sink.as_ref()
    }

    pub(crate) fn set_redaction_sink(&mut self, sink: Option<Arc<dyn RedactionSink>>) {
        self.redaction_sink = sink;
    }

    /// Rebuilds the inbound request for a downstream service.
    pub fn to_request(&self) -> Request<Body> {
        Request::from_parts(self.parts.clone(), Body::from(self.body.clone()))
    }

    /// Consumes the context and ends the response.
    pub fn finish(self) {
        Box::new(self.response).finish();
    }
}
