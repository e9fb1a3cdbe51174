//! Response writers and the capturing proxy.
//!
//! Downstream code writes a response through [`ResponseWriter`]: staged
//! headers, one status line, then body chunks in any number of calls. The
//! real writer ([`HttpResponseWriter`]) streams what it receives to the
//! client as it arrives. [`ResponseCapture`] sits in front of it, records
//! status and body for post-delegation stages and strips deleted headers
//! before they flush.

use std::convert::Infallible;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, StatusCode, Version},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

/// Sink for an HTTP response written piece by piece.
pub trait ResponseWriter: Send {
    /// Headers staged for the response. Changes after the header flush have
    /// no effect on what the client receives.
    fn headers(&self) -> &HeaderMap;

    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Flushes the status line and staged headers. Only the first call counts.
    fn write_header(&mut self, status: StatusCode);

    /// Writes a body chunk, flushing `200 OK` first if no status was written.
    fn write(&mut self, chunk: &[u8]) -> usize;

    /// Resolves once nobody is left to receive the response.
    fn closed(&self) -> BoxFuture<'_, ()>;

    /// Wraps the writer in a [`ResponseCapture`], reusing an existing one.
    fn into_capture(self: Box<Self>) -> ResponseCapture;

    /// Ends the response. A writer that never flushed sends `200 OK` with
    /// its staged headers and an empty body.
    fn finish(self: Box<Self>);
}

/// The real writer: whatever reaches it is sent to the client, chunk by
/// chunk. The client side is the [`PendingResponse`] returned alongside it.
#[derive(Debug)]
pub struct HttpResponseWriter {
    staged: HeaderMap,
    version: Version,
    head: Option<oneshot::Sender<Response<()>>>,
    body: mpsc::UnboundedSender<Bytes>,
}

/// Client side of an [`HttpResponseWriter`].
#[derive(Debug)]
pub struct PendingResponse {
    head: oneshot::Receiver<Response<()>>,
    body: mpsc::UnboundedReceiver<Bytes>,
}

impl HttpResponseWriter {
    /// A writer for a `version` request, plus the response it produces.
    pub fn channel(version: Version) -> (Self, PendingResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        let writer = Self {
            staged: HeaderMap::new(),
            version,
            head: Some(head_tx),
            body: body_tx,
        };
        let pending = PendingResponse {
            head: head_rx,
            body: body_rx,
        };
        (writer, pending)
    }
}

impl ResponseWriter for HttpResponseWriter {
    fn headers(&self) -> &HeaderMap {
        &self.staged
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.staged
    }

    fn write_header(&mut self, status: StatusCode) {
        if let Some(head) = self.head.take() {
            let mut response = Response::new(());
            *response.status_mut() = status;
            *response.headers_mut() = self.staged.clone();
            *response.version_mut() = self.version;
            // a client that went away is noticed through `closed`
            let _ = head.send(response);
        }
    }

    fn write(&mut self, chunk: &[u8]) -> usize {
        if self.head.is_some() {
            self.write_header(StatusCode::OK);
        }
        if !chunk.is_empty() {
            let _ = self.body.send(Bytes::copy_from_slice(chunk));
        }
        chunk.len()
    }

    fn closed(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.body.closed())
    }

    fn into_capture(self: Box<Self>) -> ResponseCapture {
        ResponseCapture::new(self)
    }

    fn finish(mut self: Box<Self>) {
        if self.head.is_some() {
            self.write_header(StatusCode::OK);
        }
    }
}

impl PendingResponse {
    /// Waits for the header flush. The body keeps streaming until the writer
    /// is finished or dropped. `None` when the writer went away unflushed.
    pub async fn recv(self) -> Option<Response> {
        let Self { head, body } = self;
        let head = head.await.ok()?;
        let chunks = futures::stream::unfold(body, |mut body| async move {
            body.recv()
                .await
                .map(|chunk| (Ok::<_, Infallible>(chunk), body))
        });
        Some(head.map(|()| Body::from_stream(chunks)))
    }
}

/// Proxy that records status, headers and body while forwarding everything
/// unchanged to the wrapped writer.
pub struct ResponseCapture {
    inner: Box<dyn ResponseWriter>,
    source_header: HeaderMap,
    deleted: Vec<HeaderName>,
    status: Option<StatusCode>,
    body: BytesMut,
    bytes_written: usize,
}

impl ResponseCapture {
    /// Wraps `writer`. An already capturing writer is returned as is, so the
    /// body is never buffered twice.
    pub fn wrap(writer: Box<dyn ResponseWriter>) -> Self {
        writer.into_capture()
    }

    /// Builds a fresh proxy around `inner`. Meant for [`ResponseWriter::into_capture`]
    /// implementations; everything else should go through [`ResponseCapture::wrap`].
    pub fn new(inner: Box<dyn ResponseWriter>) -> Self {
        Self {
            source_header: inner.headers().clone(),
            inner,
            deleted: Vec::new(),
            status: None,
            body: BytesMut::new(),
            bytes_written: 0,
        }
    }

    /// Marks `name` so it is never flushed to the client. The staged value
    /// stays readable through [`ResponseCapture::headers`].
    pub fn delete_header(&mut self, name: HeaderName) {
        self.inner.headers_mut().remove(&name);
        if !self.deleted.contains(&name) {
            self.deleted.push(name);
        }
    }

    /// First status written, `None` until the header flushes.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Status as the client sees it; `200` when nothing was written.
    pub fn status_or_default(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    fn flush_headers(&mut self) {
        let target = self.inner.headers_mut();
        target.clear();
        for (name, value) in &self.source_header {
            if !self.deleted.contains(name) {
                target.append(name.clone(), value.clone());
            }
        }
    }
}

impl ResponseWriter for ResponseCapture {
    fn headers(&self) -> &HeaderMap {
        &self.source_header
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.source_header
    }

    fn write_header(&mut self, status: StatusCode) {
        if self.status.is_none() {
            self.status = Some(status);
            self.flush_headers();
        }
        self.inner.write_header(status);
    }

    fn write(&mut self, chunk: &[u8]) -> usize {
        if self.status.is_none() {
            self.write_header(StatusCode::OK);
        }
        let written = self.inner.write(chunk);
        self.body.extend_from_slice(&chunk[..written]);
        self.bytes_written += written;
        written
    }

    fn closed(&self) -> BoxFuture<'_, ()> {
        self.inner.closed()
    }

    fn into_capture(self: Box<Self>) -> ResponseCapture {
        *self
    }

    fn finish(mut self: Box<Self>) {
        if self.status.is_none() {
            self.write_header(StatusCode::OK);
        }
        self.inner.finish();
    }
}

impl std::fmt::Debug for ResponseCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCapture")
            .field("status", &self.status)
            .field("headers", &self.source_header)
            .field("deleted", &self.deleted)
            .field("bytes_written", &self.bytes_written)
            .finish_non_exhaustive()
    }
}
