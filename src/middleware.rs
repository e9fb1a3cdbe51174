//! axum adapter for a logging [`Chain`].
//!
//! The inbound body is buffered, up to the chain's limit, so the request can
//! be dumped after the downstream service has consumed its own copy. The
//! chain runs on its own task. The client gets the response as soon as its
//! header flushes, and body chunks follow as the downstream service produces
//! them. Post-delegation stages run once the downstream body has ended, and
//! the client's body stream closes after them.

use std::{
    net::SocketAddr,
    sync::{Mutex, PoisonError},
};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use tracing::warn;

use crate::{
    capture::{HttpResponseWriter, ResponseWriter},
    chain::{Chain, ChainResult, Handler, Then},
    context::RequestContext,
    error::ChainError,
};

/// Runs every request through `chain`, with the rest of the router as the
/// endpoint. Install with `axum::middleware::from_fn_with_state`.
pub async fn log_requests(State(chain): State<Chain>, request: Request, next: Next) -> Response {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let (parts, body) = request.into_parts();
    let body = match read_body(body, chain.body_limit()).await {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };

    let (writer, pending) = HttpResponseWriter::channel(parts.version);
    let cx = RequestContext::new(parts, body, Box::new(writer)).with_remote_addr(remote_addr);
    tokio::spawn(run_chain(chain.then(Downstream::new(next)), cx));

    match pending.recv().await {
        Some(response) => response,
        None => {
            warn!("Logging chain ended without a response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Buffers at most `limit` bytes of the request body.
async fn read_body(body: Body, limit: usize) -> Result<Bytes, ChainError> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) if err.is::<LengthLimitError>() => Err(ChainError::PayloadTooLarge(limit)),
        Err(err) => Err(ChainError::RequestBody(axum::Error::new(err))),
    }
}

async fn run_chain(handler: Then<Downstream>, mut cx: RequestContext) {
    if let Err(err) = handler.call(&mut cx).await {
        answer_error(&mut cx, &err);
        warn!(
            error = %err,
            status = cx.response().status_or_default().as_u16(),
            "Request failed inside the logging chain"
        );
    }
    cx.finish();
}

/// Writes the status for `err` unless a status already went out. The
/// downstream `Content-Length` no longer describes the body and is dropped.
fn answer_error(cx: &mut RequestContext, err: &ChainError) {
    if let (None, Some(status)) = (cx.response().status(), err.status()) {
        cx.response_mut().headers_mut().remove(header::CONTENT_LENGTH);
        cx.response_mut().write_header(status);
    }
}

/// The rest of the router, run at most once.
struct Downstream {
    next: Mutex<Option<Next>>,
}

impl Downstream {
    fn new(next: Next) -> Self {
        Self {
            next: Mutex::new(Some(next)),
        }
    }
}

impl Handler for Downstream {
    fn call<'a>(&'a self, cx: &'a mut RequestContext) -> BoxFuture<'a, ChainResult> {
        Box::pin(async move {
            let next = self
                .next
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .ok_or(ChainError::DownstreamConsumed)?;
            let response = next.run(cx.to_request()).await;
            let result = write_response(cx.response_mut(), response).await;
            // answer before the stages unwind so they see the final status
            if let Err(err) = &result {
                answer_error(cx, err);
            }
            result
        })
    }
}

/// Copies `response` into `writer`. Downstream headers replace staged ones
/// of the same name. The status is flushed with the first data frame, so a
/// body that fails before producing data leaves nothing written. Copying
/// stops early when the client goes away.
pub async fn write_response<W>(writer: &mut W, response: Response) -> ChainResult
where
    W: ResponseWriter + ?Sized,
{
    let (parts, mut body): (_, Body) = response.into_parts();
    let headers = writer.headers_mut();
    for name in parts.headers.keys() {
        headers.remove(name);
    }
    for (name, value) in &parts.headers {
        headers.append(name.clone(), value.clone());
    }

    let mut pending = Some(parts.status);
    loop {
        let frame = tokio::select! {
            biased;
            frame = body.frame() => frame,
            () = writer.closed() => return Err(ChainError::ClientClosed),
        };
        let Some(frame) = frame else { break };
        let frame = frame.map_err(ChainError::ResponseBody)?;
        if let Ok(data) = frame.into_data() {
            if let Some(status) = pending.take() {
                writer.write_header(status);
            }
            writer.write(&data);
        }
    }
    if let Some(status) = pending {
        writer.write_header(status);
    }
    Ok(())
}
