//! Wire-like text renderings of a request and of a captured response.

use std::fmt::Write as _;

use axum::http::{HeaderMap, header, request::Parts};

use crate::capture::{ResponseCapture, ResponseWriter};

/// Renders the request line, `Host`, the remaining headers, a blank line and
/// the body.
pub fn dump_request(parts: &Parts, body: &[u8]) -> String {
    let mut out = String::with_capacity(256 + body.len());
    let target = parts
        .uri
        .path_and_query()
        .map_or("/", |path| path.as_str());
    let _ = write!(out, "{} {} {:?}\r\n", parts.method, target, parts.version);

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| parts.uri.host());
    if let Some(host) = host {
        let _ = write!(out, "Host: {host}\r\n");
    }

    write_headers(&mut out, &parts.headers, |name| {
        *name != header::HOST && *name != header::TRANSFER_ENCODING && *name != header::TRAILER
    });
    out.push_str("\r\n");
    out.push_str(&String::from_utf8_lossy(body));
    out
}

/// Renders the request line, then the captured status line, staged headers
/// and body.
pub fn dump_response(parts: &Parts, response: &ResponseCapture) -> String {
    let mut out = String::with_capacity(256 + response.body().len());
    let _ = write!(out, "{} {} {:?}\r\n", parts.method, parts.uri, parts.version);
    let _ = write!(
        out,
        "{:?} {}\r\n",
        parts.version,
        response.status_or_default()
    );
    write_headers(&mut out, response.headers(), |_| true);
    out.push_str("\r\n");
    out.push_str(&String::from_utf8_lossy(response.body()));
    out
}

fn write_headers(
    out: &mut String,
    headers: &HeaderMap,
    keep: impl Fn(&header::HeaderName) -> bool,
) {
    for (name, value) in headers {
        if !keep(name) {
            continue;
        }
        let value = String::from_utf8_lossy(value.as_bytes());
        let _ = write!(out, "{name}: {value}\r\n");
    }
}
