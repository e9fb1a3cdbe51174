//! Host endpoints served behind the logging chain.

use axum::{
    body::{Body, Bytes},
    extract::{Extension, Path, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::Response,
};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error};

use crate::{stages::RequestId, state::AppState};

const UNKNOWN_ID: &str = "-";

fn request_id(id: &Option<Extension<RequestId>>) -> &str {
    id.as_ref()
        .map_or(UNKNOWN_ID, |Extension(RequestId(id))| id.as_str())
}

/// Serves a file from the static directory, `index.html` for directories.
pub async fn serve_static(
    State(state): State<Arc<AppState>>,
    id: Option<Extension<RequestId>>,
    uri: Uri,
) -> Result<Response, StatusCode> {
    let path = uri.path().trim_start_matches('/');
    let mut file_path = state.static_dir.join(path);

    if file_path.is_dir() {
        file_path.push("index.html");
    }

    match fs::read(&file_path).await {
        Ok(content) => {
            let mime_type = mime_guess::from_path(&file_path).first_or_octet_stream();
            let mut response = Response::new(Body::from(content));
            if let Ok(value) = HeaderValue::from_str(mime_type.as_ref()) {
                response.headers_mut().insert(header::CONTENT_TYPE, value);
            }
            debug!(req_id = request_id(&id), path = %file_path.display(), "Static file served");
            Ok(response)
        }
        Err(err) => {
            debug!(req_id = request_id(&id), path = %file_path.display(), error = %err, "Static file not found");
            Err(StatusCode::NOT_FOUND)
        }
    }
}

/// Forwards a request under the API prefix to the backend. The request id
/// header set by the chain travels upstream with the other headers.
pub async fn proxy_api(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    id: Option<Extension<RequestId>>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Result<Response, StatusCode> {
    let api_url = format!(
        "{}{}/{}",
        state.api_base_url,
        state.api_path,
        path.trim_start_matches('/')
    );

    let full_url = uri
        .query()
        .map_or(api_url.clone(), |query| format!("{}?{}", api_url, query));

    let mut filtered_headers = HeaderMap::new();
    for (key, value) in headers.iter() {
        if !matches!(
            key.as_str(),
            "host" | "accept-encoding" | "connection" | "keep-alive"
        ) {
            filtered_headers.append(key.clone(), value.clone());
        }
    }

    debug!(req_id = request_id(&id), %method, url = %full_url, "Forwarding to backend");

    let response = state
        .client
        .request(method, &full_url)
        .headers(filtered_headers)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            error!(req_id = request_id(&id), error = %e, "Backend request failed");
            StatusCode::BAD_GATEWAY
        })?;

    let mut builder = Response::builder().status(response.status());
    for (key, value) in response.headers().iter() {
        if !matches!(
            key.as_str(),
            "transfer-encoding" | "content-encoding" | "connection" | "keep-alive"
        ) {
            builder = builder.header(key, value);
        }
    }

    builder
        .body(Body::from_stream(response.bytes_stream()))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
