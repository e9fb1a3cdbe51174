//! Reverse proxy and static file server with per-request JSON logging.
//!
//! Features:
//! - Routes API requests to a backend server
//! - Serves static files from a directory
//! - One JSON log stream per process, rotated daily or hourly
//! - Request ids propagated to the backend and back to the client
//! - Oversized form values redacted into a separate hash store

use axum::{
    Router,
    middleware,
    routing::{any, get},
};
use std::{net::SocketAddr, process::ExitCode, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use zlog::{
    cli::Cli,
    config::Config,
    handlers::{proxy_api, serve_static},
    middleware::log_requests,
    pipeline::{Pipeline, ServiceIdentity},
    state::AppState,
};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Cli = argh::from_env();

    let config = match Config::provision(args.raw_config()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Invalid logging configuration");
            return ExitCode::FAILURE;
        }
    };

    let static_dir = match args.static_dir.canonicalize() {
        Ok(dir) => dir,
        Err(err) => {
            error!(dir = %args.static_dir.display(), error = %err, "Failed to canonicalize static directory");
            return ExitCode::FAILURE;
        }
    };

    let pipeline = Pipeline::from_config(&config, &ServiceIdentity::detect());
    let state = Arc::new(AppState::new(&args.api, &args.api_path, static_dir));

    let app = Router::new()
        .route(&format!("{}/{{*path}}", state.api_path), any(proxy_api))
        .fallback(get(serve_static))
        .layer(middleware::from_fn_with_state(
            pipeline.chain().clone(),
            log_requests,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    info!("Serving static files from: {:?}", state.static_dir);
    info!(
        "Proxying {}/* to: {}{}/",
        state.api_path, state.api_base_url, state.api_path
    );
    info!(
        log_dir = %config.log_dir.display(),
        split_by = %config.split_by,
        redaction = config.hash_dir.is_some(),
        body_limit = config.body_limit,
        "Request logging enabled"
    );

    let listener = match tokio::net::TcpListener::bind(args.bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(bind = %args.bind, error = %err, "Failed to bind");
            return ExitCode::FAILURE;
        }
    };
    info!("Server running on: http://{}", args.bind);

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        error!(error = %err, "Server error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
