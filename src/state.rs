//! Shared application state.

use std::path::PathBuf;

/// Shared application state accessible to all handlers
#[derive(Debug, Clone)]
pub struct AppState {
    /// Base URL of the backend API (e.g. "http://localhost:8081")
    pub api_base_url: String,
    /// Path prefix for API routes (e.g. "/pz")
    pub api_path: String,
    /// Root directory for static file serving
    pub static_dir: PathBuf,
    /// Pooled client reused for every backend call
    pub client: reqwest::Client,
}

impl AppState {
    pub fn new(api: &str, api_path: &str, static_dir: PathBuf) -> Self {
        let api_base_url = if api.starts_with("http") {
            api.to_string()
        } else {
            format!("http://{api}")
        };
        Self {
            api_base_url,
            api_path: api_path.trim_end_matches('/').to_string(),
            static_dir,
            client: reqwest::Client::new(),
        }
    }
}
