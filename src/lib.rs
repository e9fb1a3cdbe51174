//! zlog - per-request structured logging middleware for axum.
//!
//! Every request gets its own JSON logger, enriched by a chain of stages,
//! while the response is captured on its way to the client. Oversized POST
//! form values are swapped for their MD5 hash and kept in a side store.

pub mod capture;
pub mod chain;
pub mod cli;
pub mod config;
pub mod context;
pub mod dump;
pub mod error;
pub mod handlers;
pub mod logger;
pub mod middleware;
pub mod pipeline;
pub mod redact;
pub mod sink;
pub mod stages;
pub mod state;
