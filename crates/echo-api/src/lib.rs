//! Axum HTTP API server.
//!
//! This crate provides:
//! - Job submission and status polling
//! - Streaming delivery of finished videos
//! - Rate limiting and security headers
//! - Prometheus metrics

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod services;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use services::{JobProducer, ResultLookup};
pub use state::AppState;
