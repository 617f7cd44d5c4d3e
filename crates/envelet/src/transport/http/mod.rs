//! HTTP transport via axum.

mod routes;
mod server;

pub use routes::{RecommendationRequest, routes};
pub use server::{ServerConfig, serve};
