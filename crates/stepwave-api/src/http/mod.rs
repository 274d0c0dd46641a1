//! HTTP/REST API layer for Stepwave.
//!
//! Axum-based REST API at `/api/v1/` with an envelope response format,
//! CORS support, and an SSE status stream per instance.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
