//! axum handlers translating HTTP requests into service calls.

pub mod bucket_handlers;
pub mod file_handlers;
pub mod health_handlers;
pub mod object_handlers;
