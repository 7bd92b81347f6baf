//! HTTP surface of the scheduler (axum)

pub mod form;
pub mod rest;

pub use rest::{create_router, ApiError, ApiState};
