//! HTTP adapter and lifecycle wiring for the package triage service.

pub mod auth;
pub mod routes;

pub use routes::AppState;
pub use routes::create_router;
