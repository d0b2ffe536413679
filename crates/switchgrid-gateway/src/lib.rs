//! HTTP API gateway.
//!
//! Exposes the controller registry and the raw key-value store over a small
//! JSON API. Peer switchgrid nodes use the controller endpoints to proxy pin
//! operations for each other; dashboards and tools use the store endpoints.

mod routes;
mod server;

pub use server::{AppState, build_router, start};
