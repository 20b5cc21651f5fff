//! HTTP API.
//!
//! - `routes`: shared state, router assembly and the server loop
//! - `generation`: deck generation, retries and image serving
//! - `history`: history records, task scans and exports
//! - `providers`: provider configuration and runtime overrides

mod generation;
mod history;
mod providers;
pub mod routes;

pub use routes::{app, serve, AppState};
