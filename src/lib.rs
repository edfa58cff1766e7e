//! Blob upload finalization for a container registry.
//!
//! Guards uploads against blobs the garbage collector is deleting, and
//! registers uploaded or mounted blobs and their project associations
//! exactly once.

pub mod config;
pub mod db;
pub mod distribution;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod repos;
pub mod routes;
pub mod services;
pub mod state;

pub use state::AppState;

/// Build the HTTP application over `state`.
pub fn app(state: AppState) -> axum::Router {
    routes::routes::routes(state)
}
