use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use eventproc_infra::ProcessRegistry;

pub mod dto;
pub mod errors;
pub mod routes;

/// Build the admin router over `registry`.
///
/// Handlers run registry commands on the blocking pool: they may touch
/// storage or wait for parked workers.
pub fn build_app(registry: Arc<ProcessRegistry>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(registry)))
}
