use axum::{
    Router,
    routing::{get, post},
};

pub mod common;
pub mod processors;
pub mod system;

/// Router for the admin endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/pause", post(system::pause))
        .route("/resume", post(system::resume))
        .route("/commands", post(system::command))
        .nest("/processors", processors::router())
}
