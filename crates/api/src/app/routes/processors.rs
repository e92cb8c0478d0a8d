//! Per-instance routes.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use eventproc_infra::ProcessRegistry;

use crate::app::dto::{CommandRequest, ProcessorDetail, ProcessorList};
use crate::app::errors::json_error;
use crate::app::routes::common::run_command;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_processors))
        .route("/:name", get(get_processor))
        .route("/:name/commands", post(processor_command))
}

/// GET /processors - size report of every live instance
pub async fn list_processors(
    Extension(registry): Extension<Arc<ProcessRegistry>>,
) -> impl IntoResponse {
    Json(ProcessorList {
        paused: registry.is_paused(),
        flusher: registry.flusher(),
        processors: registry.instances().iter().map(|p| p.report()).collect(),
    })
}

/// GET /processors/:name - size report plus worker dump
pub async fn get_processor(
    Extension(registry): Extension<Arc<ProcessRegistry>>,
    Path(name): Path<String>,
) -> axum::response::Response {
    match registry.get(&name) {
        Some(processor) => Json(ProcessorDetail {
            report: processor.report(),
            worker: processor.dump(),
        })
        .into_response(),
        None => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("unknown processor '{name}'"),
        ),
    }
}

/// POST /processors/:name/commands - run a console command on one instance
pub async fn processor_command(
    Extension(registry): Extension<Arc<ProcessRegistry>>,
    Path(name): Path<String>,
    Json(body): Json<CommandRequest>,
) -> axum::response::Response {
    run_command(registry, body.command, Some(name)).await
}
