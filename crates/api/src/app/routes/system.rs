use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode};

use eventproc_infra::ProcessRegistry;

use crate::app::dto::CommandRequest;
use crate::app::routes::common::run_command;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// POST /pause - park every worker
pub async fn pause(
    Extension(registry): Extension<Arc<ProcessRegistry>>,
) -> axum::response::Response {
    run_command(registry, "pause".to_string(), None).await
}

/// POST /resume - release every parked worker
pub async fn resume(
    Extension(registry): Extension<Arc<ProcessRegistry>>,
) -> axum::response::Response {
    run_command(registry, "resume".to_string(), None).await
}

/// POST /commands - run a process-wide console command
pub async fn command(
    Extension(registry): Extension<Arc<ProcessRegistry>>,
    Json(body): Json<CommandRequest>,
) -> axum::response::Response {
    run_command(registry, body.command, None).await
}
