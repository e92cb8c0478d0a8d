use std::sync::Arc;

use axum::{Json, http::StatusCode, response::IntoResponse};
use tracing::info;

use eventproc_infra::{AdminCommand, ProcessRegistry};

use crate::app::dto::CommandResponse;
use crate::app::errors::{admin_error_to_response, json_error};

/// Parse `line` and run it against `target` on the blocking pool.
pub async fn run_command(
    registry: Arc<ProcessRegistry>,
    line: String,
    target: Option<String>,
) -> axum::response::Response {
    let command = match AdminCommand::parse(&line) {
        Ok(command) => command,
        Err(e) => return admin_error_to_response(e),
    };
    if command.is_global() && target.is_some() {
        return json_error(
            StatusCode::BAD_REQUEST,
            "invalid_argument",
            format!("'{line}' applies to all processors; use POST /commands"),
        );
    }

    info!(command = %line, processor = target.as_deref().unwrap_or("*"), "admin command");
    let executed = {
        let target = target.clone();
        tokio::task::spawn_blocking(move || command.execute(&registry, target.as_deref())).await
    };

    match executed {
        Ok(Ok(output)) => Json(CommandResponse {
            processor: target,
            command: line,
            output,
        })
        .into_response(),
        Ok(Err(e)) => admin_error_to_response(e),
        Err(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            format!("command task failed: {e}"),
        ),
    }
}
