use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use eventproc_core::ProcessorError;
use eventproc_infra::AdminError;

pub fn admin_error_to_response(err: AdminError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        AdminError::Empty | AdminError::UnknownCommand(_) => {
            json_error(StatusCode::BAD_REQUEST, "unknown_command", message)
        }
        AdminError::MissingArgument(_) | AdminError::InvalidArgument(_) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_argument", message)
        }
        AdminError::UnknownProcessor(_) => json_error(StatusCode::NOT_FOUND, "not_found", message),
        AdminError::Processor(err) => processor_error_to_response(err),
    }
}

pub fn processor_error_to_response(err: ProcessorError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        ProcessorError::Conflict(_) => json_error(StatusCode::CONFLICT, "conflict", message),
        ProcessorError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", message),
        ProcessorError::Validation(_)
        | ProcessorError::InvalidId(_)
        | ProcessorError::InvalidConfig(_) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", message)
        }
        ProcessorError::Startup(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "startup_error", message)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
