use serde::{Deserialize, Serialize};

use eventproc_infra::{ProcessorReport, WorkerDump};

/// Body of `POST /commands` and `POST /processors/:name/commands`.
#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processor: Option<String>,
    pub command: String,
    pub output: String,
}

#[derive(Debug, Serialize)]
pub struct ProcessorDetail {
    #[serde(flatten)]
    pub report: ProcessorReport,
    pub worker: WorkerDump,
}

#[derive(Debug, Serialize)]
pub struct ProcessorList {
    pub paused: bool,
    pub flusher: Option<String>,
    pub processors: Vec<ProcessorReport>,
}
