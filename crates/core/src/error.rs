//! Processor error model.

use thiserror::Error;

/// Result type used across the processor crates.
pub type ProcessorResult<T> = Result<T, ProcessorError>;

/// Processor-level error.
///
/// Storage failures have their own type in the infrastructure layer; this enum
/// covers validation, configuration and lifecycle failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (empty, too long, ...).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A requested processor instance does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A process-wide resource is held by someone else (e.g. the flush slot).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The processor could not be initialised (database, table, recovery).
    #[error("startup failed: {0}")]
    Startup(String),
}

impl ProcessorError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn startup(msg: impl Into<String>) -> Self {
        Self::Startup(msg.into())
    }
}
