//! `eventproc-core`: value types shared by every layer of the event processor.
//!
//! This crate has no infrastructure concerns: identifiers, priorities, event
//! kinds, parameter flags and the error taxonomy.

pub mod error;
pub mod id;
pub mod kind;
pub mod params;

pub use error::{ProcessorError, ProcessorResult};
pub use id::{DataId, MAX_ID_LEN};
pub use kind::{EventKind, Priority};
pub use params::EventParams;
