//! In-memory event model and queueing.
//!
//! - [`EventRecord`]: one pending change to one data object, with its
//!   processing and persistence state machines.
//! - [`PriorityBuffer`]: an ordered, growable buffer for one priority tier.
//! - [`EventQueue`]: three tiers plus the dedup index that aggregates
//!   repeated events for the same data id.
//! - [`ProcessingContext`]: what a worker is processing, used for priority
//!   inheritance of events emitted from callbacks.

pub mod buffer;
pub mod context;
pub mod queue;
pub mod record;

pub use buffer::PriorityBuffer;
pub use context::{ContextGuard, ProcessingContext, current_priority, resolve_priority};
pub use queue::{
    EnqueueOutcome, EventQueue, ParamsCombiner, QueueSizes, QueueStats, bitwise_or,
};
pub use record::{Attributes, EventRecord, PersistState, ProcessingState};
