//! Processing context and priority inheritance.
//!
//! While a worker runs a component callback it enters a [`ProcessingContext`].
//! Events emitted from inside the callback without an explicit priority take
//! the priority of the record being processed instead of `Normal`. The context
//! is handed to the callback explicitly; a thread-local copy of the priority
//! also covers emission paths that cannot thread the context through.

use std::cell::Cell;
use std::sync::Arc;

use eventproc_core::{DataId, Priority};

use crate::record::EventRecord;

thread_local! {
    static CURRENT_PRIORITY: Cell<Option<Priority>> = const { Cell::new(None) };
}

/// Priority of the record the calling thread is processing, if any.
pub fn current_priority() -> Option<Priority> {
    CURRENT_PRIORITY.with(Cell::get)
}

/// Priority for a newly emitted event: explicit, else inherited, else `Normal`.
pub fn resolve_priority(explicit: Option<Priority>) -> Priority {
    explicit.or_else(current_priority).unwrap_or_default()
}

/// Describes the record a worker is currently processing.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    processor: Arc<str>,
    data_id: DataId,
    priority: Priority,
}

impl ProcessingContext {
    pub fn new(processor: Arc<str>, record: &EventRecord) -> Self {
        Self {
            processor,
            data_id: record.data_id().clone(),
            priority: record.priority(),
        }
    }

    /// Name of the processor instance running the callback.
    pub fn processor(&self) -> &str {
        &self.processor
    }

    pub fn data_id(&self) -> &DataId {
        &self.data_id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Priority for an event emitted from within this context.
    pub fn inherit(&self, explicit: Option<Priority>) -> Priority {
        explicit.unwrap_or(self.priority)
    }

    /// Publish this context's priority to the current thread until the guard drops.
    pub fn enter(&self) -> ContextGuard {
        let previous = CURRENT_PRIORITY.with(|c| c.replace(Some(self.priority)));
        ContextGuard { previous }
    }
}

/// Restores the previous thread-local priority on drop.
#[derive(Debug)]
pub struct ContextGuard {
    previous: Option<Priority>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT_PRIORITY.with(|c| c.set(self.previous));
    }
}
