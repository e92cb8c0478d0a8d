//! Object-safe control surface of a running processor.

use serde::Serialize;

use eventproc_core::{DataId, EventKind, Priority, ProcessorResult};
use eventproc_events::{EnqueueOutcome, QueueSizes};

/// Worker lifecycle state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    Stopped = 0,
    Sleeping = 1,
    Processing = 2,
    PausedGlobally = 3,
}

impl WorkerState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => WorkerState::Sleeping,
            2 => WorkerState::Processing,
            3 => WorkerState::PausedGlobally,
            _ => WorkerState::Stopped,
        }
    }
}

impl core::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Sleeping => "sleeping",
            WorkerState::Processing => "processing",
            WorkerState::PausedGlobally => "paused",
        };
        f.write_str(s)
    }
}

/// Counters since the processor started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    /// Records recovered from storage at start.
    pub recovered: u64,
    /// Callbacks that returned `Ok`.
    pub processed: u64,
    /// Callbacks that failed or panicked.
    pub failed: u64,
    /// Successful table operations.
    pub persisted: u64,
    /// Failed table operations (each is retried).
    pub persist_failures: u64,
    pub escalations: u64,
    pub cancellations: u64,
}

/// Result of an out-of-band persistence pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistSummary {
    pub written: usize,
    pub failed: usize,
}

/// The record a worker is processing right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InFlight {
    pub data_id: DataId,
    pub kind: EventKind,
    pub priority: Priority,
    pub elapsed_ms: u64,
}

/// Diagnostic snapshot of a worker thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerDump {
    pub thread: String,
    pub state: WorkerState,
    pub active: bool,
    pub flushing: bool,
    pub paused: bool,
    pub in_flight: Option<InFlight>,
}

impl core::fmt::Display for WorkerDump {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "thread {}: {} (active={}, flushing={}, paused={})",
            self.thread, self.state, self.active, self.flushing, self.paused
        )?;
        match &self.in_flight {
            Some(r) => write!(
                f,
                "\n  in flight: {} {} priority={} for {}ms",
                r.kind, r.data_id, r.priority, r.elapsed_ms
            ),
            None => write!(f, "\n  idle"),
        }
    }
}

/// Size report of one processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessorReport {
    pub name: String,
    pub state: WorkerState,
    pub active: bool,
    pub flushing: bool,
    pub sizes: QueueSizes,
    pub stats: ProcessorStats,
}

impl core::fmt::Display for ProcessorReport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}: {} high={} normal={} low={} pending_persist={} processed={} failed={}",
            self.name,
            self.state,
            self.sizes.high,
            self.sizes.normal,
            self.sizes.low,
            self.sizes.pending_persist,
            self.stats.processed,
            self.stats.failed
        )
    }
}

/// What the admin console can do to a processor without knowing its
/// component or table types.
pub trait ProcessorControl: Send + Sync {
    fn name(&self) -> &str;

    fn report(&self) -> ProcessorReport;

    /// Enter or leave flush mode. Entering fails while another instance flushes.
    fn set_flush(&self, on: bool) -> ProcessorResult<()>;

    fn set_active(&self, on: bool);

    /// Cut the current inter-cycle sleep short.
    fn wake(&self);

    /// Discard queued records from `High` down to `threshold` and delete their
    /// stored rows. Returns how many records were discarded.
    fn purge(&self, threshold: Priority) -> usize;

    /// Enqueue an event on behalf of an operator.
    fn submit(
        &self,
        kind: EventKind,
        data_id: DataId,
        user: Option<String>,
        priority: Priority,
    ) -> EnqueueOutcome;

    /// Write everything that is still only in memory.
    fn persist_now(&self) -> PersistSummary;

    fn dump(&self) -> WorkerDump;
}
