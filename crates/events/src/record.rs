//! The event record: one pending change to one data object.
//!
//! A record is immutable except for its two state machines (processing and
//! persistence) and its lazily loaded business attributes. Both state machines
//! live in atomics because a record is shared between the queue (producers,
//! under the queue lock) and the worker (unlocked, during persistence and
//! processing).

use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use eventproc_core::{DataId, EventKind, EventParams, Priority};

/// Business attributes of the target object, loaded once per record.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Where a record is in its processing lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ProcessingState {
    Queued = 0,
    Processing = 1,
    Done = 2,
    /// Tombstoned: superseded, cancelled or cleared while still in a buffer.
    Invalid = 3,
}

impl ProcessingState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ProcessingState::Queued,
            1 => ProcessingState::Processing,
            2 => ProcessingState::Done,
            _ => ProcessingState::Invalid,
        }
    }
}

/// Durability lifecycle of a record, independent of its processing state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PersistState {
    /// Not yet written; needs an INSERT.
    New = 0,
    /// A row exists and matches the record.
    Persisted = 1,
    /// A row exists (keyed by the record's timestamp) but is stale; needs an UPDATE.
    PendingUpdate = 2,
    /// Marker record: delete every row for the data id.
    PendingCleanup = 3,
    /// Delete exactly this record's row (absorbed recovery rows, purged records).
    PendingRemoval = 4,
    /// Nothing to write, ever.
    Invalid = 5,
}

impl PersistState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PersistState::New,
            1 => PersistState::Persisted,
            2 => PersistState::PendingUpdate,
            3 => PersistState::PendingCleanup,
            4 => PersistState::PendingRemoval,
            _ => PersistState::Invalid,
        }
    }

    /// Whether a row for this record is (believed to be) on disk.
    pub fn is_durable(self) -> bool {
        matches!(self, PersistState::Persisted | PersistState::PendingUpdate)
    }

    /// Whether the record carries a write the gateway still has to perform.
    pub fn needs_write(self) -> bool {
        matches!(
            self,
            PersistState::New
                | PersistState::PendingUpdate
                | PersistState::PendingCleanup
                | PersistState::PendingRemoval
        )
    }
}

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Current epoch millis, strictly greater than any timestamp handed out or
/// restored before. `eventTime` qualifies a stored row within its data id, so
/// two records created in the same millisecond must not share it.
fn next_timestamp() -> i64 {
    let now = Utc::now().timestamp_millis();
    let step = |prev: i64| Some(now.max(prev + 1));
    match LAST_TIMESTAMP.fetch_update(Ordering::AcqRel, Ordering::Acquire, step) {
        Ok(prev) | Err(prev) => now.max(prev + 1),
    }
}

/// One pending change to one data object.
#[derive(Debug)]
pub struct EventRecord {
    data_id: DataId,
    timestamp: i64,
    user: Option<String>,
    kind: EventKind,
    priority: Priority,
    params: EventParams,
    restored: bool,
    processing: AtomicU8,
    persist: AtomicU8,
    attributes: OnceLock<Attributes>,
}

impl EventRecord {
    /// A fresh event stamped with the current time, `Normal` priority.
    pub fn new(data_id: DataId, kind: EventKind) -> Self {
        Self::with_state(
            data_id,
            next_timestamp(),
            None,
            kind,
            Priority::Normal,
            EventParams::NONE,
            false,
            PersistState::New,
        )
    }

    /// A record rebuilt from a stored row during recovery.
    ///
    /// Starts `Persisted`, so the queue never schedules a second INSERT for it.
    pub fn restored(
        data_id: DataId,
        timestamp: i64,
        user: Option<String>,
        kind: EventKind,
        priority: Priority,
        params: EventParams,
    ) -> Self {
        LAST_TIMESTAMP.fetch_max(timestamp, Ordering::AcqRel);
        Self::with_state(
            data_id,
            timestamp,
            user,
            kind,
            priority,
            params,
            true,
            PersistState::Persisted,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn with_state(
        data_id: DataId,
        timestamp: i64,
        user: Option<String>,
        kind: EventKind,
        priority: Priority,
        params: EventParams,
        restored: bool,
        persist: PersistState,
    ) -> Self {
        Self {
            data_id,
            timestamp,
            user,
            kind,
            priority,
            params,
            restored,
            processing: AtomicU8::new(ProcessingState::Queued as u8),
            persist: AtomicU8::new(persist as u8),
            attributes: OnceLock::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_optional_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn with_params(mut self, params: EventParams) -> Self {
        self.params = params;
        self
    }

    /// Override the creation time (tests, replays).
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Merged replacement for `self`: keeps the original timestamp.
    pub(crate) fn escalated(
        &self,
        kind: EventKind,
        priority: Priority,
        user: Option<String>,
        params: EventParams,
    ) -> Self {
        Self::with_state(
            self.data_id.clone(),
            self.timestamp,
            user,
            kind,
            priority,
            params,
            false,
            PersistState::New,
        )
    }

    /// Marker that deletes every stored row of `self`'s data id.
    pub(crate) fn cleanup_for(&self) -> Self {
        let marker = Self::with_state(
            self.data_id.clone(),
            self.timestamp,
            None,
            self.kind,
            self.priority,
            EventParams::NONE,
            false,
            PersistState::PendingCleanup,
        );
        marker.set_processing_state(ProcessingState::Invalid);
        marker
    }

    pub fn data_id(&self) -> &DataId {
        &self.data_id
    }

    /// Creation time in epoch milliseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn params(&self) -> EventParams {
        self.params
    }

    /// Whether the record was loaded from storage during recovery.
    pub fn is_restored(&self) -> bool {
        self.restored
    }

    pub fn processing_state(&self) -> ProcessingState {
        ProcessingState::from_u8(self.processing.load(Ordering::Acquire))
    }

    pub fn set_processing_state(&self, state: ProcessingState) {
        self.processing.store(state as u8, Ordering::Release);
    }

    pub fn is_tombstoned(&self) -> bool {
        self.processing_state() == ProcessingState::Invalid
    }

    pub(crate) fn tombstone(&self) {
        self.set_processing_state(ProcessingState::Invalid);
    }

    pub fn persist_state(&self) -> PersistState {
        PersistState::from_u8(self.persist.load(Ordering::Acquire))
    }

    pub fn set_persist_state(&self, state: PersistState) {
        self.persist.store(state as u8, Ordering::Release);
    }

    /// Replace the persist state, returning the previous one.
    pub fn swap_persist_state(&self, state: PersistState) -> PersistState {
        PersistState::from_u8(self.persist.swap(state as u8, Ordering::AcqRel))
    }

    /// Move `from` → `to` only if nobody changed the state in between.
    ///
    /// The worker uses this after a write so that a concurrent supersession
    /// (which sets `Invalid`) is never overwritten.
    pub fn transition_persist_state(&self, from: PersistState, to: PersistState) -> bool {
        self.persist
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn attributes(&self) -> Option<&Attributes> {
        self.attributes.get()
    }

    /// Return the attributes, running `load` the first time only.
    pub fn load_attributes_with<E>(
        &self,
        load: impl FnOnce(&DataId) -> Result<Attributes, E>,
    ) -> Result<&Attributes, E> {
        if let Some(attrs) = self.attributes.get() {
            return Ok(attrs);
        }
        let loaded = load(&self.data_id)?;
        Ok(self.attributes.get_or_init(|| loaded))
    }
}
