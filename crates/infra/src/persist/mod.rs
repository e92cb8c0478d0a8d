//! Durable storage boundary for queued events.
//!
//! Each processor instance owns one table, `<name>Events`:
//!
//! | column | type | notes |
//! |---|---|---|
//! | `dataId` | varchar(32) | business key |
//! | `dataIdHash` | int | pre-filter, indexed |
//! | `eventTime` | bigint | epoch millis, qualifies a row within a data id |
//! | `eventUser` | varchar(32) | [`NO_USER`] when absent |
//! | `eventType` | char(1) | `C` / `U` / `D` |
//! | `eventPriority` | char(1) | `0` / `4` / `8` |
//! | `eventParams` | bigint | opaque flags |
//!
//! The [`EventTable`] trait is synchronous: the worker is a plain OS thread and
//! storage calls happen there, never under the queue lock.

pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryEventTable;
pub use sqlite::SqliteEventTable;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use eventproc_core::{DataId, EventKind, EventParams, Priority};
use eventproc_events::EventRecord;

/// Stored in `eventUser` when an event has no actor.
pub const NO_USER: &str = "-";

/// Table name for a processor instance.
pub fn table_name(processor: &str) -> String {
    format!("{processor}Events")
}

/// One row of a processor's event table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRow {
    pub data_id: DataId,
    pub data_id_hash: i32,
    pub event_time: i64,
    pub user: Option<String>,
    pub kind: EventKind,
    pub priority: Priority,
    pub params: EventParams,
}

impl EventRow {
    pub fn from_record(record: &EventRecord) -> Self {
        Self {
            data_id: record.data_id().clone(),
            data_id_hash: record.data_id().hash_code(),
            event_time: record.timestamp(),
            user: record.user().map(str::to_owned),
            kind: record.kind(),
            priority: record.priority(),
            params: record.params(),
        }
    }

    /// Rebuild the record this row was written from (recovery).
    pub fn into_record(self) -> EventRecord {
        EventRecord::restored(
            self.data_id,
            self.event_time,
            self.user,
            self.kind,
            self.priority,
            self.params,
        )
    }

    /// Storage form of the user column.
    pub fn stored_user(&self) -> &str {
        self.user.as_deref().unwrap_or(NO_USER)
    }

    pub(crate) fn user_from_storage(value: String) -> Option<String> {
        (value != NO_USER).then_some(value)
    }
}

/// Storage failure.
///
/// Write failures are never fatal to a running processor: the record stays in
/// its pending state and is retried on the next drain.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("failed to decode stored event: {0}")]
    Decode(String),
}

/// Synchronous access to one processor's event table.
pub trait EventTable: Send + Sync {
    /// Physical table name (for logs).
    fn table(&self) -> &str;

    /// Create the table and its indexes if they do not exist.
    fn ensure_schema(&self) -> Result<(), PersistError>;

    /// Insert rows, as one statement where the backend supports it.
    fn insert_batch(&self, rows: &[EventRow]) -> Result<(), PersistError>;

    /// Rewrite the row keyed by `(dataId, dataIdHash, eventTime)`.
    ///
    /// Returns the number of rows affected.
    fn update(&self, row: &EventRow) -> Result<u64, PersistError>;

    /// Delete every row for a data id.
    fn delete_for(&self, data_id: &DataId) -> Result<u64, PersistError>;

    /// Delete the rows of one data id written at `event_time`.
    fn delete_exact(&self, data_id: &DataId, event_time: i64) -> Result<u64, PersistError>;

    /// All rows, oldest `eventTime` first.
    fn load_all(&self) -> Result<Vec<EventRow>, PersistError>;
}

impl<T> EventTable for Arc<T>
where
    T: EventTable + ?Sized,
{
    fn table(&self) -> &str {
        (**self).table()
    }

    fn ensure_schema(&self) -> Result<(), PersistError> {
        (**self).ensure_schema()
    }

    fn insert_batch(&self, rows: &[EventRow]) -> Result<(), PersistError> {
        (**self).insert_batch(rows)
    }

    fn update(&self, row: &EventRow) -> Result<u64, PersistError> {
        (**self).update(row)
    }

    fn delete_for(&self, data_id: &DataId) -> Result<u64, PersistError> {
        (**self).delete_for(data_id)
    }

    fn delete_exact(&self, data_id: &DataId, event_time: i64) -> Result<u64, PersistError> {
        (**self).delete_exact(data_id, event_time)
    }

    fn load_all(&self) -> Result<Vec<EventRow>, PersistError> {
        (**self).load_all()
    }
}
