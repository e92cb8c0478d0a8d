use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use eventproc_core::DataId;

use super::{EventRow, EventTable, PersistError, table_name};

/// In-memory event table.
///
/// Intended for tests/dev. Writes can be switched to fail to exercise the
/// retry path.
#[derive(Debug)]
pub struct InMemoryEventTable {
    table: String,
    rows: RwLock<Vec<EventRow>>,
    fail_writes: AtomicBool,
}

impl InMemoryEventTable {
    pub fn new(processor: &str) -> Self {
        Self::with_rows(processor, Vec::new())
    }

    /// A table pre-populated with rows, as if left by a previous run.
    pub fn with_rows(processor: &str, rows: Vec<EventRow>) -> Self {
        Self {
            table: table_name(processor),
            rows: RwLock::new(rows),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of the stored rows, in insertion order.
    pub fn rows(&self) -> Vec<EventRow> {
        self.rows.read().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write_rows(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<EventRow>>, PersistError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistError::Storage(format!(
                "simulated write failure on {}",
                self.table
            )));
        }
        self.rows
            .write()
            .map_err(|_| PersistError::Storage("lock poisoned".to_string()))
    }

    fn remove_where(&self, keep: impl Fn(&EventRow) -> bool) -> Result<u64, PersistError> {
        let mut rows = self.write_rows()?;
        let before = rows.len();
        rows.retain(keep);
        Ok((before - rows.len()) as u64)
    }
}

impl EventTable for InMemoryEventTable {
    fn table(&self) -> &str {
        &self.table
    }

    fn ensure_schema(&self) -> Result<(), PersistError> {
        Ok(())
    }

    fn insert_batch(&self, rows: &[EventRow]) -> Result<(), PersistError> {
        self.write_rows()?.extend_from_slice(rows);
        Ok(())
    }

    fn update(&self, row: &EventRow) -> Result<u64, PersistError> {
        let mut rows = self.write_rows()?;
        let mut affected = 0;
        for stored in rows.iter_mut().filter(|r| {
            r.data_id_hash == row.data_id_hash
                && r.data_id == row.data_id
                && r.event_time == row.event_time
        }) {
            *stored = row.clone();
            affected += 1;
        }
        Ok(affected)
    }

    fn delete_for(&self, data_id: &DataId) -> Result<u64, PersistError> {
        let hash = data_id.hash_code();
        self.remove_where(|r| !(r.data_id_hash == hash && &r.data_id == data_id))
    }

    fn delete_exact(&self, data_id: &DataId, event_time: i64) -> Result<u64, PersistError> {
        let hash = data_id.hash_code();
        self.remove_where(|r| {
            !(r.data_id_hash == hash && &r.data_id == data_id && r.event_time == event_time)
        })
    }

    fn load_all(&self) -> Result<Vec<EventRow>, PersistError> {
        let mut rows = self
            .rows
            .read()
            .map_err(|_| PersistError::Storage("lock poisoned".to_string()))?
            .clone();
        rows.sort_by_key(|r| r.event_time);
        Ok(rows)
    }
}
