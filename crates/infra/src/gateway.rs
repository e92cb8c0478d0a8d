//! Translates queue state into durable writes.
//!
//! Each [`PersistState`] maps onto exactly one table operation:
//!
//! | state | operation | afterwards |
//! |---|---|---|
//! | `New` | INSERT (batched above a threshold) | `Persisted` |
//! | `PendingUpdate` | UPDATE by `(dataId, dataIdHash, eventTime)`, INSERT if no row matched | `Persisted` |
//! | `PendingCleanup` | DELETE by `(dataId, dataIdHash)` | `Invalid` |
//! | `PendingRemoval` | DELETE by `(dataId, dataIdHash, eventTime)` | `Invalid` |
//!
//! Writes are best-effort. A failed write leaves the record's state alone and
//! hands the record back to the caller for the next drain.

use std::sync::Arc;

use tracing::{debug, info, warn};

use eventproc_events::{EventRecord, PersistState, ProcessingState};

use crate::persist::{EventRow, EventTable, PersistError};

/// Outcome of one [`PersistenceGateway::sync`] pass.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Successful table operations.
    pub written: usize,
    /// Records whose write failed, in drain order.
    pub failed: Vec<Arc<EventRecord>>,
}

#[derive(Debug)]
pub struct PersistenceGateway<T> {
    processor: Arc<str>,
    table: T,
    batch_threshold: usize,
}

impl<T: EventTable> PersistenceGateway<T> {
    pub fn new(processor: Arc<str>, table: T, batch_threshold: usize) -> Self {
        Self {
            processor,
            table,
            batch_threshold,
        }
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    /// Create the table if needed. Failure here must abort startup.
    pub fn initialize(&self) -> Result<(), PersistError> {
        self.table.ensure_schema()
    }

    /// Load every stored row as a restored record, oldest first.
    ///
    /// Feeding them through the normal enqueue path re-derives whatever
    /// aggregation would have happened without the restart.
    pub fn recover(&self) -> Result<Vec<EventRecord>, PersistError> {
        let rows = self.table.load_all()?;
        info!(
            processor = %self.processor,
            table = self.table.table(),
            rows = rows.len(),
            "loaded stored events"
        );
        Ok(rows.into_iter().map(EventRow::into_record).collect())
    }

    /// Write drained records.
    ///
    /// Records already picked up by the worker are only written when
    /// `include_processing` is set; finished or tombstoned records only carry
    /// their delete markers.
    pub fn sync(&self, records: Vec<Arc<EventRecord>>, include_processing: bool) -> SyncReport {
        let mut report = SyncReport::default();
        let mut inserts = Vec::new();

        for record in records {
            let state = record.persist_state();
            if !state.needs_write() || !eligible(&record, state, include_processing) {
                continue;
            }
            match state {
                PersistState::New => inserts.push(record),
                PersistState::PendingUpdate => self.write_update(record, &mut report),
                PersistState::PendingCleanup => self.write_delete(record, true, &mut report),
                PersistState::PendingRemoval => self.write_delete(record, false, &mut report),
                PersistState::Persisted | PersistState::Invalid => {}
            }
        }

        if inserts.len() > self.batch_threshold {
            self.write_batch(inserts, &mut report);
        } else {
            for record in inserts {
                self.write_batch(vec![record], &mut report);
            }
        }

        if report.written > 0 || !report.failed.is_empty() {
            debug!(
                processor = %self.processor,
                written = report.written,
                failed = report.failed.len(),
                "persist pass complete"
            );
        }
        report
    }

    /// Delete the row of a record that finished processing.
    pub fn remove_processed(&self, record: &EventRecord) -> Result<(), PersistError> {
        self.table
            .delete_exact(record.data_id(), record.timestamp())
            .map(|_| ())
    }

    fn write_batch(&self, records: Vec<Arc<EventRecord>>, report: &mut SyncReport) {
        let rows: Vec<_> = records.iter().map(|r| EventRow::from_record(r)).collect();
        match self.table.insert_batch(&rows) {
            Ok(()) => {
                report.written += records.len();
                for record in &records {
                    if !record.transition_persist_state(PersistState::New, PersistState::Persisted)
                    {
                        // Superseded while the insert was running. Nobody
                        // owns the row now.
                        self.discard_orphan(record);
                    }
                }
            }
            Err(err) => {
                warn!(
                    processor = %self.processor,
                    count = records.len(),
                    error = %err,
                    "failed to insert events"
                );
                report.failed.extend(records);
            }
        }
    }

    fn write_update(&self, record: Arc<EventRecord>, report: &mut SyncReport) {
        let row = EventRow::from_record(&record);
        let result = self.table.update(&row).and_then(|affected| {
            if affected == 0 {
                // Row deleted by a concurrent cleanup; write it afresh.
                self.table.insert_batch(std::slice::from_ref(&row))
            } else {
                Ok(())
            }
        });
        match result {
            Ok(()) => {
                report.written += 1;
                record.transition_persist_state(PersistState::PendingUpdate, PersistState::Persisted);
            }
            Err(err) => {
                warn!(
                    processor = %self.processor,
                    data_id = %record.data_id(),
                    error = %err,
                    "failed to update event"
                );
                report.failed.push(record);
            }
        }
    }

    fn write_delete(&self, record: Arc<EventRecord>, all_rows: bool, report: &mut SyncReport) {
        let result = if all_rows {
            self.table.delete_for(record.data_id())
        } else {
            self.table.delete_exact(record.data_id(), record.timestamp())
        };
        match result {
            Ok(_) => {
                report.written += 1;
                record.set_persist_state(PersistState::Invalid);
            }
            Err(err) => {
                warn!(
                    processor = %self.processor,
                    data_id = %record.data_id(),
                    error = %err,
                    "failed to delete stored event"
                );
                report.failed.push(record);
            }
        }
    }

    fn discard_orphan(&self, record: &EventRecord) {
        if let Err(err) = self.table.delete_exact(record.data_id(), record.timestamp()) {
            warn!(
                processor = %self.processor,
                data_id = %record.data_id(),
                error = %err,
                "failed to remove superseded row"
            );
        }
    }
}

fn eligible(record: &EventRecord, state: PersistState, include_processing: bool) -> bool {
    match record.processing_state() {
        ProcessingState::Queued => true,
        ProcessingState::Processing => include_processing,
        ProcessingState::Done | ProcessingState::Invalid => {
            matches!(state, PersistState::PendingCleanup | PersistState::PendingRemoval)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::InMemoryEventTable;
    use eventproc_core::{DataId, EventKind, Priority};
    use eventproc_events::EventQueue;
    use proptest::prelude::*;

    fn gateway(threshold: usize) -> PersistenceGateway<Arc<InMemoryEventTable>> {
        PersistenceGateway::new(
            Arc::from("test"),
            Arc::new(InMemoryEventTable::new("test")),
            threshold,
        )
    }

    fn event(id: &str, kind: EventKind, priority: Priority, ts: i64) -> EventRecord {
        EventRecord::new(DataId::new(id).unwrap(), kind)
            .with_priority(priority)
            .with_timestamp(ts)
    }

    #[test]
    fn new_records_are_inserted_and_marked_persisted() {
        let gw = gateway(16);
        let queue = EventQueue::new();
        queue.enqueue(event("a", EventKind::Create, Priority::Normal, 1));

        let report = gw.sync(queue.persist_events(), false);
        assert_eq!(report.written, 1);
        assert!(report.failed.is_empty());
        assert_eq!(gw.table().len(), 1);
        assert_eq!(
            queue.get(&DataId::new("a").unwrap()).unwrap().persist_state(),
            PersistState::Persisted
        );
    }

    #[test]
    fn bursts_above_threshold_are_written_as_one_batch() {
        let gw = gateway(2);
        let queue = EventQueue::new();
        for i in 0..5 {
            queue.enqueue(event(&format!("d{i}"), EventKind::Update, Priority::Low, i));
        }
        let report = gw.sync(queue.persist_events(), false);
        assert_eq!(report.written, 5);
        assert_eq!(gw.table().len(), 5);
    }

    #[test]
    fn escalation_of_persisted_record_updates_row_in_place() {
        let gw = gateway(16);
        let queue = EventQueue::new();
        queue.enqueue(event("a", EventKind::Update, Priority::Low, 1));
        gw.sync(queue.persist_events(), false);

        queue.enqueue(event("a", EventKind::Delete, Priority::High, 2));
        gw.sync(queue.persist_events(), false);

        let rows = gw.table().rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, EventKind::Delete);
        assert_eq!(rows[0].priority, Priority::High);
        assert_eq!(rows[0].event_time, 1);
    }

    #[test]
    fn update_without_row_falls_back_to_insert() {
        let gw = gateway(16);
        let record = Arc::new(event("a", EventKind::Update, Priority::High, 3));
        record.set_persist_state(PersistState::PendingUpdate);

        let report = gw.sync(vec![record.clone()], false);
        assert_eq!(report.written, 1);
        assert_eq!(gw.table().len(), 1);
        assert_eq!(record.persist_state(), PersistState::Persisted);
    }

    #[test]
    fn cancelling_a_persisted_create_deletes_all_rows() {
        let gw = gateway(16);
        let queue = EventQueue::new();
        queue.enqueue(event("a", EventKind::Create, Priority::Normal, 1));
        gw.sync(queue.persist_events(), false);
        assert_eq!(gw.table().len(), 1);

        queue.enqueue(event("a", EventKind::Delete, Priority::Normal, 2));
        let pending = queue.persist_events();
        gw.sync(pending.clone(), false);

        assert!(gw.table().is_empty());
        assert!(pending.iter().all(|r| r.persist_state() == PersistState::Invalid));
    }

    #[test]
    fn failed_writes_are_returned_unchanged() {
        let gw = gateway(16);
        gw.table().set_fail_writes(true);
        let queue = EventQueue::new();
        queue.enqueue(event("a", EventKind::Update, Priority::Normal, 1));

        let report = gw.sync(queue.persist_events(), false);
        assert_eq!(report.written, 0);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].persist_state(), PersistState::New);

        gw.table().set_fail_writes(false);
        let report = gw.sync(report.failed, false);
        assert_eq!(report.written, 1);
    }

    #[test]
    fn in_flight_records_are_written_only_on_request() {
        let gw = gateway(16);
        let record = Arc::new(event("a", EventKind::Update, Priority::Normal, 1));
        record.set_processing_state(ProcessingState::Processing);

        gw.sync(vec![record.clone()], false);
        assert!(gw.table().is_empty());

        gw.sync(vec![record.clone()], true);
        assert_eq!(gw.table().len(), 1);
    }

    #[test]
    fn recovery_restores_persisted_records() {
        let gw = gateway(16);
        let queue = EventQueue::new();
        queue.enqueue(event("a", EventKind::Create, Priority::High, 1).with_user("alice"));
        gw.sync(queue.persist_events(), false);

        let restored = gw.recover().unwrap();
        assert_eq!(restored.len(), 1);
        assert!(restored[0].is_restored());
        assert_eq!(restored[0].persist_state(), PersistState::Persisted);
        assert_eq!(restored[0].user(), Some("alice"));
        assert_eq!(restored[0].priority(), Priority::High);
    }

    #[test]
    fn removing_a_processed_row_keeps_a_newer_event_for_the_same_id() {
        let gw = gateway(16);
        let queue = EventQueue::new();
        let doc = DataId::new("doc").unwrap();

        queue.enqueue(EventRecord::new(doc.clone(), EventKind::Update));
        gw.sync(queue.persist_events(), false);
        let first = queue.dequeue().unwrap();

        queue.enqueue(EventRecord::new(doc.clone(), EventKind::Update));
        gw.sync(queue.persist_events(), false);
        assert_eq!(gw.table().len(), 2);

        gw.remove_processed(&first).unwrap();
        let rows = gw.table().rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_time, queue.get(&doc).unwrap().timestamp());
        assert_ne!(rows[0].event_time, first.timestamp());
    }

    #[test]
    fn processed_rows_are_removed_exactly() {
        let gw = gateway(16);
        let queue = EventQueue::new();
        queue.enqueue(event("a", EventKind::Update, Priority::Normal, 1));
        gw.sync(queue.persist_events(), false);
        let record = queue.dequeue().unwrap();

        gw.remove_processed(&record).unwrap();
        assert!(gw.table().is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Notify(u8, EventKind, Priority),
        Sync,
        Process,
        Restart,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        let kind = prop_oneof![
            Just(EventKind::Create),
            Just(EventKind::Update),
            Just(EventKind::Delete)
        ];
        let priority = prop_oneof![
            Just(Priority::Low),
            Just(Priority::Normal),
            Just(Priority::High)
        ];
        prop_oneof![
            6 => (0u8..4, kind, priority).prop_map(|(i, k, p)| Op::Notify(i, k, p)),
            2 => Just(Op::Sync),
            1 => Just(Op::Process),
            1 => Just(Op::Restart),
        ]
    }

    fn live_set(queue: &EventQueue) -> Vec<Option<(EventKind, Priority)>> {
        (0..4)
            .map(|i| {
                queue
                    .get(&DataId::new(format!("d{i}")).unwrap())
                    .map(|r| (r.kind(), r.priority()))
            })
            .collect()
    }

    /// Same steps the worker takes for one record.
    fn process_one(gw: &PersistenceGateway<Arc<InMemoryEventTable>>, queue: &EventQueue) {
        let Some(record) = queue.dequeue() else { return };
        record.set_processing_state(ProcessingState::Processing);
        queue.requeue_persist(gw.sync(queue.persist_events(), false).failed);
        record.set_processing_state(ProcessingState::Done);
        if record.persist_state().is_durable() {
            gw.remove_processed(&record).unwrap();
            record.set_persist_state(PersistState::Invalid);
        }
    }

    fn restart(gw: &PersistenceGateway<Arc<InMemoryEventTable>>, queue: &EventQueue) -> EventQueue {
        gw.sync(queue.persist_events(), false);
        let recovered = EventQueue::new();
        for record in gw.recover().unwrap() {
            recovered.enqueue(record);
        }
        recovered
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: after any history of events, processing and restarts,
        /// the stored rows rebuild exactly the live records that were queued.
        #[test]
        fn recovery_reproduces_the_live_set(ops in prop::collection::vec(op_strategy(), 1..60)) {
            let gw = gateway(2);
            let mut queue = EventQueue::new();
            for op in ops {
                match op {
                    Op::Notify(i, kind, priority) => {
                        let record = EventRecord::new(DataId::new(format!("d{i}")).unwrap(), kind)
                            .with_priority(priority);
                        queue.enqueue(record);
                    }
                    Op::Sync => {
                        gw.sync(queue.persist_events(), false);
                    }
                    Op::Process => process_one(&gw, &queue),
                    Op::Restart => {
                        let before = live_set(&queue);
                        queue = restart(&gw, &queue);
                        prop_assert_eq!(live_set(&queue), before);
                    }
                }
            }

            let before = live_set(&queue);
            let recovered = restart(&gw, &queue);
            prop_assert_eq!(gw.table().len(), queue.len());
            prop_assert_eq!(live_set(&recovered), before);
        }
    }
}

