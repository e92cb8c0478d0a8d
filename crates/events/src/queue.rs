//! The per-processor event queue.
//!
//! Three [`PriorityBuffer`]s (high, normal, low), a dedup index holding the
//! single live record per data id, and a persist-queue of records whose
//! durable state changed since the worker last drained it.
//!
//! All state sits behind one mutex that is only held for in-memory work.
//! Storage I/O never happens here: the worker drains [`EventQueue::persist_events`]
//! and performs the writes unlocked.
//!
//! ## Aggregation
//!
//! Enqueueing an event for a data id that already has a live record never
//! creates a second live record. Depending on kinds and priorities the new
//! event is dropped, cancels the old one (create followed by delete), or
//! replaces it with a merged record that keeps the *original* timestamp and
//! takes the higher priority. See [`EventQueue::enqueue`].
//!
//! ## Starvation
//!
//! Tiers are drained strictly: high before normal before low. A sustained
//! stream of high priority events starves the lower tiers.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::trace;

use eventproc_core::{DataId, EventKind, EventParams, Priority};

use crate::buffer::PriorityBuffer;
use crate::record::{EventRecord, PersistState};

/// Merge strategy for the params of two aggregated events.
pub type ParamsCombiner = Arc<dyn Fn(EventParams, EventParams) -> EventParams + Send + Sync>;

/// The default merge: bitwise OR.
pub fn bitwise_or() -> ParamsCombiner {
    Arc::new(|a, b| a | b)
}

/// Result of [`EventQueue::enqueue`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// New work was created (a fresh record or an escalated replacement).
    ///
    /// `position` counts across tiers, high first, and includes tombstones
    /// that have not been compacted yet.
    Enqueued { position: usize },
    /// An equivalent or stronger record was already queued.
    NoOp,
    /// A delete cancelled a pending create; nothing is left for the data id.
    Cancelled,
}

impl EnqueueOutcome {
    pub fn is_enqueued(self) -> bool {
        matches!(self, EnqueueOutcome::Enqueued { .. })
    }

    pub fn position(self) -> Option<usize> {
        match self {
            EnqueueOutcome::Enqueued { position } => Some(position),
            _ => None,
        }
    }
}

/// Live record counts per tier.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSizes {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub pending_persist: usize,
}

impl QueueSizes {
    pub fn total(&self) -> usize {
        self.high + self.normal + self.low
    }
}

/// Counters of aggregation decisions since the queue was created.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub escalated: u64,
    pub cancelled: u64,
    pub ignored: u64,
    pub dequeued: u64,
}

fn tier(priority: Priority) -> usize {
    match priority {
        Priority::High => 0,
        Priority::Normal => 1,
        Priority::Low => 2,
    }
}

#[derive(Debug, Default)]
struct QueueState {
    tiers: [PriorityBuffer; 3],
    index: HashMap<DataId, Arc<EventRecord>>,
    persist_queue: Vec<Arc<EventRecord>>,
    interrupted: bool,
    stats: QueueStats,
}

impl QueueState {
    fn has_work(&self, include_queue: bool) -> bool {
        (include_queue && !self.index.is_empty()) || !self.persist_queue.is_empty()
    }

    /// Insert a record into its tier and the index; returns its position.
    fn insert(&mut self, record: Arc<EventRecord>, fresh: bool) -> usize {
        let t = tier(record.priority());
        let in_order = fresh
            && self.tiers[t]
                .last_timestamp()
                .is_none_or(|last| last <= record.timestamp());

        self.index.insert(record.data_id().clone(), record.clone());
        let offset = self.tiers[t].append(record, in_order);
        self.tiers[..t].iter().map(PriorityBuffer::len).sum::<usize>() + offset
    }

    fn unindex(&mut self, record: &Arc<EventRecord>) {
        if self
            .index
            .get(record.data_id())
            .is_some_and(|current| Arc::ptr_eq(current, record))
        {
            self.index.remove(record.data_id());
        }
    }

    fn tombstone(&mut self, record: &EventRecord) {
        record.tombstone();
        self.tiers[tier(record.priority())].mark_for_cleanup();
    }

    /// A restored row that did not become the live record must not survive
    /// the next restart. Rows sharing the survivor's timestamp are its own.
    fn discard_restored(&mut self, survivor: &EventRecord, absorbed: &Arc<EventRecord>) {
        if absorbed.is_restored() && absorbed.timestamp() != survivor.timestamp() {
            absorbed.set_persist_state(PersistState::PendingRemoval);
            self.persist_queue.push(absorbed.clone());
        }
    }

    fn cancel(&mut self, old: &Arc<EventRecord>, new: &Arc<EventRecord>) {
        self.index.remove(old.data_id());
        self.tombstone(old);

        // Never written: dropping the pending insert is enough.
        let previous = old.swap_persist_state(PersistState::Invalid);
        if previous.is_durable() || new.is_restored() {
            self.persist_queue.push(Arc::new(old.cleanup_for()));
        }
    }

    fn replace(
        &mut self,
        old: &Arc<EventRecord>,
        new: &Arc<EventRecord>,
        kind: EventKind,
        priority: Priority,
        params: EventParams,
    ) -> usize {
        let user = new.user().or(old.user()).map(str::to_owned);
        let replacement = Arc::new(old.escalated(kind, priority, user, params));

        self.tombstone(old);
        // A concurrent insert of `old` may still land; the duplicate row has
        // the same timestamp and is removed by the same final delete.
        let previous = old.swap_persist_state(PersistState::Invalid);
        replacement.set_persist_state(if previous.is_durable() {
            PersistState::PendingUpdate
        } else {
            PersistState::New
        });
        self.persist_queue.push(replacement.clone());
        self.discard_restored(&replacement, new);

        self.insert(replacement, false)
    }
}

/// Priority-aware, deduplicating, single-consumer event queue.
pub struct EventQueue {
    state: Mutex<QueueState>,
    work: Condvar,
    combine: ParamsCombiner,
}

impl core::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventQueue")
            .field("sizes", &self.sizes())
            .finish_non_exhaustive()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_combiner(bitwise_or())
    }

    pub fn with_combiner(combine: ParamsCombiner) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            work: Condvar::new(),
            combine,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an event, aggregating it with any live record for the same data id.
    ///
    /// With `old` the live record and `new` the incoming one:
    ///
    /// 1. no `old`: `new` is queued (and scheduled for insert unless restored);
    /// 2. delete after create: both cancel, stored rows are cleaned up;
    /// 3. delete after delete: escalates only if `new` has higher priority;
    /// 4. delete after update: becomes a delete at the higher of both priorities;
    /// 5. create/update with higher priority: escalates, keeping `old`'s kind;
    /// 6. anything else is a no-op.
    ///
    /// Replacements keep `old`'s timestamp and are re-sorted into their tier.
    pub fn enqueue(&self, record: EventRecord) -> EnqueueOutcome {
        let new = Arc::new(record);
        let mut guard = self.lock();
        let st = &mut *guard;

        let outcome = match st.index.get(new.data_id()).cloned() {
            None => {
                if !new.is_restored() {
                    st.persist_queue.push(new.clone());
                }
                EnqueueOutcome::Enqueued {
                    position: st.insert(new.clone(), true),
                }
            }
            Some(old) => self.aggregate(st, &old, &new),
        };

        match outcome {
            EnqueueOutcome::Enqueued { position } => {
                st.stats.enqueued += 1;
                trace!(data_id = %new.data_id(), kind = %new.kind(), priority = %new.priority(), position, "event enqueued");
            }
            EnqueueOutcome::NoOp => {
                st.stats.ignored += 1;
                trace!(data_id = %new.data_id(), "event absorbed by queued record");
            }
            EnqueueOutcome::Cancelled => {
                st.stats.cancelled += 1;
                trace!(data_id = %new.data_id(), "create cancelled by delete");
            }
        }

        if st.has_work(true) {
            self.work.notify_all();
        }
        outcome
    }

    fn aggregate(
        &self,
        st: &mut QueueState,
        old: &Arc<EventRecord>,
        new: &Arc<EventRecord>,
    ) -> EnqueueOutcome {
        let params = (self.combine)(old.params(), new.params());
        let position = match (new.kind(), old.kind()) {
            (EventKind::Delete, EventKind::Create) => {
                st.cancel(old, new);
                return EnqueueOutcome::Cancelled;
            }
            (EventKind::Delete, EventKind::Delete) if new.priority() > old.priority() => {
                st.replace(old, new, EventKind::Delete, new.priority(), params)
            }
            (EventKind::Delete, EventKind::Delete) => {
                st.discard_restored(old, new);
                return EnqueueOutcome::NoOp;
            }
            (EventKind::Delete, _) => {
                let priority = old.priority().max(new.priority());
                st.replace(old, new, EventKind::Delete, priority, params)
            }
            (_, kind) if old.priority() < new.priority() => {
                st.replace(old, new, kind, new.priority(), params)
            }
            _ => {
                st.discard_restored(old, new);
                return EnqueueOutcome::NoOp;
            }
        };
        st.stats.escalated += 1;
        EnqueueOutcome::Enqueued { position }
    }

    /// Pop the oldest record of the highest non-empty tier.
    ///
    /// Compacts tombstones first. The record leaves the dedup index, so later
    /// events for the same data id start a fresh record.
    pub fn dequeue(&self) -> Option<Arc<EventRecord>> {
        let mut guard = self.lock();
        let st = &mut *guard;

        for buf in st.tiers.iter_mut() {
            let removed = buf.run_cleanup();
            if removed > 0 {
                trace!(removed, "compacted tombstones");
            }
        }

        for t in 0..st.tiers.len() {
            while let Some(record) = st.tiers[t].remove_first() {
                if record.is_tombstoned() {
                    continue;
                }
                st.unindex(&record);
                st.stats.dequeued += 1;
                return Some(record);
            }
        }
        None
    }

    /// Block until there is work, the queue is interrupted, or `timeout` elapses.
    ///
    /// Work means pending persistence, plus queued records when
    /// `include_queue` is set (passive workers only persist). Returns whether
    /// work is available.
    pub fn wait_for_work(&self, include_queue: bool, timeout: Duration) -> bool {
        let guard = self.lock();
        let (mut guard, _) = self
            .work
            .wait_timeout_while(guard, timeout, |st| {
                !st.interrupted && !st.has_work(include_queue)
            })
            .unwrap_or_else(PoisonError::into_inner);
        guard.interrupted = false;
        guard.has_work(include_queue)
    }

    /// Wake a consumer blocked in [`EventQueue::wait_for_work`].
    pub fn interrupt(&self) {
        self.lock().interrupted = true;
        self.work.notify_all();
    }

    /// Drain records whose durable state changed since the last drain.
    pub fn persist_events(&self) -> Vec<Arc<EventRecord>> {
        std::mem::take(&mut self.lock().persist_queue)
    }

    /// Put records back at the head of the persist-queue (failed writes).
    pub fn requeue_persist(&self, mut records: Vec<Arc<EventRecord>>) {
        if records.is_empty() {
            return;
        }
        let mut st = self.lock();
        records.append(&mut st.persist_queue);
        st.persist_queue = records;
    }

    /// Schedule a write for a record outside the normal aggregation path.
    pub fn schedule_persist(&self, record: Arc<EventRecord>) {
        self.lock().persist_queue.push(record);
        self.work.notify_all();
    }

    /// Discard every queued record from the high tier down to `threshold`.
    ///
    /// `Normal` clears high and normal; `Low` clears everything. Memory only:
    /// stored rows are kept so the records come back on the next start.
    pub fn clear(&self, threshold: Priority) -> Vec<Arc<EventRecord>> {
        let mut guard = self.lock();
        Self::clear_locked(&mut guard, threshold)
    }

    /// Like [`EventQueue::clear`], but also schedules deletion of stored rows.
    pub fn purge(&self, threshold: Priority) -> usize {
        let mut guard = self.lock();
        let discarded = Self::clear_locked(&mut guard, threshold);
        for record in &discarded {
            let previous = record.swap_persist_state(PersistState::Invalid);
            if previous.is_durable() {
                record.set_persist_state(PersistState::PendingRemoval);
                guard.persist_queue.push(record.clone());
            }
        }
        if !guard.persist_queue.is_empty() {
            self.work.notify_all();
        }
        discarded.len()
    }

    fn clear_locked(st: &mut QueueState, threshold: Priority) -> Vec<Arc<EventRecord>> {
        let mut discarded = Vec::new();
        for priority in Priority::DESCENDING.into_iter().filter(|p| *p >= threshold) {
            for record in st.tiers[tier(priority)].drain_all() {
                if record.is_tombstoned() {
                    continue;
                }
                record.tombstone();
                st.unindex(&record);
                discarded.push(record);
            }
        }
        discarded
    }

    pub fn sizes(&self) -> QueueSizes {
        let st = self.lock();
        QueueSizes {
            high: st.tiers[tier(Priority::High)].live_len(),
            normal: st.tiers[tier(Priority::Normal)].live_len(),
            low: st.tiers[tier(Priority::Low)].live_len(),
            pending_persist: st.persist_queue.len(),
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats
    }

    /// Number of live queued records (the size of the dedup index).
    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().index.is_empty()
    }

    /// The live record for a data id, if one is queued.
    pub fn get(&self, data_id: &DataId) -> Option<Arc<EventRecord>> {
        self.lock().index.get(data_id).cloned()
    }

    /// Live records of one tier, in dequeue order.
    pub fn snapshot(&self, priority: Priority) -> Vec<Arc<EventRecord>> {
        self.lock().tiers[tier(priority)]
            .iter()
            .filter(|r| !r.is_tombstoned())
            .cloned()
            .collect()
    }
}
