//! Ordered, growable buffer of records for a single priority tier.
//!
//! The buffer is a contiguous window `[first, last)` inside a slot array.
//! Producers append at `last`; the consumer pops at `first`. Superseded
//! records are tombstoned in place by the queue and only compacted away by
//! [`PriorityBuffer::run_cleanup`], which the consumer calls before each
//! dequeue. Producers therefore never pay for a chain of cancellations.

use std::sync::Arc;

use crate::record::EventRecord;

const MIN_CAPACITY: usize = 16;

#[derive(Debug)]
pub struct PriorityBuffer {
    slots: Vec<Option<Arc<EventRecord>>>,
    first: usize,
    last: usize,
    dirty: bool,
}

impl Default for PriorityBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityBuffer {
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(capacity.max(1), || None);
        Self {
            slots,
            first: 0,
            last: 0,
            dirty: false,
        }
    }

    /// Number of occupied slots, tombstones included.
    pub fn len(&self) -> usize {
        self.last - self.first
    }

    pub fn is_empty(&self) -> bool {
        self.first == self.last
    }

    /// Records that have not been tombstoned.
    pub fn live_len(&self) -> usize {
        self.iter().filter(|r| !r.is_tombstoned()).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Timestamp of the record at the tail, if any.
    pub fn last_timestamp(&self) -> Option<i64> {
        if self.is_empty() {
            return None;
        }
        self.slots[self.last - 1].as_ref().map(|r| r.timestamp())
    }

    /// Records in the window, front to back.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<EventRecord>> {
        self.slots[self.first..self.last].iter().flatten()
    }

    /// Append a record and return its offset within the window.
    ///
    /// With `in_order` the record goes straight to the tail. Otherwise it is
    /// bubbled backwards past every record with a later timestamp, which costs
    /// only as many swaps as there are out-of-order neighbours.
    pub fn append(&mut self, record: Arc<EventRecord>, in_order: bool) -> usize {
        self.reserve_slot();

        let ts = record.timestamp();
        let mut at = self.last;
        self.slots[at] = Some(record);
        self.last += 1;

        if !in_order {
            while at > self.first && self.timestamp_at(at - 1) > ts {
                self.slots.swap(at - 1, at);
                at -= 1;
            }
        }

        at - self.first
    }

    /// Pop the oldest record.
    pub fn remove_first(&mut self) -> Option<Arc<EventRecord>> {
        if self.is_empty() {
            return None;
        }
        let record = self.slots[self.first].take();
        self.first += 1;
        if self.first == self.last {
            self.first = 0;
            self.last = 0;
        }
        record
    }

    /// Signal that tombstones exist and a compaction pass is due.
    pub fn mark_for_cleanup(&mut self) {
        self.dirty = true;
    }

    /// Compact tombstoned records out of the window, preserving order.
    ///
    /// Returns the number of records dropped. A no-op unless marked dirty.
    pub fn run_cleanup(&mut self) -> usize {
        if !self.dirty {
            return 0;
        }
        self.dirty = false;

        let mut write = self.first;
        for read in self.first..self.last {
            match self.slots[read].take() {
                Some(r) if !r.is_tombstoned() => {
                    self.slots[write] = Some(r);
                    write += 1;
                }
                _ => {}
            }
        }

        let removed = self.last - write;
        self.last = write;
        if self.first == self.last {
            self.first = 0;
            self.last = 0;
        }
        removed
    }

    /// Take every record out of the buffer, tombstones included.
    pub fn drain_all(&mut self) -> Vec<Arc<EventRecord>> {
        let drained: Vec<_> = self.slots[self.first..self.last]
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        self.first = 0;
        self.last = 0;
        self.dirty = false;
        drained
    }

    fn timestamp_at(&self, idx: usize) -> i64 {
        self.slots[idx].as_ref().map_or(i64::MIN, |r| r.timestamp())
    }

    /// Make sure `slots[last]` exists: compact to zero when at least half the
    /// array is slack before `first`, otherwise double.
    fn reserve_slot(&mut self) {
        let capacity = self.slots.len();
        if self.last < capacity {
            return;
        }
        if self.first > 0 && self.first >= capacity / 2 {
            self.slots.drain(..self.first);
            self.slots.resize_with(capacity, || None);
            self.last -= self.first;
            self.first = 0;
        } else {
            self.slots.resize_with((capacity * 2).max(MIN_CAPACITY), || None);
        }
    }
}
