//! The worker thread: one consumer per processor instance.
//!
//! ```text
//! warm-up ─▶ ┌─▶ paused? ── park until resumed ──┐
//!            │   wait for work (queue condvar)   │
//!            │   dequeue (active mode only)      │
//!            │   drain persistence               │
//!            │   release flush slot if drained   │
//!            │   process record                  │
//!            └── sleep (skipped while flushing) ◀┘
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use eventproc_core::EventKind;
use eventproc_events::{EventRecord, PersistState, ProcessingContext, ProcessingState};

use super::Inner;
use super::control::WorkerState;
use crate::component::Component;
use crate::persist::EventTable;

/// A sleep that can be cut short from another thread.
#[derive(Debug, Default)]
pub(super) struct Sleeper {
    woken: Mutex<bool>,
    cv: Condvar,
}

impl Sleeper {
    pub(super) fn sleep(&self, duration: Duration) {
        let woken = self.woken.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut woken, _) = self
            .cv
            .wait_timeout_while(woken, duration, |w| !*w)
            .unwrap_or_else(PoisonError::into_inner);
        *woken = false;
    }

    pub(super) fn wake(&self) {
        *self.woken.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cv.notify_all();
    }
}

pub(super) fn run<C, T>(inner: Arc<Inner<C, T>>)
where
    C: Component,
    T: EventTable,
{
    info!(processor = %inner.name, "worker started");
    inner.set_state(WorkerState::Sleeping);
    inner.sleeper.sleep(inner.config.warmup());

    while !inner.is_stopped() {
        if inner.registry.is_paused() {
            inner.set_state(WorkerState::PausedGlobally);
            inner.registry.wait_while_paused(&inner.name, &inner.stopped);
            inner.set_state(WorkerState::Sleeping);
            continue;
        }

        let active = inner.active.load(Ordering::Acquire);
        if !inner.queue.wait_for_work(active, inner.config.idle_poll()) {
            inner.finish_flush_if_drained();
            continue;
        }
        if inner.is_stopped() {
            continue;
        }

        // A pause that lands after this check lets at most the one record
        // popped here through; it is honoured at the top of the next cycle.
        let record = if active && !inner.registry.is_paused() {
            inner.queue.dequeue()
        } else {
            None
        };
        if let Some(record) = &record {
            record.set_processing_state(ProcessingState::Processing);
        }

        let summary = inner.persist_pending();
        inner.finish_flush_if_drained();

        match record {
            Some(record) => {
                let busy = process(&inner, record);
                pause_between_cycles(&inner, busy);
            }
            // Storage is failing; do not spin on the retries.
            None if summary.failed > 0 => inner.sleeper.sleep(inner.config.base_sleep()),
            None => {}
        }
    }

    inner.set_state(WorkerState::Stopped);
    info!(processor = %inner.name, "worker stopped");
}

/// Run the component callback for one record. Returns the time it took.
fn process<C, T>(inner: &Inner<C, T>, record: Arc<EventRecord>) -> Duration
where
    C: Component,
    T: EventTable,
{
    inner.set_state(WorkerState::Processing);
    let started = Instant::now();
    inner.set_in_flight(Some((record.clone(), started)));

    let ctx = ProcessingContext::new(inner.name.clone(), &record);
    let outcome = {
        let _guard = ctx.enter();
        panic::catch_unwind(AssertUnwindSafe(|| dispatch(&inner.component, &ctx, &record)))
    };

    match outcome {
        Ok(Ok(())) => {
            inner.counters.processed.fetch_add(1, Ordering::Relaxed);
            debug!(
                processor = %inner.name,
                data_id = %record.data_id(),
                kind = %record.kind(),
                priority = %record.priority(),
                "event processed"
            );
        }
        Ok(Err(err)) => {
            inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                processor = %inner.name,
                data_id = %record.data_id(),
                kind = %record.kind(),
                error = ?err,
                "component callback failed"
            );
        }
        Err(payload) => {
            inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                processor = %inner.name,
                data_id = %record.data_id(),
                kind = %record.kind(),
                panic = panic_message(payload.as_ref()),
                "component callback panicked"
            );
        }
    }

    record.set_processing_state(ProcessingState::Done);
    inner.set_in_flight(None);
    remove_processed(inner, &record);
    inner.set_state(WorkerState::Sleeping);
    started.elapsed()
}

fn dispatch<C: Component>(
    component: &C,
    ctx: &ProcessingContext,
    record: &EventRecord,
) -> anyhow::Result<()> {
    let attributes = record.load_attributes_with(|id| component.load_attributes(id))?;
    match record.kind() {
        EventKind::Delete => component.on_delete(ctx, record, attributes),
        EventKind::Create | EventKind::Update => component.on_update(ctx, record, attributes),
    }
}

/// Delete the stored row of a finished record; retry later if that fails.
fn remove_processed<C, T>(inner: &Inner<C, T>, record: &Arc<EventRecord>)
where
    C: Component,
    T: EventTable,
{
    if !record.persist_state().is_durable() {
        return;
    }
    let _writes = inner.persist_lock.lock().unwrap_or_else(PoisonError::into_inner);
    match inner.gateway.remove_processed(record) {
        Ok(()) => {
            inner.counters.persisted.fetch_add(1, Ordering::Relaxed);
            record.set_persist_state(PersistState::Invalid);
        }
        Err(err) => {
            inner.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                processor = %inner.name,
                data_id = %record.data_id(),
                error = %err,
                "failed to remove processed event"
            );
            record.set_persist_state(PersistState::PendingRemoval);
            inner.queue.schedule_persist(record.clone());
        }
    }
}

/// `base + overhead × live instances + busy × (100 − external wait %) / 100`,
/// skipped entirely while this instance holds the flush slot.
fn pause_between_cycles<C, T>(inner: &Inner<C, T>, busy: Duration)
where
    C: Component,
    T: EventTable,
{
    if inner.registry.is_flusher(&inner.name) || inner.is_stopped() {
        return;
    }
    let live = inner.registry.live_count().max(1) as u32;
    let waiting = u32::from(inner.component.external_wait_percent().min(100));
    let interval = inner.config.base_sleep()
        + inner.config.per_instance_overhead() * live
        + busy * (100 - waiting) / 100;
    inner.sleeper.sleep(interval);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wake_cuts_sleep_short() {
        let sleeper = Arc::new(Sleeper::default());
        let started = Instant::now();
        let waker = {
            let sleeper = sleeper.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                sleeper.wake();
            })
        };
        sleeper.sleep(Duration::from_secs(10));
        waker.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn panic_payloads_are_rendered() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 1");
        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
    }
}
