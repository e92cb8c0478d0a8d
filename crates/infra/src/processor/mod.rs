//! A running processor instance: queue, persistence, worker thread.
//!
//! `EventProcessor::start` recovers stored events, registers the instance
//! with its [`ProcessRegistry`] and spawns the worker. Producers call the
//! `notify_*` methods from any thread; they only ever take the queue lock.

pub mod control;
mod worker;

pub use control::{
    InFlight, PersistSummary, ProcessorControl, ProcessorReport, ProcessorStats, WorkerDump,
    WorkerState,
};

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use tracing::{error, info};

use eventproc_core::{
    DataId, EventKind, EventParams, Priority, ProcessorError, ProcessorResult,
};
use eventproc_events::{
    EnqueueOutcome, EventQueue, EventRecord, ProcessingContext, QueueSizes, resolve_priority,
};

use crate::component::Component;
use crate::config::ProcessorConfig;
use crate::gateway::PersistenceGateway;
use crate::persist::EventTable;
use crate::registry::ProcessRegistry;
use worker::Sleeper;

#[derive(Debug, Default)]
struct Counters {
    recovered: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    persisted: AtomicU64,
    persist_failures: AtomicU64,
}

/// State shared between the handle and the worker thread.
struct Inner<C, T> {
    name: Arc<str>,
    config: ProcessorConfig,
    component: Arc<C>,
    queue: EventQueue,
    gateway: PersistenceGateway<T>,
    registry: Arc<ProcessRegistry>,
    active: AtomicBool,
    stopped: AtomicBool,
    state: AtomicU8,
    sleeper: Sleeper,
    /// Serialises table writes between the worker and `persist_now`.
    persist_lock: Mutex<()>,
    in_flight: Mutex<Option<(Arc<EventRecord>, Instant)>>,
    counters: Counters,
}

impl<C, T> Inner<C, T>
where
    C: Component,
    T: EventTable,
{
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn set_in_flight(&self, record: Option<(Arc<EventRecord>, Instant)>) {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = record;
    }

    fn enqueue(&self, record: EventRecord) -> EnqueueOutcome {
        self.queue.enqueue(record)
    }

    /// Write whatever the queue has accumulated; failed writes go back.
    fn persist_pending(&self) -> PersistSummary {
        let _writes = self.persist_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let pending = self.queue.persist_events();
        if pending.is_empty() {
            return PersistSummary::default();
        }

        let report = self
            .gateway
            .sync(pending, self.component.persist_in_flight());
        let summary = PersistSummary {
            written: report.written,
            failed: report.failed.len(),
        };
        self.counters
            .persisted
            .fetch_add(summary.written as u64, Ordering::Relaxed);
        self.counters
            .persist_failures
            .fetch_add(summary.failed as u64, Ordering::Relaxed);
        self.queue.requeue_persist(report.failed);
        summary
    }

    fn finish_flush_if_drained(&self) {
        if self.queue.is_empty() && self.registry.end_flush(&self.name) {
            info!(processor = %self.name, "queue drained, flush complete");
        }
    }

    fn stats(&self) -> ProcessorStats {
        let queue = self.queue.stats();
        ProcessorStats {
            recovered: self.counters.recovered.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            persist_failures: self.counters.persist_failures.load(Ordering::Relaxed),
            escalations: queue.escalated,
            cancellations: queue.cancelled,
        }
    }
}

impl<C, T> ProcessorControl for Inner<C, T>
where
    C: Component,
    T: EventTable,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn report(&self) -> ProcessorReport {
        ProcessorReport {
            name: self.name.to_string(),
            state: self.state(),
            active: self.active.load(Ordering::Acquire),
            flushing: self.registry.is_flusher(&self.name),
            sizes: self.queue.sizes(),
            stats: self.stats(),
        }
    }

    fn set_flush(&self, on: bool) -> ProcessorResult<()> {
        if on {
            self.registry.try_begin_flush(&self.name)?;
            self.sleeper.wake();
        } else {
            self.registry.end_flush(&self.name);
        }
        Ok(())
    }

    fn set_active(&self, on: bool) {
        if self.active.swap(on, Ordering::AcqRel) != on {
            info!(processor = %self.name, active = on, "worker mode changed");
            self.queue.interrupt();
        }
    }

    fn wake(&self) {
        self.sleeper.wake();
    }

    fn purge(&self, threshold: Priority) -> usize {
        let discarded = self.queue.purge(threshold);
        info!(processor = %self.name, %threshold, discarded, "queue purged");
        discarded
    }

    fn submit(
        &self,
        kind: EventKind,
        data_id: DataId,
        user: Option<String>,
        priority: Priority,
    ) -> EnqueueOutcome {
        self.enqueue(
            EventRecord::new(data_id, kind)
                .with_optional_user(user)
                .with_priority(priority),
        )
    }

    fn persist_now(&self) -> PersistSummary {
        self.persist_pending()
    }

    fn dump(&self) -> WorkerDump {
        let in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(record, started)| InFlight {
                data_id: record.data_id().clone(),
                kind: record.kind(),
                priority: record.priority(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        WorkerDump {
            thread: thread_name(&self.name),
            state: self.state(),
            active: self.active.load(Ordering::Acquire),
            flushing: self.registry.is_flusher(&self.name),
            paused: self.registry.is_paused(),
            in_flight,
        }
    }
}

fn thread_name(processor: &str) -> String {
    format!("eventproc-{processor}")
}

/// Handle to a running processor instance.
///
/// Dropping the handle shuts the processor down.
pub struct EventProcessor<C, T>
where
    C: Component,
    T: EventTable + 'static,
{
    inner: Arc<Inner<C, T>>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<C, T> core::fmt::Debug for EventProcessor<C, T>
where
    C: Component,
    T: EventTable + 'static,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventProcessor")
            .field("name", &self.inner.name)
            .field("state", &self.inner.state())
            .field("sizes", &self.inner.queue.sizes())
            .finish()
    }
}

impl<C, T> EventProcessor<C, T>
where
    C: Component,
    T: EventTable + 'static,
{
    /// Prepare the table, recover stored events and spawn the worker.
    ///
    /// Any failure here is fatal: the processor does not start.
    pub fn start(
        config: ProcessorConfig,
        component: C,
        table: T,
        registry: Arc<ProcessRegistry>,
    ) -> ProcessorResult<Self> {
        config.validate()?;
        let name: Arc<str> = Arc::from(config.name.as_str());

        let gateway = PersistenceGateway::new(name.clone(), table, config.batch_insert_threshold);
        gateway.initialize().map_err(|e| {
            error!(processor = %name, error = %e, "failed to prepare event table");
            ProcessorError::startup(format!("{name}: {e}"))
        })?;

        let component = Arc::new(component);
        let queue = {
            let component = component.clone();
            EventQueue::with_combiner(Arc::new(move |older: EventParams, newer: EventParams| {
                component.combine_params(older, newer)
            }))
        };

        let restored = gateway.recover().map_err(|e| {
            error!(processor = %name, error = %e, "failed to recover stored events");
            ProcessorError::startup(format!("{name}: {e}"))
        })?;
        let recovered = restored.len() as u64;
        for record in restored {
            queue.enqueue(record);
        }

        let inner = Arc::new(Inner {
            name: name.clone(),
            active: AtomicBool::new(config.active),
            config,
            component,
            queue,
            gateway,
            registry: registry.clone(),
            stopped: AtomicBool::new(false),
            state: AtomicU8::new(WorkerState::Stopped as u8),
            sleeper: Sleeper::default(),
            persist_lock: Mutex::new(()),
            in_flight: Mutex::new(None),
            counters: Counters::default(),
        });
        inner.counters.recovered.store(recovered, Ordering::Relaxed);

        let control: Arc<dyn ProcessorControl> = inner.clone();
        registry.register(&name, Arc::downgrade(&control))?;

        let worker_inner = inner.clone();
        let join = thread::Builder::new()
            .name(thread_name(&name))
            .spawn(move || worker::run(worker_inner))
            .map_err(|e| {
                registry.deregister(&name);
                ProcessorError::startup(format!("{name}: failed to spawn worker: {e}"))
            })?;

        info!(
            processor = %name,
            recovered,
            live = inner.queue.len(),
            "processor started"
        );
        Ok(Self {
            inner,
            join: Mutex::new(Some(join)),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue a prepared record as is.
    pub fn enqueue(&self, record: EventRecord) -> EnqueueOutcome {
        self.inner.enqueue(record)
    }

    /// Enqueue an event. `priority: None` inherits the priority of the record
    /// the calling worker thread is processing, else `Normal`.
    pub fn notify(
        &self,
        kind: EventKind,
        data_id: DataId,
        user: Option<String>,
        priority: Option<Priority>,
        params: EventParams,
    ) -> EnqueueOutcome {
        self.inner.enqueue(
            EventRecord::new(data_id, kind)
                .with_optional_user(user)
                .with_priority(resolve_priority(priority))
                .with_params(params),
        )
    }

    pub fn notify_created(
        &self,
        data_id: DataId,
        user: Option<String>,
        priority: Option<Priority>,
    ) -> EnqueueOutcome {
        self.notify(EventKind::Create, data_id, user, priority, EventParams::NONE)
    }

    pub fn notify_updated(
        &self,
        data_id: DataId,
        user: Option<String>,
        priority: Option<Priority>,
    ) -> EnqueueOutcome {
        self.notify(EventKind::Update, data_id, user, priority, EventParams::NONE)
    }

    pub fn notify_deleted(
        &self,
        data_id: DataId,
        user: Option<String>,
        priority: Option<Priority>,
    ) -> EnqueueOutcome {
        self.notify(EventKind::Delete, data_id, user, priority, EventParams::NONE)
    }

    /// Enqueue from inside a callback, inheriting the context's priority
    /// unless one is given.
    pub fn notify_in(
        &self,
        ctx: &ProcessingContext,
        kind: EventKind,
        data_id: DataId,
        user: Option<String>,
        priority: Option<Priority>,
    ) -> EnqueueOutcome {
        self.inner.enqueue(
            EventRecord::new(data_id, kind)
                .with_optional_user(user)
                .with_priority(ctx.inherit(priority)),
        )
    }

    pub fn queue_sizes(&self) -> QueueSizes {
        self.inner.queue.sizes()
    }

    /// The live record for a data id, if one is queued.
    pub fn queued(&self, data_id: &DataId) -> Option<Arc<EventRecord>> {
        self.inner.queue.get(data_id)
    }

    pub fn set_flush(&self, on: bool) -> ProcessorResult<()> {
        self.inner.set_flush(on)
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.registry.is_flusher(&self.inner.name)
    }

    pub fn set_active(&self, on: bool) {
        self.inner.set_active(on)
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn wake(&self) {
        self.inner.wake()
    }

    /// Discard queued records (memory only; stored rows come back on restart).
    pub fn clear(&self, threshold: Priority) -> usize {
        self.inner.queue.clear(threshold).len()
    }

    /// Discard queued records and delete their stored rows.
    pub fn purge(&self, threshold: Priority) -> usize {
        self.inner.purge(threshold)
    }

    pub fn persist_now(&self) -> PersistSummary {
        self.inner.persist_pending()
    }

    pub fn dump(&self) -> WorkerDump {
        self.inner.dump()
    }

    pub fn state(&self) -> WorkerState {
        self.inner.state()
    }

    pub fn stats(&self) -> ProcessorStats {
        self.inner.stats()
    }

    pub fn report(&self) -> ProcessorReport {
        self.inner.report()
    }

    /// The table this processor writes to.
    pub fn table(&self) -> &T {
        self.inner.gateway.table()
    }

    /// Stop the worker, persist what is still queued, and deregister.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(processor = %self.inner.name, "stopping processor");

        self.inner.queue.interrupt();
        self.inner.sleeper.wake();
        self.inner.registry.interrupt_pause();

        let join = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join {
            if join.join().is_err() {
                error!(processor = %self.inner.name, "worker thread panicked");
            }
        }

        let summary = self.inner.persist_pending();
        let discarded = self.inner.queue.clear(Priority::Low).len();
        self.inner.registry.end_flush(&self.inner.name);
        self.inner.registry.deregister(&self.inner.name);
        self.inner.set_state(WorkerState::Stopped);

        info!(
            processor = %self.inner.name,
            persisted = summary.written,
            persist_failures = summary.failed,
            discarded,
            "processor stopped"
        );
    }
}

impl<C, T> Drop for EventProcessor<C, T>
where
    C: Component,
    T: EventTable + 'static,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}
