//! Integration tests for the full processor pipeline.
//!
//! Tests: notify → EventQueue → worker → Component, with persistence on the side.
//!
//! Verifies:
//! - Records reach the component in priority order and leave no stored rows
//! - Callback errors and panics do not stop the worker
//! - Pause, flush and passive mode behave across instances
//! - Unprocessed events survive a restart

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use eventproc_core::{DataId, EventKind, Priority, ProcessorError};
    use eventproc_events::{Attributes, EventRecord, ProcessingContext, resolve_priority};

    use crate::admin::{AdminCommand, AdminError};
    use crate::component::Component;
    use crate::config::ProcessorConfig;
    use crate::persist::EventTable;
    use crate::persist::in_memory::InMemoryEventTable;
    use crate::persist::sqlite::SqliteEventTable;
    use crate::processor::{EventProcessor, WorkerState};
    use crate::registry::ProcessRegistry;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Seen {
        kind: EventKind,
        data_id: String,
        priority: Priority,
        inherited: Priority,
    }

    /// Records every callback; fails on ids in `fail_on`, panics on `panic_on`.
    #[derive(Debug, Default)]
    struct RecordingComponent {
        seen: Mutex<Vec<Seen>>,
        fail_on: HashSet<String>,
        panic_on: HashSet<String>,
    }

    impl RecordingComponent {
        fn failing(fail_on: &[&str], panic_on: &[&str]) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                fail_on: fail_on.iter().map(|s| s.to_string()).collect(),
                panic_on: panic_on.iter().map(|s| s.to_string()).collect(),
            }
        }

        fn seen(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }

        fn handle(&self, ctx: &ProcessingContext, record: &EventRecord) -> anyhow::Result<()> {
            let id = record.data_id().as_str();
            self.seen.lock().unwrap().push(Seen {
                kind: record.kind(),
                data_id: id.to_string(),
                priority: ctx.priority(),
                inherited: resolve_priority(None),
            });
            if self.panic_on.contains(id) {
                panic!("component exploded on {id}");
            }
            if self.fail_on.contains(id) {
                anyhow::bail!("component rejected {id}");
            }
            Ok(())
        }
    }

    impl Component for RecordingComponent {
        fn on_update(
            &self,
            ctx: &ProcessingContext,
            record: &EventRecord,
            _attributes: &Attributes,
        ) -> anyhow::Result<()> {
            self.handle(ctx, record)
        }

        fn on_delete(
            &self,
            ctx: &ProcessingContext,
            record: &EventRecord,
            _attributes: &Attributes,
        ) -> anyhow::Result<()> {
            self.handle(ctx, record)
        }
    }

    type TestProcessor = EventProcessor<Arc<RecordingComponent>, Arc<InMemoryEventTable>>;

    fn id(s: &str) -> DataId {
        DataId::new(s).unwrap()
    }

    fn config(name: &str) -> ProcessorConfig {
        ProcessorConfig::new(name)
            .with_warmup(Duration::ZERO)
            .with_base_sleep(Duration::from_millis(1))
            .with_per_instance_overhead(Duration::ZERO)
            .with_idle_poll(Duration::from_millis(10))
    }

    fn start<T: EventTable + 'static>(
        config: ProcessorConfig,
        component: &Arc<RecordingComponent>,
        table: T,
        registry: &Arc<ProcessRegistry>,
    ) -> EventProcessor<Arc<RecordingComponent>, T> {
        EventProcessor::start(config, component.clone(), table, registry.clone()).unwrap()
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn setup(name: &str, active: bool) -> (TestProcessor, Arc<RecordingComponent>, Arc<InMemoryEventTable>) {
        let registry = Arc::new(ProcessRegistry::new());
        let component = Arc::new(RecordingComponent::default());
        let table = Arc::new(InMemoryEventTable::new(name));
        let processor = start(config(name).with_active(active), &component, table.clone(), &registry);
        (processor, component, table)
    }

    #[test]
    fn records_reach_the_component_in_priority_order() {
        let (processor, component, table) = setup("orders", false);

        processor.notify_updated(id("low"), None, Some(Priority::Low));
        processor.notify_updated(id("normal"), Some("alice".into()), None);
        processor.notify_deleted(id("high"), None, Some(Priority::High));
        wait_until("rows written while passive", || table.len() == 3);

        processor.set_active(true);
        wait_until("three callbacks", || component.seen().len() == 3);

        let order: Vec<_> = component.seen().into_iter().map(|s| s.data_id).collect();
        assert_eq!(order, vec!["high", "normal", "low"]);
        wait_until("stored rows removed", || table.is_empty());
        assert_eq!(processor.stats().processed, 3);
        assert_eq!(processor.queue_sizes().total(), 0);
    }

    #[test]
    fn aggregated_events_are_processed_once() {
        let (processor, component, _table) = setup("orders", false);

        processor.notify_updated(id("doc-1"), None, None);
        processor.notify_updated(id("doc-1"), None, None);
        processor.notify_updated(id("doc-1"), None, Some(Priority::High));
        assert_eq!(processor.queue_sizes().total(), 1);
        assert_eq!(processor.stats().escalations, 1);

        processor.set_active(true);
        wait_until("callback", || processor.stats().processed == 1);
        let seen = component.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].priority, Priority::High);
    }

    #[test]
    fn callback_failures_do_not_stop_the_worker() {
        let registry = Arc::new(ProcessRegistry::new());
        let component = Arc::new(RecordingComponent::failing(&["bad"], &["boom"]));
        let processor = start(
            config("fragile"),
            &component,
            Arc::new(InMemoryEventTable::new("fragile")),
            &registry,
        );

        processor.notify_updated(id("bad"), None, Some(Priority::High));
        processor.notify_updated(id("boom"), None, Some(Priority::Normal));
        processor.notify_updated(id("good"), None, Some(Priority::Low));

        wait_until("all callbacks", || {
            let stats = processor.stats();
            stats.processed == 1 && stats.failed == 2
        });
        assert_ne!(processor.state(), WorkerState::Stopped);

        processor.notify_updated(id("after"), None, None);
        wait_until("worker still alive", || processor.stats().processed == 2);
    }

    #[test]
    fn callbacks_see_the_priority_of_their_record() {
        let (processor, component, _table) = setup("inherit", true);

        processor.notify_updated(id("urgent"), None, Some(Priority::High));
        wait_until("callback", || !component.seen().is_empty());

        let seen = &component.seen()[0];
        assert_eq!(seen.priority, Priority::High);
        assert_eq!(seen.inherited, Priority::High);
        assert_eq!(resolve_priority(None), Priority::Normal);
    }

    #[test]
    fn global_pause_parks_every_worker() {
        let registry = Arc::new(ProcessRegistry::new());
        let component = Arc::new(RecordingComponent::default());
        let a = start(config("a"), &component, Arc::new(InMemoryEventTable::new("a")), &registry);
        let b = start(config("b"), &component, Arc::new(InMemoryEventTable::new("b")), &registry);

        registry.set_pause(true);
        wait_until("both parked", || registry.parked().len() == 2);
        assert_eq!(registry.parked(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(a.state(), WorkerState::PausedGlobally);

        a.notify_updated(id("doc-1"), None, None);
        thread::sleep(Duration::from_millis(50));
        assert!(component.seen().is_empty());
        assert_eq!(a.queue_sizes().normal, 1);
        assert!(a.dump().in_flight.is_none());

        registry.set_pause(false);
        assert!(registry.parked().is_empty());
        wait_until("processed after resume", || a.stats().processed == 1);
    }

    #[test]
    fn only_one_instance_flushes_at_a_time() {
        let registry = Arc::new(ProcessRegistry::new());
        let component = Arc::new(RecordingComponent::default());
        let a = start(
            config("a").with_active(false),
            &component,
            Arc::new(InMemoryEventTable::new("a")),
            &registry,
        );
        let _b = start(config("b"), &component, Arc::new(InMemoryEventTable::new("b")), &registry);

        a.notify_updated(id("doc-1"), None, None);
        a.set_flush(true).unwrap();
        assert!(a.is_flushing());

        let denied = AdminCommand::parse("flush on")
            .unwrap()
            .execute(&registry, Some("b"));
        assert!(matches!(
            denied,
            Err(AdminError::Processor(ProcessorError::Conflict(_)))
        ));

        a.set_active(true);
        wait_until("flush released once drained", || {
            !a.is_flushing() && a.stats().processed == 1
        });

        AdminCommand::parse("flush on")
            .unwrap()
            .execute(&registry, Some("b"))
            .unwrap();
    }

    #[test]
    fn passive_mode_persists_without_processing() {
        let (processor, component, table) = setup("passive", false);

        processor.notify_created(id("doc-1"), Some("bob".into()), None);
        processor.notify_updated(id("doc-2"), None, Some(Priority::Low));
        wait_until("rows written", || table.len() == 2);

        thread::sleep(Duration::from_millis(30));
        assert!(component.seen().is_empty());
        assert_eq!(processor.queue_sizes().total(), 2);
        let users: Vec<_> = table.rows().into_iter().map(|r| r.user).collect();
        assert!(users.contains(&Some("bob".to_string())));

        processor.set_active(true);
        wait_until("processed", || processor.stats().processed == 2);
        wait_until("rows removed", || table.is_empty());
    }

    #[test]
    fn failed_writes_are_retried() {
        let (processor, _component, table) = setup("flaky", false);
        table.set_fail_writes(true);

        processor.notify_updated(id("doc-1"), None, None);
        wait_until("a failed write", || processor.stats().persist_failures > 0);
        assert!(table.is_empty());

        table.set_fail_writes(false);
        wait_until("retried write", || table.len() == 1);
    }

    #[test]
    fn shutdown_persists_and_restart_recovers() {
        let registry = Arc::new(ProcessRegistry::new());
        let component = Arc::new(RecordingComponent::default());
        let table = Arc::new(InMemoryEventTable::new("durable"));

        let first = start(config("durable").with_active(false), &component, table.clone(), &registry);
        first.notify_updated(id("doc-1"), Some("carol".into()), Some(Priority::High));
        first.notify_deleted(id("doc-2"), None, None);
        first.shutdown();
        assert_eq!(first.state(), WorkerState::Stopped);
        assert_eq!(table.len(), 2);
        assert!(registry.names().is_empty());
        drop(first);

        let second = start(config("durable"), &component, table.clone(), &registry);
        assert_eq!(second.stats().recovered, 2);
        wait_until("recovered events processed", || component.seen().len() == 2);

        let seen = component.seen();
        assert_eq!(seen[0].data_id, "doc-1");
        assert_eq!(seen[0].priority, Priority::High);
        assert_eq!(seen[1].kind, EventKind::Delete);
        wait_until("rows removed", || table.is_empty());
    }

    #[test]
    fn restart_reproduces_aggregated_live_set() {
        let registry = Arc::new(ProcessRegistry::new());
        let component = Arc::new(RecordingComponent::default());
        let table = Arc::new(InMemoryEventTable::new("history"));
        let ids = ["created", "escalated", "updated", "plain"];

        let first = start(config("history").with_active(false), &component, table.clone(), &registry);

        // Each first event is stored before the one that aggregates with it.
        first.notify_created(id("created"), None, None);
        first.notify_updated(id("escalated"), None, Some(Priority::Low));
        first.notify_updated(id("updated"), Some("erin".into()), None);
        first.notify_updated(id("plain"), None, Some(Priority::Low));
        first.persist_now();
        assert_eq!(table.len(), 4);

        first.notify_deleted(id("created"), None, None);
        first.notify_updated(id("escalated"), None, Some(Priority::High));
        first.notify_deleted(id("updated"), None, None);
        first.persist_now();

        let snapshot = |p: &TestProcessor| -> Vec<Option<(EventKind, Priority)>> {
            ids.iter()
                .map(|i| p.queued(&id(i)).map(|r| (r.kind(), r.priority())))
                .collect()
        };
        let before = snapshot(&first);
        assert_eq!(
            before,
            vec![
                None,
                Some((EventKind::Update, Priority::High)),
                Some((EventKind::Delete, Priority::Normal)),
                Some((EventKind::Update, Priority::Low)),
            ]
        );
        drop(first);

        let rows = table.rows();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.data_id.as_str() != "created"));

        let second = start(config("history").with_active(false), &component, table.clone(), &registry);
        assert_eq!(snapshot(&second), before);
        assert_eq!(second.queued(&id("updated")).unwrap().user(), Some("erin"));
        drop(second);

        // Recovery itself must not add or drop rows.
        assert_eq!(table.len(), 3);
        let third = start(config("history").with_active(false), &component, table.clone(), &registry);
        assert_eq!(snapshot(&third), before);
        assert!(component.seen().is_empty());
    }

    #[test]
    fn restart_recovers_from_sqlite() {
        let registry = Arc::new(ProcessRegistry::new());
        let component = Arc::new(RecordingComponent::default());
        let table = Arc::new(SqliteEventTable::connect("sqlite::memory:", "sqlite").unwrap());

        let first = start(config("sqlite").with_active(false), &component, table.clone(), &registry);
        first.notify_updated(id("doc-1"), None, Some(Priority::Low));
        first.notify_deleted(id("doc-2"), Some("dave".into()), None);
        drop(first);
        assert_eq!(table.load_all().unwrap().len(), 2);

        let second = start(
            config("sqlite").with_active(false),
            &component,
            table.clone(),
            &registry,
        );
        let restored = second.queued(&id("doc-2")).unwrap();
        assert!(restored.is_restored());
        assert_eq!(restored.kind(), EventKind::Delete);
        assert_eq!(restored.user(), Some("dave"));
        assert_eq!(second.queued(&id("doc-1")).unwrap().priority(), Priority::Low);

        second.set_active(true);
        wait_until("processed", || second.stats().processed == 2);
        wait_until("rows removed", || table.load_all().unwrap().is_empty());
    }

    #[test]
    fn names_are_unique_among_live_instances() {
        let registry = Arc::new(ProcessRegistry::new());
        let component = Arc::new(RecordingComponent::default());
        let first = start(config("solo"), &component, Arc::new(InMemoryEventTable::new("solo")), &registry);

        let second = EventProcessor::start(
            config("solo"),
            component.clone(),
            Arc::new(InMemoryEventTable::new("solo")),
            registry.clone(),
        );
        assert!(matches!(second, Err(ProcessorError::Conflict(_))));

        drop(first);
        assert!(registry.names().is_empty());
        let _again = start(config("solo"), &component, Arc::new(InMemoryEventTable::new("solo")), &registry);
        assert_eq!(registry.names(), vec!["solo".to_string()]);
    }

    #[test]
    fn invalid_config_fails_startup() {
        let registry = Arc::new(ProcessRegistry::new());
        let result = EventProcessor::start(
            config("bad name!"),
            Arc::new(RecordingComponent::default()),
            InMemoryEventTable::new("bad"),
            registry.clone(),
        );
        assert!(matches!(result, Err(ProcessorError::InvalidConfig(_))));
        assert!(registry.names().is_empty());
    }

    #[test]
    fn admin_commands_drive_a_running_processor() {
        let registry = Arc::new(ProcessRegistry::new());
        let component = Arc::new(RecordingComponent::default());
        let table = Arc::new(InMemoryEventTable::new("admin"));
        let processor = start(
            config("admin").with_active(false),
            &component,
            table.clone(),
            &registry,
        );

        let run = |line: &str, target: Option<&str>| {
            AdminCommand::parse(line)
                .unwrap()
                .execute(&registry, target)
                .unwrap()
        };

        assert!(run("update doc-9 high", Some("admin")).contains("enqueued"));
        assert_eq!(processor.queued(&id("doc-9")).unwrap().priority(), Priority::High);
        assert!(run("size", Some("admin")).contains("high=1"));
        assert!(run("list", None).starts_with("admin:"));

        run("persist", Some("admin"));
        assert_eq!(table.len(), 1);

        assert_eq!(run("clear", Some("admin")), "cleared 1 events");
        assert_eq!(processor.queue_sizes().high, 0);
        wait_until("stored row deleted", || table.is_empty());

        assert!(run("dump", Some("admin")).starts_with("thread eventproc-admin"));
        run("active on", Some("admin"));
        assert!(processor.is_active());
    }
}
