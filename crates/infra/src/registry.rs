//! Process-wide coordination shared by every processor instance.
//!
//! Three independent pieces of state, each behind its own lock and never
//! taken while a queue lock is held:
//!
//! - **pause**: a flag plus the set of workers currently parked on it;
//! - **flusher**: the single instance allowed to skip its inter-cycle sleep;
//! - **instances**: live processors by name, for the admin console.
//!
//! Processors receive the registry at start; [`ProcessRegistry::global`] is
//! the instance used by the server binary. Tests build their own.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};
use std::thread;

use tracing::info;

use eventproc_core::{ProcessorError, ProcessorResult};

use crate::processor::ProcessorControl;

#[derive(Debug, Default)]
struct PauseState {
    paused: bool,
    parked: HashSet<String>,
}

#[derive(Default)]
pub struct ProcessRegistry {
    pause: Mutex<PauseState>,
    resumed: Condvar,
    flusher: Mutex<Option<String>>,
    instances: RwLock<BTreeMap<String, Weak<dyn ProcessorControl>>>,
}

impl core::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("paused", &self.is_paused())
            .field("flusher", &self.flusher())
            .field("instances", &self.names())
            .finish()
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by everything in this process that does not
    /// bring its own.
    pub fn global() -> Arc<ProcessRegistry> {
        static GLOBAL: OnceLock<Arc<ProcessRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(ProcessRegistry::new())).clone()
    }

    fn pause_state(&self) -> MutexGuard<'_, PauseState> {
        self.pause.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- pause ----

    /// Pause or resume every worker.
    ///
    /// Pausing takes effect at each worker's next cycle. Resuming returns only
    /// once every parked worker has left the pause wait.
    pub fn set_pause(&self, paused: bool) {
        {
            let mut state = self.pause_state();
            if state.paused == paused {
                return;
            }
            state.paused = paused;
        }
        info!(paused, "global pause changed");
        if paused {
            return;
        }

        self.resumed.notify_all();
        while !self.pause_state().parked.is_empty() {
            thread::yield_now();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause_state().paused
    }

    /// Names of the workers currently parked on the pause.
    pub fn parked(&self) -> Vec<String> {
        let mut names: Vec<_> = self.pause_state().parked.iter().cloned().collect();
        names.sort();
        names
    }

    /// Park the calling worker while the pause is on.
    ///
    /// Returns early when `stopped` is set and [`ProcessRegistry::interrupt_pause`]
    /// is called. Returns whether the worker actually parked.
    pub fn wait_while_paused(&self, name: &str, stopped: &AtomicBool) -> bool {
        let mut state = self.pause_state();
        if !state.paused || stopped.load(Ordering::Acquire) {
            return false;
        }

        state.parked.insert(name.to_owned());
        info!(processor = name, "worker paused");
        while state.paused && !stopped.load(Ordering::Acquire) {
            state = self
                .resumed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.parked.remove(name);
        info!(processor = name, "worker resumed");
        true
    }

    /// Wake parked workers so they can observe their stop flag.
    pub fn interrupt_pause(&self) {
        let _state = self.pause_state();
        self.resumed.notify_all();
    }

    // ---- flush ----

    /// Claim the process-wide flush slot.
    ///
    /// Re-claiming by the current holder succeeds.
    pub fn try_begin_flush(&self, name: &str) -> ProcessorResult<()> {
        let mut slot = self.flusher.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_deref() {
            Some(holder) if holder != name => Err(ProcessorError::conflict(format!(
                "processor '{holder}' is already flushing"
            ))),
            Some(_) => Ok(()),
            None => {
                *slot = Some(name.to_owned());
                info!(processor = name, "flush mode enabled");
                Ok(())
            }
        }
    }

    /// Release the flush slot if `name` holds it. Returns whether it did.
    pub fn end_flush(&self, name: &str) -> bool {
        let mut slot = self.flusher.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_deref() == Some(name) {
            *slot = None;
            info!(processor = name, "flush mode disabled");
            true
        } else {
            false
        }
    }

    pub fn is_flusher(&self, name: &str) -> bool {
        self.flusher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            == Some(name)
    }

    pub fn flusher(&self) -> Option<String> {
        self.flusher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ---- instances ----

    /// Register a live instance. Fails if another live instance has the name.
    pub fn register(&self, name: &str, control: Weak<dyn ProcessorControl>) -> ProcessorResult<()> {
        let mut instances = self
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if instances
            .get(name)
            .is_some_and(|existing| existing.strong_count() > 0)
        {
            return Err(ProcessorError::conflict(format!(
                "processor '{name}' is already running"
            )));
        }
        instances.insert(name.to_owned(), control);
        Ok(())
    }

    pub fn deregister(&self, name: &str) {
        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProcessorControl>> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .and_then(Weak::upgrade)
    }

    /// Live instances, by name.
    pub fn instances(&self) -> Vec<Arc<dyn ProcessorControl>> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, w)| w.strong_count() > 0)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn only_one_flusher_at_a_time() {
        let registry = ProcessRegistry::new();
        registry.try_begin_flush("a").unwrap();
        assert!(registry.try_begin_flush("a").is_ok());
        assert!(matches!(
            registry.try_begin_flush("b"),
            Err(ProcessorError::Conflict(_))
        ));

        assert!(!registry.end_flush("b"));
        assert!(registry.end_flush("a"));
        registry.try_begin_flush("b").unwrap();
        assert_eq!(registry.flusher().as_deref(), Some("b"));
        assert!(registry.is_flusher("b"));
    }

    #[test]
    fn wait_returns_immediately_when_not_paused() {
        let registry = ProcessRegistry::new();
        let stopped = AtomicBool::new(false);
        assert!(!registry.wait_while_paused("a", &stopped));
    }

    #[test]
    fn resume_waits_for_parked_workers() {
        let registry = Arc::new(ProcessRegistry::new());
        registry.set_pause(true);

        let stopped = Arc::new(AtomicBool::new(false));
        let workers: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|name| {
                let registry = registry.clone();
                let stopped = stopped.clone();
                thread::spawn(move || registry.wait_while_paused(name, &stopped))
            })
            .collect();

        while registry.parked().len() < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(registry.parked(), vec!["a".to_string(), "b".to_string()]);

        registry.set_pause(false);
        assert!(registry.parked().is_empty());
        for w in workers {
            assert!(w.join().unwrap());
        }
    }

    #[test]
    fn stop_flag_breaks_the_pause_wait() {
        let registry = Arc::new(ProcessRegistry::new());
        registry.set_pause(true);
        let stopped = Arc::new(AtomicBool::new(false));

        let worker = {
            let registry = registry.clone();
            let stopped = stopped.clone();
            thread::spawn(move || registry.wait_while_paused("a", &stopped))
        };
        while registry.parked().is_empty() {
            thread::sleep(Duration::from_millis(1));
        }

        stopped.store(true, Ordering::Release);
        registry.interrupt_pause();
        assert!(worker.join().unwrap());
        assert!(registry.is_paused());
        assert!(registry.parked().is_empty());
    }
}
