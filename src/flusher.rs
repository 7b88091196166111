use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::dispatcher::{Dispatcher, DispatcherTask, Priority, TaskId};
use crate::store::Store;

/// Lifecycle of the flusher task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlusherState {
    /// Performing warmup; no flush cycles yet.
    Initializing,
    /// Flushing on every scheduling tick.
    Running,
    /// Persistence suspended; the task idles.
    Paused,
    /// Shutdown requested.
    Stopping,
    /// The task has exited.
    Stopped,
}

impl FlusherState {
    /// Name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            FlusherState::Initializing => "initializing",
            FlusherState::Running => "running",
            FlusherState::Paused => "paused",
            FlusherState::Stopping => "stopping",
            FlusherState::Stopped => "stopped",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => FlusherState::Initializing,
            1 => FlusherState::Running,
            2 => FlusherState::Paused,
            3 => FlusherState::Stopping,
            _ => FlusherState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            FlusherState::Initializing => 0,
            FlusherState::Running => 1,
            FlusherState::Paused => 2,
            FlusherState::Stopping => 3,
            FlusherState::Stopped => 4,
        }
    }
}

/// Idle sleep when there is nothing to flush, and the backoff applied
/// when the backend refuses to open a transaction.
const IDLE_SLEEP_SECS: f64 = 1.0;

/// Drives flush cycles as a recurring task on the I/O dispatcher.
///
/// One cycle: drain the intake queue into the working queue, persist up
/// to a transaction's worth of entries, commit, then return rejects to
/// the head of the working queue. The first tick performs warmup.
pub struct Flusher {
    state: AtomicU8,
    store: Mutex<Weak<Store>>,
}

impl Flusher {
    pub fn new() -> Self {
        Flusher {
            state: AtomicU8::new(FlusherState::Stopped.as_u8()),
            store: Mutex::new(Weak::new()),
        }
    }

    /// Wires the flusher to its store. Called once during store startup.
    pub(crate) fn attach(&self, store: Weak<Store>) {
        *self.store.lock() = store;
    }

    pub fn state(&self) -> FlusherState {
        FlusherState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Diagnostic state name.
    pub fn state_name(&self) -> &'static str {
        self.state().name()
    }

    fn set_state(&self, to: FlusherState) {
        self.state.store(to.as_u8(), Ordering::Release);
    }

    fn transition(&self, from: &[FlusherState], to: FlusherState) -> bool {
        for f in from {
            if self
                .state
                .compare_exchange(
                    f.as_u8(),
                    to.as_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                debug!(from = f.name(), to = to.name(), "flusher.transition");
                return true;
            }
        }
        warn!(
            current = self.state().name(),
            wanted = to.name(),
            "flusher.bad_transition"
        );
        false
    }

    /// Schedules the flusher task, entering the warmup state.
    pub(crate) fn start(self: &Arc<Self>, store: &Arc<Store>) {
        if !self.transition(&[FlusherState::Stopped], FlusherState::Initializing) {
            return;
        }
        store.io_dispatcher().schedule(
            Box::new(FlusherTask {
                flusher: Arc::clone(self),
            }),
            None,
            Priority::Flusher,
            0.0,
        );
    }

    /// Requests shutdown. True if a stop was actually initiated.
    pub fn stop(&self) -> bool {
        self.transition(
            &[
                FlusherState::Initializing,
                FlusherState::Running,
                FlusherState::Paused,
            ],
            FlusherState::Stopping,
        )
    }

    /// Blocks until the task acknowledges the stop.
    pub fn wait(&self) {
        while self.state() != FlusherState::Stopped {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Suspends flushing. False if the flusher was not running.
    pub fn pause(&self) -> bool {
        self.transition(&[FlusherState::Running], FlusherState::Paused)
    }

    /// Resumes flushing. False if the flusher was not paused.
    pub fn resume(&self) -> bool {
        self.transition(&[FlusherState::Paused], FlusherState::Running)
    }

    /// One scheduling tick. Returns `(keep_task, sleep_secs)`.
    fn step(&self, store: &Arc<Store>) -> (bool, f64) {
        match self.state() {
            FlusherState::Initializing => {
                store.warmup();
                // A stop requested mid-warmup wins; the next tick sees it.
                self.transition(&[FlusherState::Initializing], FlusherState::Running);
                (true, 0.0)
            }
            FlusherState::Running => (true, self.flush_cycle(store)),
            FlusherState::Paused => (true, IDLE_SLEEP_SECS),
            FlusherState::Stopping => {
                debug!("flusher.stopped");
                self.set_state(FlusherState::Stopped);
                (false, 0.0)
            }
            FlusherState::Stopped => (false, 0.0),
        }
    }

    fn flush_cycle(&self, store: &Arc<Store>) -> f64 {
        if !store.begin_flush() {
            return IDLE_SLEEP_SECS;
        }
        let flush_start = store.clock().now();
        let mut rejects = VecDeque::new();
        let residual = store.flush_some(&mut rejects);
        store.complete_flush(&mut rejects, flush_start);

        if store.has_flush_work() && residual > 0 {
            // Requeued entries are too young; nap, but never so long that
            // a tunable change goes unnoticed.
            f64::from(residual).min(IDLE_SLEEP_SECS)
        } else {
            0.0
        }
    }
}

impl Default for Flusher {
    fn default() -> Self {
        Self::new()
    }
}

struct FlusherTask {
    flusher: Arc<Flusher>,
}

impl DispatcherTask for FlusherTask {
    fn run(&mut self, d: &Dispatcher, t: &TaskId) -> bool {
        let store = match self.flusher.store.lock().upgrade() {
            Some(store) => store,
            None => return false,
        };
        let (keep, sleep) = self.flusher.step(&store);
        if keep && sleep > 0.0 {
            d.snooze(t, sleep);
        }
        keep
    }

    fn description(&self) -> String {
        format!("Running a flusher loop: {}", self.flusher.state_name())
    }
}
