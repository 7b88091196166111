use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

/// Task urgency, most urgent first. Background fetches outrank the
/// flusher so reads never starve behind bulk persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    BgFetcher,
    VKeyStatBgFetcher,
    VBucketPersistHigh,
    Flusher,
    VBucketPersistLow,
    VBucketDeletion,
    ItemPager,
    StatSnap,
    NotifyVBStateChange,
}

/// A unit of schedulable work.
///
/// Returning `true` keeps the task scheduled (typically after calling
/// [`Dispatcher::snooze`]); returning `false` removes it.
pub trait DispatcherTask: Send {
    /// Runs one slice of the task.
    fn run(&mut self, d: &Dispatcher, t: &TaskId) -> bool;
    /// Human-readable description for the dispatcher state report.
    fn description(&self) -> String;
}

/// Shared handle identifying a scheduled task.
pub struct TaskState {
    wake_at: Mutex<Instant>,
    snoozed: AtomicBool,
    cancelled: AtomicBool,
    priority: Priority,
    seq: u64,
}

/// Cloneable task identifier.
pub type TaskId = Arc<TaskState>;

impl TaskState {
    /// Marks the task dead; it is dropped instead of run next time it
    /// reaches the head of the queue.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Keeps a task alive only while its owner does. Owners hand a
/// [`Weak`] of this token to `schedule`; dropping the token invalidates
/// every task scheduled under it.
pub type ValidityToken = Arc<()>;

struct ScheduledTask {
    wake_at: Instant,
    id: TaskId,
    task: Box<dyn DispatcherTask>,
    validity: Option<Weak<()>>,
}

/// Heap entry for runnable tasks: most urgent priority first, then FIFO.
struct ReadyEntry(ScheduledTask);

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.id.seq == other.0.id.seq
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .0
            .id
            .priority
            .cmp(&self.0.id.priority)
            .then_with(|| other.0.id.seq.cmp(&self.0.id.seq))
    }
}

/// Heap entry for sleeping tasks: earliest wake time first.
struct FutureEntry(ScheduledTask);

impl PartialEq for FutureEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.id.seq == other.0.id.seq
    }
}

impl Eq for FutureEntry {}

impl PartialOrd for FutureEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for FutureEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .0
            .wake_at
            .cmp(&self.0.wake_at)
            .then_with(|| other.0.id.seq.cmp(&self.0.id.seq))
    }
}

/// Point-in-time view of what a dispatcher worker is doing.
#[derive(Debug, Clone)]
pub struct DispatcherState {
    /// Dispatcher name ("io" / "nonio").
    pub name: &'static str,
    /// True while a task callback is on the worker's stack.
    pub running: bool,
    /// Description of the running (or most recent) task.
    pub task: String,
    /// When the running task started.
    pub started: Option<Instant>,
}

struct RunningState {
    running: bool,
    task: String,
    started: Option<Instant>,
}

struct Queues {
    ready: BinaryHeap<ReadyEntry>,
    future: BinaryHeap<FutureEntry>,
}

struct Inner {
    name: &'static str,
    queues: Mutex<Queues>,
    cv: Condvar,
    shutdown: AtomicBool,
    state: Mutex<RunningState>,
    worker: Mutex<Option<JoinHandle<()>>>,
    seq: AtomicU64,
}

/// Single-threaded priority task runner.
///
/// Due tasks are promoted from the sleeping heap into the ready heap and
/// run highest-priority first. Two instances exist in a store: one for
/// I/O-bound callbacks (flush, background fetch, snapshot, deletion) and
/// one for everything else. Tasks on the same dispatcher never overlap,
/// which is what lets the flusher and the scheduled tasks share the
/// backend without locking against each other.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Creates a stopped dispatcher; call [`Dispatcher::start`] to spawn
    /// its worker.
    pub fn new(name: &'static str) -> Self {
        Dispatcher {
            inner: Arc::new(Inner {
                name,
                queues: Mutex::new(Queues {
                    ready: BinaryHeap::new(),
                    future: BinaryHeap::new(),
                }),
                cv: Condvar::new(),
                shutdown: AtomicBool::new(false),
                state: Mutex::new(RunningState {
                    running: false,
                    task: String::new(),
                    started: None,
                }),
                worker: Mutex::new(None),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Spawns the worker thread.
    pub fn start(&self) {
        let d = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("penumbra-dispatcher-{}", self.inner.name))
            .spawn(move || d.run_loop())
            .expect("failed to spawn dispatcher worker");
        *self.inner.worker.lock() = Some(handle);
    }

    /// Stops the worker and waits for it to exit. Queued tasks are
    /// dropped.
    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.cv.notify_all();
        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(dispatcher = self.inner.name, "worker exited abnormally");
            }
        }
        let mut q = self.inner.queues.lock();
        q.ready.clear();
        q.future.clear();
    }

    /// Schedules a task after `delay_secs`, returning its id.
    pub fn schedule(
        &self,
        task: Box<dyn DispatcherTask>,
        validity: Option<Weak<()>>,
        priority: Priority,
        delay_secs: f64,
    ) -> TaskId {
        let wake_at = Instant::now() + Duration::from_secs_f64(delay_secs.max(0.0));
        let id: TaskId = Arc::new(TaskState {
            wake_at: Mutex::new(wake_at),
            snoozed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            priority,
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
        });
        debug!(
            dispatcher = self.inner.name,
            task = %task.description(),
            ?priority,
            delay_secs,
            "dispatcher.schedule"
        );
        self.inner.queues.lock().future.push(FutureEntry(ScheduledTask {
            wake_at,
            id: id.clone(),
            task,
            validity,
        }));
        self.inner.cv.notify_one();
        id
    }

    /// Defers the identified task by `secs` from now. Meaningful when
    /// called from inside the task's own `run`, before returning `true`.
    pub fn snooze(&self, t: &TaskId, secs: f64) {
        *t.wake_at.lock() = Instant::now() + Duration::from_secs_f64(secs.max(0.0));
        t.snoozed.store(true, Ordering::Release);
    }

    /// Cancels a scheduled task.
    pub fn cancel(&self, t: &TaskId) {
        t.cancel();
    }

    /// Reports what the worker is doing.
    pub fn state(&self) -> DispatcherState {
        let st = self.inner.state.lock();
        DispatcherState {
            name: self.inner.name,
            running: st.running,
            task: st.task.clone(),
            started: st.started,
        }
    }

    fn run_loop(&self) {
        loop {
            let mut entry = {
                let mut q = self.inner.queues.lock();
                loop {
                    if self.inner.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    let now = Instant::now();
                    while q.future.peek().map_or(false, |f| f.0.wake_at <= now) {
                        let due = q.future.pop().expect("peeked entry vanished");
                        q.ready.push(ReadyEntry(due.0));
                    }
                    if let Some(entry) = q.ready.pop() {
                        break entry.0;
                    }
                    match q.future.peek() {
                        None => self.inner.cv.wait(&mut q),
                        Some(next) => {
                            let dur = next.0.wake_at.saturating_duration_since(now);
                            let _ = self.inner.cv.wait_for(&mut q, dur);
                        }
                    }
                }
            };

            if entry.id.is_cancelled() {
                continue;
            }
            if let Some(validity) = &entry.validity {
                if validity.upgrade().is_none() {
                    debug!(
                        dispatcher = self.inner.name,
                        task = %entry.task.description(),
                        "dispatcher.task_invalidated"
                    );
                    continue;
                }
            }

            {
                let mut st = self.inner.state.lock();
                st.running = true;
                st.task = entry.task.description();
                st.started = Some(Instant::now());
            }
            entry.id.snoozed.store(false, Ordering::Release);
            let keep = entry.task.run(self, &entry.id);
            self.inner.state.lock().running = false;

            if keep && !entry.id.is_cancelled() {
                entry.wake_at = if entry.id.snoozed.load(Ordering::Acquire) {
                    *entry.id.wake_at.lock()
                } else {
                    Instant::now()
                };
                self.inner.queues.lock().future.push(FutureEntry(entry));
                self.inner.cv.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct OneShot {
        label: &'static str,
        tx: mpsc::Sender<&'static str>,
    }

    impl DispatcherTask for OneShot {
        fn run(&mut self, _d: &Dispatcher, _t: &TaskId) -> bool {
            self.tx.send(self.label).unwrap();
            false
        }

        fn description(&self) -> String {
            format!("oneshot {}", self.label)
        }
    }

    struct SnoozingCounter {
        runs: u32,
        tx: mpsc::Sender<u32>,
    }

    impl DispatcherTask for SnoozingCounter {
        fn run(&mut self, d: &Dispatcher, t: &TaskId) -> bool {
            self.runs += 1;
            self.tx.send(self.runs).unwrap();
            if self.runs < 3 {
                d.snooze(t, 0.01);
                true
            } else {
                false
            }
        }

        fn description(&self) -> String {
            "snoozing counter".to_string()
        }
    }

    #[test]
    fn ready_tasks_run_in_priority_order() {
        let d = Dispatcher::new("test");
        let (tx, rx) = mpsc::channel();
        // Queue before starting the worker so both are ready together.
        d.schedule(
            Box::new(OneShot {
                label: "pager",
                tx: tx.clone(),
            }),
            None,
            Priority::ItemPager,
            0.0,
        );
        d.schedule(
            Box::new(OneShot {
                label: "bgfetch",
                tx,
            }),
            None,
            Priority::BgFetcher,
            0.0,
        );
        d.start();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "bgfetch");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "pager");
        d.stop();
    }

    #[test]
    fn snoozed_task_keeps_running_until_done() {
        let d = Dispatcher::new("test");
        d.start();
        let (tx, rx) = mpsc::channel();
        d.schedule(
            Box::new(SnoozingCounter { runs: 0, tx }),
            None,
            Priority::Flusher,
            0.0,
        );
        let mut seen = Vec::new();
        while let Ok(n) = rx.recv_timeout(Duration::from_secs(5)) {
            seen.push(n);
            if n == 3 {
                break;
            }
        }
        assert_eq!(seen, vec![1, 2, 3]);
        d.stop();
    }

    #[test]
    fn delayed_task_waits_for_its_wake_time() {
        let d = Dispatcher::new("test");
        d.start();
        let (tx, rx) = mpsc::channel();
        let started = Instant::now();
        d.schedule(
            Box::new(OneShot { label: "later", tx }),
            None,
            Priority::Flusher,
            0.2,
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "later");
        assert!(started.elapsed() >= Duration::from_millis(200));
        d.stop();
    }

    #[test]
    fn cancelled_task_never_runs() {
        let d = Dispatcher::new("test");
        let (tx, rx) = mpsc::channel();
        let id = d.schedule(
            Box::new(OneShot { label: "nope", tx }),
            None,
            Priority::Flusher,
            0.05,
        );
        d.cancel(&id);
        d.start();
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
        d.stop();
    }

    #[test]
    fn dropped_validity_token_kills_task() {
        let d = Dispatcher::new("test");
        let (tx, rx) = mpsc::channel();
        let token: ValidityToken = Arc::new(());
        d.schedule(
            Box::new(OneShot { label: "dead", tx }),
            Some(Arc::downgrade(&token)),
            Priority::Flusher,
            0.05,
        );
        drop(token);
        d.start();
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
        d.stop();
    }
}
