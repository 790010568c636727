//! Shared timer that forces coordinations to fail when their deadline elapses.
//!
//! One worker thread services a min-heap of deadlines. Cancellation removes
//! the task; its heap entry is discarded when it reaches the top, or earlier
//! when cancelled entries outnumber live ones and the heap is compacted.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error};

use concord_common::{CoordinationError, Result};

use crate::config::SchedulerConfig;

/// Work run by the timer thread when a deadline elapses.
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Handle of a scheduled timer, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

#[derive(Debug, PartialEq, Eq)]
struct ScheduledTimer {
    fire_at: Instant,
    handle: TimerHandle,
}

impl PartialOrd for ScheduledTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: earliest first, then oldest handle
        Reverse(self.fire_at)
            .cmp(&Reverse(other.fire_at))
            .then_with(|| other.handle.0.cmp(&self.handle.0))
    }
}

#[derive(Default)]
struct SchedulerState {
    queue: BinaryHeap<ScheduledTimer>,
    tasks: HashMap<TimerHandle, TimerTask>,
    next_handle: u64,
    shutdown: bool,
}

impl SchedulerState {
    /// Drop heap entries of cancelled timers once they exceed the live ones.
    fn compact(&mut self) {
        if self.queue.len() > 2 * self.tasks.len() {
            let tasks = &self.tasks;
            self.queue.retain(|timer| tasks.contains_key(&timer.handle));
        }
    }
}

struct Shared {
    state: Mutex<SchedulerState>,
    wakeup: Condvar,
}

/// Single shared timer for coordination deadlines.
pub struct TimeoutScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutScheduler {
    /// Start the scheduler and its worker thread.
    pub fn start(config: &SchedulerConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::default()),
            wakeup: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || run(worker_shared))
            .map_err(|e| {
                CoordinationError::Configuration(format!("failed to spawn timer thread: {e}"))
            })?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Schedule `task` to run at `fire_at`.
    ///
    /// Returns `None` once the scheduler has been shut down.
    pub fn schedule<F>(&self, fire_at: Instant, task: F) -> Option<TimerHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return None;
        }

        state.next_handle += 1;
        let handle = TimerHandle(state.next_handle);
        state.tasks.insert(handle, Box::new(task));
        state.queue.push(ScheduledTimer { fire_at, handle });
        drop(state);

        self.shared.wakeup.notify_one();
        Some(handle)
    }

    /// Cancel a scheduled timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut state = self.shared.state.lock();
        let cancelled = state.tasks.remove(&handle).is_some();
        if cancelled {
            state.compact();
        }
        cancelled
    }

    /// Number of timers that are scheduled and not cancelled.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    /// Stop the worker thread, dropping all pending timers.
    pub fn shutdown(&self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.queue.clear();
            std::mem::take(&mut state.tasks)
        };
        self.shared.wakeup.notify_all();
        drop(dropped);

        if let Some(worker) = self.worker.lock().take() {
            // The last reference may be released by a timer task itself.
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                error!("Timer thread terminated abnormally");
            }
        }
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<Shared>) {
    debug!("Timer thread started");
    let mut state = shared.state.lock();

    loop {
        if state.shutdown {
            break;
        }

        let Some((fire_at, handle)) = state.queue.peek().map(|t| (t.fire_at, t.handle)) else {
            shared.wakeup.wait(&mut state);
            continue;
        };

        if !state.tasks.contains_key(&handle) {
            state.queue.pop();
            continue;
        }

        if fire_at > Instant::now() {
            shared.wakeup.wait_until(&mut state, fire_at);
            continue;
        }

        state.queue.pop();
        if let Some(task) = state.tasks.remove(&handle) {
            MutexGuard::unlocked(&mut state, || {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!("Timer task panicked");
                }
            });
        }
    }

    debug!("Timer thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn create_test_scheduler() -> TimeoutScheduler {
        TimeoutScheduler::start(&SchedulerConfig::default()).unwrap()
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let scheduler = create_test_scheduler();
        let (tx, rx) = mpsc::channel();
        let now = Instant::now();

        for (label, delay) in [("late", 60), ("early", 10), ("middle", 30)] {
            let tx = tx.clone();
            scheduler.schedule(now + Duration::from_millis(delay), move || {
                tx.send(label).unwrap();
            });
        }

        let fired: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(fired, vec!["early", "middle", "late"]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_cancelled_timer_does_not_fire() {
        let scheduler = create_test_scheduler();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let handle = scheduler
            .schedule(Instant::now() + Duration::from_millis(20), move || {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
            })
            .unwrap();

        assert_eq!(scheduler.pending(), 1);
        assert!(scheduler.cancel(handle));
        assert!(!scheduler.cancel(handle));
        assert_eq!(scheduler.pending(), 0);

        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn test_cancelled_timers_do_not_accumulate() {
        let scheduler = create_test_scheduler();
        let now = Instant::now();
        scheduler.schedule(now + Duration::from_secs(3600), || {});

        for _ in 0..10_000 {
            let handle = scheduler
                .schedule(now + Duration::from_secs(7200), || {})
                .unwrap();
            assert!(scheduler.cancel(handle));
        }

        assert_eq!(scheduler.pending(), 1);
        assert!(scheduler.shared.state.lock().queue.len() <= 2);
    }

    #[test]
    fn test_panicking_task_does_not_stop_worker() {
        let scheduler = create_test_scheduler();
        let (tx, rx) = mpsc::channel();
        let now = Instant::now();

        scheduler.schedule(now, || panic!("boom"));
        scheduler.schedule(now + Duration::from_millis(5), move || {
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_schedule_after_shutdown() {
        let scheduler = create_test_scheduler();
        scheduler.shutdown();
        assert!(scheduler.schedule(Instant::now(), || {}).is_none());
        assert_eq!(scheduler.pending(), 0);
    }
}
