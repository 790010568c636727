//! Participant mutual exclusion across coordinations.
//!
//! A participant is held by at most one coordination at a time. Acquiring a
//! participant held elsewhere blocks until the holder releases it, the wait
//! times out, the waiting coordination terminates, or the engine shuts down.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use concord_common::{as_millis, CoordinationError, CoordinationId, Result};

use crate::config::LockConfig;
use crate::metrics::SharedMetrics;
use crate::participant::ParticipantKey;

/// Outcome of a participant acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// The participant was free and is now held by the requester.
    Acquired,
    /// The requester already held the participant.
    AlreadyHeld,
    /// The requesting coordination terminated while waiting.
    Abandoned,
}

#[derive(Default)]
struct TableState {
    /// Participant to holding coordination.
    holders: HashMap<ParticipantKey, CoordinationId>,
    /// Wait-for edges of blocked acquisitions, keyed by wait ticket.
    waiting: HashMap<u64, (CoordinationId, CoordinationId)>,
    next_ticket: u64,
    shutdown: bool,
}

impl TableState {
    /// Follow the wait-for edges starting at `holder`; true if any path leads back to `requester`.
    fn closes_cycle(&self, requester: CoordinationId, holder: CoordinationId) -> bool {
        let mut pending = vec![holder];
        let mut visited = HashSet::new();

        while let Some(current) = pending.pop() {
            if current == requester {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            pending.extend(
                self.waiting
                    .values()
                    .filter(|(waiter, _)| *waiter == current)
                    .map(|(_, next)| *next),
            );
        }
        false
    }
}

/// Registry of participant to holding coordination.
pub struct ParticipantLockTable {
    state: Mutex<TableState>,
    released: Condvar,
    config: LockConfig,
    metrics: SharedMetrics,
}

impl ParticipantLockTable {
    /// Create a new lock table.
    pub fn new(config: LockConfig, metrics: SharedMetrics) -> Self {
        Self {
            state: Mutex::new(TableState::default()),
            released: Condvar::new(),
            config,
            metrics,
        }
    }

    /// Acquire `participant` for `owner`, blocking while another coordination holds it.
    ///
    /// `is_abandoned` is polled on every wakeup; once it reports true the wait
    /// ends with [`Acquisition::Abandoned`].
    pub fn acquire<F>(
        &self,
        participant: ParticipantKey,
        owner: CoordinationId,
        is_abandoned: F,
    ) -> Result<Acquisition>
    where
        F: Fn() -> bool,
    {
        let started = Instant::now();
        let deadline = self.config.acquire_timeout.map(|t| started + t);
        let mut state = self.state.lock();
        let mut counted_wait = false;
        state.next_ticket += 1;
        let ticket = state.next_ticket;

        let outcome = loop {
            if state.shutdown {
                break Err(CoordinationError::EngineShutdown);
            }

            let holder = match state.holders.get(&participant) {
                None => {
                    state.holders.insert(participant, owner);
                    break Ok(Acquisition::Acquired);
                }
                Some(&holder) if holder == owner => break Ok(Acquisition::AlreadyHeld),
                Some(&holder) => holder,
            };

            if is_abandoned() {
                break Ok(Acquisition::Abandoned);
            }

            if self.config.detect_deadlocks && state.closes_cycle(owner, holder) {
                self.metrics.deadlock_detected();
                warn!(
                    coordination_id = %owner,
                    holder_id = %holder,
                    participant = %participant,
                    "Deadlock detected while acquiring participant"
                );
                break Err(CoordinationError::Deadlock {
                    coordination: owner,
                    holder,
                });
            }

            if !counted_wait {
                counted_wait = true;
                self.metrics.lock_wait();
                debug!(
                    coordination_id = %owner,
                    holder_id = %holder,
                    participant = %participant,
                    "Waiting for participant"
                );
            }
            state.waiting.insert(ticket, (owner, holder));

            match deadline {
                Some(deadline) => {
                    if !self.released.wait_until(&mut state, deadline).timed_out() {
                        continue;
                    }
                    // The holder may have changed while waiting.
                    if let Some(holder) = state
                        .holders
                        .get(&participant)
                        .copied()
                        .filter(|h| *h != owner)
                    {
                        self.metrics.lock_timeout();
                        warn!(
                            coordination_id = %owner,
                            holder_id = %holder,
                            participant = %participant,
                            "Timed out waiting for participant"
                        );
                        break Err(CoordinationError::LockTimeout {
                            coordination: owner,
                            holder,
                            waited_ms: as_millis(started.elapsed()),
                        });
                    }
                }
                None => self.released.wait(&mut state),
            }
        };

        state.waiting.remove(&ticket);
        outcome
    }

    /// Release `participant` if it is held by `owner`, waking all waiters.
    pub fn release(&self, participant: ParticipantKey, owner: CoordinationId) -> bool {
        let released = {
            let mut state = self.state.lock();
            match state.holders.get(&participant) {
                Some(&holder) if holder == owner => {
                    state.holders.remove(&participant);
                    true
                }
                _ => false,
            }
        };

        if released {
            self.released.notify_all();
        }
        released
    }

    /// Wake all waiters so they re-check whether their coordination is still active.
    pub fn wake_waiters(&self) {
        // Taking the lock orders this wakeup after any in-flight abandonment check.
        drop(self.state.lock());
        self.released.notify_all();
    }

    /// Coordination currently holding `participant`.
    pub fn holder(&self, participant: ParticipantKey) -> Option<CoordinationId> {
        self.state.lock().holders.get(&participant).copied()
    }

    /// Number of participants currently held.
    pub fn held_count(&self) -> usize {
        self.state.lock().holders.len()
    }

    /// Refuse further acquisitions and wake all waiters with a shutdown error.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::participant::{Participant, ParticipantRef};
    use crate::Coordination;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    struct Dummy;

    impl Participant for Dummy {
        fn ended(&self, _: &Coordination) -> anyhow::Result<()> {
            Ok(())
        }

        fn failed(&self, _: &Coordination) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn key() -> (ParticipantRef, ParticipantKey) {
        let participant: ParticipantRef = Arc::new(Dummy);
        let key = ParticipantKey::of(&participant);
        (participant, key)
    }

    fn create_test_table(acquire_timeout: Option<Duration>) -> Arc<ParticipantLockTable> {
        let config = LockConfig {
            acquire_timeout,
            detect_deadlocks: true,
        };
        Arc::new(ParticipantLockTable::new(config, Arc::new(Metrics::new())))
    }

    fn id(n: u64) -> CoordinationId {
        CoordinationId::new(n)
    }

    #[test]
    fn test_acquire_and_release() {
        let table = create_test_table(None);
        let (_p, p) = key();

        assert_eq!(table.acquire(p, id(1), || false).unwrap(), Acquisition::Acquired);
        assert_eq!(table.acquire(p, id(1), || false).unwrap(), Acquisition::AlreadyHeld);
        assert_eq!(table.holder(p), Some(id(1)));

        assert!(!table.release(p, id(2)));
        assert!(table.release(p, id(1)));
        assert!(!table.release(p, id(1)));
        assert_eq!(table.held_count(), 0);
    }

    #[test]
    fn test_waiter_blocks_until_release() {
        let table = create_test_table(None);
        let (_p, p) = key();
        table.acquire(p, id(1), || false).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let table = table.clone();
            thread::spawn(move || {
                let outcome = table.acquire(p, id(2), || false);
                tx.send(()).unwrap();
                outcome
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        table.release(p, id(1));

        assert_eq!(waiter.join().unwrap().unwrap(), Acquisition::Acquired);
        assert_eq!(table.holder(p), Some(id(2)));
    }

    #[test]
    fn test_bounded_wait_times_out() {
        let table = create_test_table(Some(Duration::from_millis(30)));
        let (_p, p) = key();
        table.acquire(p, id(1), || false).unwrap();

        let err = table.acquire(p, id(2), || false).unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::LockTimeout { coordination, holder, waited_ms }
                if coordination == id(2) && holder == id(1) && waited_ms >= 30
        ));
    }

    #[test]
    fn test_abandoned_waiter_wakes() {
        let table = create_test_table(None);
        let (_p, p) = key();
        table.acquire(p, id(1), || false).unwrap();

        let abandoned = Arc::new(AtomicBool::new(false));
        let waiter = {
            let table = table.clone();
            let abandoned = abandoned.clone();
            thread::spawn(move || table.acquire(p, id(2), || abandoned.load(Ordering::SeqCst)))
        };

        thread::sleep(Duration::from_millis(20));
        abandoned.store(true, Ordering::SeqCst);
        table.wake_waiters();

        assert_eq!(waiter.join().unwrap().unwrap(), Acquisition::Abandoned);
        assert_eq!(table.holder(p), Some(id(1)));
    }

    #[test]
    fn test_wait_for_cycle_is_refused() {
        let table = create_test_table(Some(Duration::from_secs(5)));
        let (_a, a) = key();
        let (_b, b) = key();
        table.acquire(a, id(1), || false).unwrap();
        table.acquire(b, id(2), || false).unwrap();

        // Coordination 1 blocks on b (held by 2).
        let barrier = Arc::new(Barrier::new(2));
        let first = {
            let table = table.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                table.acquire(b, id(1), || false)
            })
        };
        barrier.wait();
        thread::sleep(Duration::from_millis(30));

        // Coordination 2 asking for a (held by 1) closes the cycle.
        let err = table.acquire(a, id(2), || false).unwrap_err();
        assert!(matches!(err, CoordinationError::Deadlock { coordination, holder }
            if coordination == id(2) && holder == id(1)));

        table.release(b, id(2));
        assert_eq!(first.join().unwrap().unwrap(), Acquisition::Acquired);
    }

    fn wait_for_waiters(table: &ParticipantLockTable, count: usize) {
        while table.state.lock().waiting.len() < count {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_parallel_waits_of_one_coordination_keep_their_edges() {
        let table = create_test_table(Some(Duration::from_secs(5)));
        let (_p, p) = key();
        let (_q, q) = key();
        let (_r, r) = key();
        table.acquire(p, id(1), || false).unwrap();
        table.acquire(q, id(1), || false).unwrap();
        table.acquire(r, id(2), || false).unwrap();

        // Two threads of coordination 2 block on coordination 1.
        let spawn_waiter = |participant| {
            let table = table.clone();
            thread::spawn(move || table.acquire(participant, id(2), || false))
        };
        let on_p = spawn_waiter(p);
        let on_q = spawn_waiter(q);
        wait_for_waiters(&table, 2);

        table.release(p, id(1));
        assert_eq!(on_p.join().unwrap().unwrap(), Acquisition::Acquired);

        // The remaining wait on q still closes the cycle.
        let err = table.acquire(r, id(1), || false).unwrap_err();
        assert!(matches!(err, CoordinationError::Deadlock { coordination, holder }
            if coordination == id(1) && holder == id(2)));

        table.release(q, id(1));
        assert_eq!(on_q.join().unwrap().unwrap(), Acquisition::Acquired);
        assert!(table.state.lock().waiting.is_empty());
    }

    #[test]
    fn test_lock_timeout_reports_current_holder() {
        let table = create_test_table(Some(Duration::from_millis(60)));
        let (_p, p) = key();
        table.acquire(p, id(1), || false).unwrap();

        let waiter = {
            let table = table.clone();
            thread::spawn(move || table.acquire(p, id(2), || false))
        };
        wait_for_waiters(&table, 1);

        // Hand the participant over without waking the waiter.
        table.state.lock().holders.insert(p, id(3));

        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, CoordinationError::LockTimeout { coordination, holder, .. }
            if coordination == id(2) && holder == id(3)));
    }

    #[test]
    fn test_shutdown_wakes_waiters() {
        let table = create_test_table(None);
        let (_p, p) = key();
        table.acquire(p, id(1), || false).unwrap();

        let waiter = {
            let table = table.clone();
            thread::spawn(move || table.acquire(p, id(2), || false))
        };

        thread::sleep(Duration::from_millis(20));
        table.shutdown();

        assert!(matches!(
            waiter.join().unwrap(),
            Err(CoordinationError::EngineShutdown)
        ));
    }
}
