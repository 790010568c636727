//! The coordination state machine.
//!
//! A coordination leaves `Active` exactly once, through the termination
//! transition. The thread that wins it notifies every participant in reverse
//! enrollment order, releases them from the lock table and unregisters the
//! coordination; every other caller observes the terminal state instead.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use concord_common::{
    deadline_after, now, validate_timeout_ms, ContextId, CoordinationError, CoordinationId,
    CoordinationName, CoordinationState, FailureReason, OwnerId, Result, Timestamp,
};

use crate::coordinator::CoordinatorId;
use crate::lock_table::{Acquisition, ParticipantLockTable};
use crate::manager::CoordinationMgr;
use crate::metrics::SharedMetrics;
use crate::participant::{notify, Outcome, ParticipantKey, ParticipantRef};
use crate::scheduler::{TimeoutScheduler, TimerHandle};
use crate::variables::Variables;

/// Mutable state, guarded by the coordination's own lock.
struct CoordinationInner {
    state: CoordinationState,
    participants: Vec<ParticipantRef>,
    deadline: Option<Instant>,
    timer: Option<TimerHandle>,
    failure: Option<FailureReason>,
    /// Thread-of-control whose stack holds this coordination.
    context: Option<ContextId>,
}

/// Collaborators and identity handed over by the manager.
pub(crate) struct CoordinationParts {
    pub id: CoordinationId,
    pub name: CoordinationName,
    pub owner: OwnerId,
    pub creator: Option<CoordinatorId>,
    pub timeout_ms: u64,
    pub manager: Weak<CoordinationMgr>,
    pub lock_table: Arc<ParticipantLockTable>,
    pub scheduler: Arc<TimeoutScheduler>,
    pub metrics: SharedMetrics,
}

/// A unit of work collecting participants for a joint outcome.
pub struct Coordination {
    id: CoordinationId,
    name: CoordinationName,
    owner: OwnerId,
    creator: Option<CoordinatorId>,
    created_at: Timestamp,
    inner: Mutex<CoordinationInner>,
    /// Signalled when a final state is reached.
    finished: Condvar,
    /// Set together with the termination transition; readable without the lock.
    terminated: AtomicBool,
    variables: Mutex<Variables>,
    self_ref: Weak<Coordination>,
    manager: Weak<CoordinationMgr>,
    lock_table: Arc<ParticipantLockTable>,
    scheduler: Arc<TimeoutScheduler>,
    metrics: SharedMetrics,
}

impl Coordination {
    pub(crate) fn new(parts: CoordinationParts) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id: parts.id,
            name: parts.name,
            owner: parts.owner,
            creator: parts.creator,
            created_at: now(),
            inner: Mutex::new(CoordinationInner {
                state: CoordinationState::Active,
                participants: Vec::new(),
                deadline: deadline_after(parts.timeout_ms),
                timer: None,
                failure: None,
                context: None,
            }),
            finished: Condvar::new(),
            terminated: AtomicBool::new(false),
            variables: Mutex::new(Variables::default()),
            self_ref: self_ref.clone(),
            manager: parts.manager,
            lock_table: parts.lock_table,
            scheduler: parts.scheduler,
            metrics: parts.metrics,
        })
    }

    /// Start the deadline timer; called once the coordination is registered.
    pub(crate) fn arm_timeout(&self) {
        self.schedule_timeout(&mut self.inner.lock());
    }

    /// Unique identifier.
    pub fn id(&self) -> CoordinationId {
        self.id
    }

    /// Name given at creation.
    pub fn name(&self) -> &CoordinationName {
        &self.name
    }

    /// Owner of the façade that created this coordination.
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Façade this coordination was created through.
    pub fn creator(&self) -> Option<CoordinatorId> {
        self.creator
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Current state.
    pub fn state(&self) -> CoordinationState {
        self.inner.lock().state
    }

    /// Check if the coordination left the active state.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Failure reason, if the coordination took the fail path.
    pub fn failure(&self) -> Option<FailureReason> {
        self.inner.lock().failure.clone()
    }

    /// Absolute deadline, if the coordination has a timeout.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.lock().deadline
    }

    /// Thread-of-control this coordination is pushed on.
    pub fn context(&self) -> Option<ContextId> {
        self.inner.lock().context
    }

    /// Snapshot of the participants while active; empty once terminated.
    pub fn participants(&self) -> Vec<ParticipantRef> {
        let inner = self.inner.lock();
        if inner.state == CoordinationState::Active {
            inner.participants.clone()
        } else {
            Vec::new()
        }
    }

    /// Fail the coordination.
    ///
    /// Returns `false` if the coordination was no longer active. Participant
    /// errors are logged and do not stop the notification walk.
    pub fn fail(&self, reason: FailureReason) -> bool {
        let Some(participants) = self.start_termination(Some(reason.clone())) else {
            return false;
        };

        warn!(
            coordination_id = %self.id,
            name = %self.name,
            reason = %reason,
            participants = participants.len(),
            "Failing coordination"
        );

        for participant in participants.iter().rev() {
            if let Err(e) = notify(participant, self, Outcome::Failed) {
                self.metrics.participant_error();
                error!(
                    coordination_id = %self.id,
                    error = %e,
                    "Participant raised an error during fail"
                );
            }
            self.lock_table.release(ParticipantKey::of(participant), self.id);
        }

        if let Some(manager) = self.manager.upgrade() {
            manager.unregister(self, false);
        }

        self.metrics.coordination_failed(reason.is_timeout());
        self.finish(CoordinationState::Failed);
        true
    }

    /// End the coordination from the thread-of-control `ctx`.
    ///
    /// Nested coordinations above this one on its stack are ended first. Every
    /// participant is notified even if some of them fail; their errors are
    /// reported afterwards as [`CoordinationError::PartiallyEnded`].
    pub fn end(&self, ctx: ContextId) -> Result<()> {
        {
            let inner = self.inner.lock();
            if let Some(associated) = inner.context {
                if inner.state == CoordinationState::Active && associated != ctx {
                    return Err(CoordinationError::WrongThread {
                        id: self.id,
                        associated,
                        caller: ctx,
                    });
                }
            }
        }

        let Some(participants) = self.start_termination(None) else {
            return self.end_terminated();
        };

        if let Some(manager) = self.manager.upgrade() {
            if let Some(nested) = manager.end_nested(self) {
                warn!(
                    coordination_id = %self.id,
                    error = %nested,
                    "Nested coordination failed while ending"
                );
                self.inner.lock().failure = Some(FailureReason::nested(&nested));
            }
            manager.unregister(self, true);
        }

        let failure = self.inner.lock().failure.clone();
        let outcome = match failure {
            Some(_) => Outcome::Failed,
            None => Outcome::Ended,
        };

        let mut causes = Vec::new();
        for participant in participants.iter().rev() {
            if let Err(e) = notify(participant, self, outcome) {
                self.metrics.participant_error();
                warn!(
                    coordination_id = %self.id,
                    error = %e,
                    "Participant raised an error during end"
                );
                causes.push(format!("{e:#}"));
            }
            self.lock_table.release(ParticipantKey::of(participant), self.id);
        }

        if let Some(reason) = failure {
            self.metrics.coordination_failed(false);
            self.finish(CoordinationState::Terminated);
            return Err(self.failed_error(reason));
        }

        self.metrics.coordination_ended();
        self.finish(CoordinationState::Terminated);
        info!(
            coordination_id = %self.id,
            name = %self.name,
            participants = participants.len(),
            "Coordination ended"
        );

        if causes.is_empty() {
            Ok(())
        } else {
            Err(CoordinationError::PartiallyEnded {
                id: self.id,
                name: self.name.to_string(),
                causes,
            })
        }
    }

    /// Enroll `participant`, blocking while another coordination holds it.
    ///
    /// Adding the same participant instance twice keeps a single entry.
    pub fn add_participant(&self, participant: ParticipantRef) -> Result<()> {
        let key = ParticipantKey::of(&participant);
        let acquisition = self
            .lock_table
            .acquire(key, self.id, || self.is_terminated())?;

        let mut inner = self.inner.lock();
        if inner.state != CoordinationState::Active || acquisition == Acquisition::Abandoned {
            let err = self.terminal_error(&inner);
            drop(inner);
            if acquisition == Acquisition::Acquired {
                self.lock_table.release(key, self.id);
            }
            return Err(err);
        }

        if !inner
            .participants
            .iter()
            .any(|p| ParticipantKey::of(p) == key)
        {
            inner.participants.push(participant);
            self.metrics.participant_enrolled();
            debug!(
                coordination_id = %self.id,
                participant = %key,
                "Participant enrolled"
            );
        }
        Ok(())
    }

    /// Push the deadline `timeout_ms` further out and reschedule the timer.
    ///
    /// Returns the new deadline, or `None` for a coordination without timeout.
    pub fn extend_timeout(&self, timeout_ms: i64) -> Result<Option<Instant>> {
        let extension = validate_timeout_ms(timeout_ms)?;

        let mut inner = self.inner.lock();
        if inner.state != CoordinationState::Active {
            return Err(self.terminal_error(&inner));
        }

        let Some(deadline) = inner.deadline else {
            return Ok(None);
        };

        if extension > 0 {
            inner.deadline = Some(deadline + Duration::from_millis(extension));
            self.schedule_timeout(&mut inner);
            debug!(
                coordination_id = %self.id,
                extension_ms = extension,
                "Coordination timeout extended"
            );
        }
        Ok(inner.deadline)
    }

    /// Wait until the coordination reaches a final state or `timeout_ms`
    /// elapses (0 waits indefinitely). Returns whether it is final.
    pub fn join(&self, timeout_ms: i64) -> Result<bool> {
        let deadline = deadline_after(validate_timeout_ms(timeout_ms)?);

        let mut inner = self.inner.lock();
        while !inner.state.is_final() {
            match deadline {
                Some(deadline) => {
                    if self.finished.wait_until(&mut inner, deadline).timed_out() {
                        break;
                    }
                }
                None => self.finished.wait(&mut inner),
            }
        }
        Ok(inner.state.is_final())
    }

    /// Push this coordination on the stack of `ctx`.
    pub fn push(&self, ctx: ContextId) -> Result<()> {
        let manager = self
            .manager
            .upgrade()
            .ok_or(CoordinationError::EngineShutdown)?;
        let this = self
            .self_ref
            .upgrade()
            .ok_or(CoordinationError::EngineShutdown)?;
        manager.push(ctx, &this)
    }

    /// Coordination directly below this one on its stack.
    pub fn enclosing(&self) -> Option<Arc<Coordination>> {
        self.manager.upgrade()?.enclosing(self)
    }

    /// Store a typed variable, returning the previous value of that type.
    pub fn set_variable<T: std::any::Any + Send + Sync>(&self, value: T) -> Option<T> {
        self.variables.lock().insert(value)
    }

    /// Clone of the variable of type `T`.
    pub fn variable<T: std::any::Any + Send + Sync + Clone>(&self) -> Option<T> {
        self.variables.lock().get::<T>().cloned()
    }

    /// Remove the variable of type `T`.
    pub fn remove_variable<T: std::any::Any + Send + Sync>(&self) -> Option<T> {
        self.variables.lock().remove::<T>()
    }

    /// Run `f` with exclusive access to the variables.
    pub fn with_variables<R>(&self, f: impl FnOnce(&mut Variables) -> R) -> R {
        f(&mut self.variables.lock())
    }

    pub(crate) fn set_context(&self, context: Option<ContextId>) {
        self.inner.lock().context = context;
    }

    /// Associate an active, unpushed coordination with `ctx`.
    ///
    /// Checked and set under one lock, so a termination that follows is
    /// guaranteed to see the context and remove the coordination from its stack.
    pub(crate) fn claim_context(&self, ctx: ContextId) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != CoordinationState::Active {
            return Err(self.terminal_error(&inner));
        }
        if let Some(context) = inner.context {
            return Err(CoordinationError::AlreadyPushed {
                id: self.id,
                context,
            });
        }
        inner.context = Some(ctx);
        Ok(())
    }

    // --- Private methods ---

    /// The single-winner `Active -> Terminating` transition.
    ///
    /// On success the pending timer is cancelled and the participant list is
    /// handed to the caller, which owns the notification walk.
    fn start_termination(&self, failure: Option<FailureReason>) -> Option<Vec<ParticipantRef>> {
        let participants = {
            let mut inner = self.inner.lock();
            if inner.state != CoordinationState::Active {
                return None;
            }

            inner.state = CoordinationState::Terminating;
            self.terminated.store(true, Ordering::SeqCst);
            if failure.is_some() {
                inner.failure = failure;
            }
            if let Some(timer) = inner.timer.take() {
                self.scheduler.cancel(timer);
            }
            std::mem::take(&mut inner.participants)
        };

        // Adders of this coordination blocked on other holders must give up.
        self.lock_table.wake_waiters();
        Some(participants)
    }

    /// `end()` lost the transition: report, and finalize a failed coordination.
    fn end_terminated(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let err = self.terminal_error(&inner);

        if inner.state != CoordinationState::Failed {
            return Err(err);
        }

        debug_assert!(inner.state.can_transition_to(CoordinationState::Terminated));
        inner.state = CoordinationState::Terminated;
        drop(inner);

        if let Some(manager) = self.manager.upgrade() {
            manager.unregister(self, true);
        }
        self.set_context(None);
        self.finished.notify_all();
        Err(err)
    }

    fn finish(&self, state: CoordinationState) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.state.can_transition_to(state));
        inner.state = state;
        if state == CoordinationState::Terminated {
            inner.context = None;
        }
        drop(inner);
        self.finished.notify_all();
    }

    fn schedule_timeout(&self, inner: &mut CoordinationInner) {
        if let Some(timer) = inner.timer.take() {
            self.scheduler.cancel(timer);
        }

        if let Some(deadline) = inner.deadline {
            let coordination = self.self_ref.clone();
            inner.timer = self.scheduler.schedule(deadline, move || {
                if let Some(coordination) = coordination.upgrade() {
                    coordination.timeout();
                }
            });
        }
    }

    fn timeout(&self) {
        if self.fail(FailureReason::timeout()) {
            info!(coordination_id = %self.id, name = %self.name, "Coordination timed out");
        }
    }

    fn terminal_error(&self, inner: &CoordinationInner) -> CoordinationError {
        match &inner.failure {
            Some(reason) => self.failed_error(reason.clone()),
            None => CoordinationError::AlreadyEnded {
                id: self.id,
                name: self.name.to_string(),
            },
        }
    }

    fn failed_error(&self, reason: FailureReason) -> CoordinationError {
        CoordinationError::Failed {
            id: self.id,
            name: self.name.to_string(),
            reason,
        }
    }
}

impl fmt::Debug for Coordination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordination")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Coordination {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Coordination {}
