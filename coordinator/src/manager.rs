//! Registry of live coordinations and per-context coordination stacks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use concord_common::{
    validate_timeout_ms, ContextId, CoordinationError, CoordinationId, CoordinationName,
    FailureReason, OwnerId, Result,
};

use crate::config::EngineConfig;
use crate::coordination::{Coordination, CoordinationParts};
use crate::coordinator::{Coordinator, CoordinatorId};
use crate::lock_table::ParticipantLockTable;
use crate::metrics::{Metrics, SharedMetrics};
use crate::participant::{ParticipantKey, ParticipantRef};
use crate::scheduler::TimeoutScheduler;
use crate::state::EngineState;

/// Process-wide coordination manager.
///
/// Owns the id counter, the id to coordination map, one stack per
/// thread-of-control, the participant lock table and the shared timer.
pub struct CoordinationMgr {
    /// Configuration.
    config: EngineConfig,
    /// Current engine state.
    state: RwLock<EngineState>,
    /// Next coordination id.
    next_id: AtomicU64,
    /// Next façade id.
    next_coordinator: AtomicU64,
    /// Live coordinations indexed by ID.
    coordinations: DashMap<CoordinationId, Arc<Coordination>>,
    /// Coordination stacks indexed by thread-of-control.
    stacks: Mutex<HashMap<ContextId, Vec<Arc<Coordination>>>>,
    /// Participant to holding coordination.
    lock_table: Arc<ParticipantLockTable>,
    /// Shared deadline timer.
    scheduler: Arc<TimeoutScheduler>,
    /// Engine metrics.
    metrics: SharedMetrics,
    self_ref: Weak<CoordinationMgr>,
}

impl CoordinationMgr {
    /// Create a new manager and start its timer thread.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        config.validate().map_err(CoordinationError::Configuration)?;

        let metrics: SharedMetrics = Arc::new(Metrics::new());
        let scheduler = Arc::new(TimeoutScheduler::start(&config.scheduler_config)?);
        let lock_table = Arc::new(ParticipantLockTable::new(
            config.lock_config.clone(),
            metrics.clone(),
        ));

        info!(
            lock_timeout_ms = ?config.lock_config.acquire_timeout.map(|t| t.as_millis()),
            detect_deadlocks = config.lock_config.detect_deadlocks,
            "Coordination manager started"
        );

        Ok(Arc::new_cyclic(|self_ref| Self {
            config,
            state: RwLock::new(EngineState::Running),
            next_id: AtomicU64::new(1),
            next_coordinator: AtomicU64::new(1),
            coordinations: DashMap::new(),
            stacks: Mutex::new(HashMap::new()),
            lock_table,
            scheduler,
            metrics,
            self_ref: self_ref.clone(),
        }))
    }

    /// Create a façade acting on behalf of `owner`.
    pub fn coordinator(self: &Arc<Self>, owner: impl Into<OwnerId>) -> Coordinator {
        let id = CoordinatorId::new(self.next_coordinator.fetch_add(1, Ordering::SeqCst));
        Coordinator::new(id, owner.into(), self.clone())
    }

    /// Create and register a coordination that belongs to no façade.
    ///
    /// The timeout is validated before the name; `0` means no timeout.
    pub fn create(&self, owner: &OwnerId, name: &str, timeout_ms: i64) -> Result<Arc<Coordination>> {
        self.create_for(owner, None, name, timeout_ms)
    }

    #[instrument(skip(self), fields(owner = %owner))]
    pub(crate) fn create_for(
        &self,
        owner: &OwnerId,
        creator: Option<CoordinatorId>,
        name: &str,
        timeout_ms: i64,
    ) -> Result<Arc<Coordination>> {
        // Held until registration so shutdown cannot miss this coordination.
        let state = self.state.read();
        if !state.accepts_requests() {
            return Err(CoordinationError::EngineShutdown);
        }

        let timeout = validate_timeout_ms(timeout_ms)?;
        if self.config.max_timeout_ms > 0 && timeout > self.config.max_timeout_ms {
            return Err(CoordinationError::InvalidTimeout(timeout_ms));
        }
        let name = CoordinationName::parse(name)?;

        let id = CoordinationId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let coordination = Coordination::new(CoordinationParts {
            id,
            name,
            owner: owner.clone(),
            creator,
            timeout_ms: timeout,
            manager: self.self_ref.clone(),
            lock_table: self.lock_table.clone(),
            scheduler: self.scheduler.clone(),
            metrics: self.metrics.clone(),
        });

        self.metrics.coordination_created();
        self.coordinations.insert(id, coordination.clone());
        coordination.arm_timeout();
        drop(state);

        info!(
            coordination_id = %id,
            name = %coordination.name(),
            timeout_ms = timeout,
            "Coordination created"
        );
        Ok(coordination)
    }

    /// Create a coordination and push it on the stack of `ctx`.
    pub fn begin(
        &self,
        owner: &OwnerId,
        ctx: ContextId,
        name: &str,
        timeout_ms: i64,
    ) -> Result<Arc<Coordination>> {
        let coordination = self.create(owner, name, timeout_ms)?;
        coordination.push(ctx)?;
        Ok(coordination)
    }

    /// Pop the top of the stack of `ctx`.
    pub fn pop(&self, ctx: ContextId) -> Result<Arc<Coordination>> {
        let mut stacks = self.stacks.lock();
        let popped = stacks.get_mut(&ctx).and_then(Vec::pop);
        Self::prune(&mut stacks, ctx);
        drop(stacks);

        match popped {
            Some(coordination) => {
                coordination.set_context(None);
                debug!(coordination_id = %coordination.id(), context = %ctx, "Coordination popped");
                Ok(coordination)
            }
            None => Err(CoordinationError::StackMismatch {
                context: ctx,
                expected: None,
                found: None,
            }),
        }
    }

    /// Pop the top of the stack of `ctx`, which must be `expected`.
    pub fn pop_expecting(
        &self,
        ctx: ContextId,
        expected: &Coordination,
    ) -> Result<Arc<Coordination>> {
        let mut stacks = self.stacks.lock();
        let found = stacks
            .get(&ctx)
            .and_then(|stack| stack.last())
            .map(|top| top.id());

        if found != Some(expected.id()) {
            return Err(CoordinationError::StackMismatch {
                context: ctx,
                expected: Some(expected.id()),
                found,
            });
        }

        let popped = stacks.get_mut(&ctx).and_then(Vec::pop);
        Self::prune(&mut stacks, ctx);
        drop(stacks);

        let coordination = popped.ok_or(CoordinationError::StackMismatch {
            context: ctx,
            expected: Some(expected.id()),
            found: None,
        })?;
        coordination.set_context(None);
        Ok(coordination)
    }

    /// Top of the stack of `ctx`.
    pub fn peek(&self, ctx: ContextId) -> Option<Arc<Coordination>> {
        self.stacks
            .lock()
            .get(&ctx)
            .and_then(|stack| stack.last().cloned())
    }

    /// Coordination directly below `coordination` on its stack.
    pub fn enclosing(&self, coordination: &Coordination) -> Option<Arc<Coordination>> {
        let ctx = coordination.context()?;
        let stacks = self.stacks.lock();
        let stack = stacks.get(&ctx)?;
        let position = stack.iter().position(|c| c.id() == coordination.id())?;
        position.checked_sub(1).map(|below| stack[below].clone())
    }

    /// Look up a live coordination.
    pub fn get(&self, id: CoordinationId) -> Option<Arc<Coordination>> {
        self.coordinations.get(&id).map(|c| c.clone())
    }

    /// All live coordinations, ordered by id.
    pub fn coordinations(&self) -> Vec<Arc<Coordination>> {
        let mut all: Vec<_> = self.coordinations.iter().map(|c| c.clone()).collect();
        all.sort_by_key(|c| c.id());
        all
    }

    /// Force-fail every live coordination created through the façade `creator`.
    #[instrument(skip(self))]
    pub(crate) fn dispose(&self, creator: CoordinatorId) -> usize {
        let owned: Vec<_> = self
            .coordinations
            .iter()
            .filter(|c| c.creator() == Some(creator))
            .map(|c| c.clone())
            .collect();

        let failed = owned
            .iter()
            .filter(|c| c.fail(FailureReason::released()))
            .count();

        if failed > 0 {
            info!(count = failed, "Released coordinations of disposed owner");
        }
        failed
    }

    /// Fail every live coordination, wake all blocked callers and stop the timer.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if !state.accepts_requests() {
                return;
            }
            *state = EngineState::ShuttingDown;
        }

        info!("Shutting down coordination manager");

        let live: Vec<_> = self.coordinations.iter().map(|c| c.clone()).collect();
        for coordination in &live {
            coordination.fail(FailureReason::released());
        }

        let stacks = std::mem::take(&mut *self.stacks.lock());
        for coordination in stacks.into_values().flatten() {
            coordination.set_context(None);
        }

        self.lock_table.shutdown();
        self.scheduler.shutdown();

        *self.state.write() = EngineState::Stopped;
        info!(failed = live.len(), "Coordination manager stopped");
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Engine metrics.
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Number of live deadline timers.
    pub fn pending_timers(&self) -> usize {
        self.scheduler.pending()
    }

    /// Coordination currently holding `participant`.
    pub fn participant_holder(&self, participant: &ParticipantRef) -> Option<CoordinationId> {
        self.lock_table.holder(ParticipantKey::of(participant))
    }

    // --- Crate-internal operations used by coordinations ---

    pub(crate) fn push(&self, ctx: ContextId, coordination: &Arc<Coordination>) -> Result<()> {
        let mut stacks = self.stacks.lock();
        coordination.claim_context(ctx)?;
        let stack = stacks.entry(ctx).or_default();
        stack.push(coordination.clone());

        debug!(
            coordination_id = %coordination.id(),
            context = %ctx,
            depth = stack.len(),
            "Coordination pushed"
        );
        Ok(())
    }

    /// End every coordination above `coordination` on its stack, deepest first.
    ///
    /// Returns the first error raised by a nested `end()`.
    pub(crate) fn end_nested(&self, coordination: &Coordination) -> Option<CoordinationError> {
        let ctx = coordination.context()?;
        let nested: Vec<_> = {
            let stacks = self.stacks.lock();
            let stack = stacks.get(&ctx)?;
            let position = stack.iter().position(|c| c.id() == coordination.id())?;
            stack[position + 1..].to_vec()
        };

        let mut first_error = None;
        for inner in nested.iter().rev() {
            if let Err(e) = inner.end(ctx) {
                warn!(
                    coordination_id = %inner.id(),
                    enclosing_id = %coordination.id(),
                    error = %e,
                    "Nested coordination did not end cleanly"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error
    }

    /// Remove `coordination` from the registry and, optionally, from its stack.
    pub(crate) fn unregister(&self, coordination: &Coordination, remove_from_stack: bool) {
        self.coordinations.remove(&coordination.id());

        if remove_from_stack {
            if let Some(ctx) = coordination.context() {
                let mut stacks = self.stacks.lock();
                if let Some(stack) = stacks.get_mut(&ctx) {
                    stack.retain(|c| c.id() != coordination.id());
                }
                Self::prune(&mut stacks, ctx);
            }
        }
    }

    fn prune(stacks: &mut HashMap<ContextId, Vec<Arc<Coordination>>>, ctx: ContextId) {
        if stacks.get(&ctx).is_some_and(Vec::is_empty) {
            stacks.remove(&ctx);
        }
    }
}

impl Drop for CoordinationMgr {
    fn drop(&mut self) {
        self.shutdown();
    }
}
