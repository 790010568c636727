//! Per-owner façade over the shared coordination manager.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, instrument};

use concord_common::{ContextId, CoordinationError, CoordinationId, FailureReason, OwnerId, Result};

use crate::coordination::Coordination;
use crate::manager::CoordinationMgr;
use crate::participant::ParticipantRef;

/// Identity of one coordinator instance.
///
/// Unique per manager, so two coordinators for the same owner never share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoordinatorId(u64);

impl CoordinatorId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for CoordinatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "coordinator-{}", self.0)
    }
}

/// Coordinator handed to one owner.
///
/// Coordinations created through a coordinator are force-failed with a
/// `RELEASED` reason when it is disposed or dropped.
pub struct Coordinator {
    id: CoordinatorId,
    owner: OwnerId,
    manager: Arc<CoordinationMgr>,
    disposed: AtomicBool,
}

impl Coordinator {
    pub(crate) fn new(id: CoordinatorId, owner: OwnerId, manager: Arc<CoordinationMgr>) -> Self {
        debug!(coordinator = %id, owner = %owner, "Coordinator acquired");
        Self {
            id,
            owner,
            manager,
            disposed: AtomicBool::new(false),
        }
    }

    /// Identity of this coordinator.
    pub fn id(&self) -> CoordinatorId {
        self.id
    }

    /// Owner this coordinator acts for.
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Create a coordination that is not yet pushed on any stack.
    pub fn create(&self, name: &str, timeout_ms: i64) -> Result<Arc<Coordination>> {
        self.ensure_live()?;
        let coordination = self
            .manager
            .create_for(&self.owner, Some(self.id), name, timeout_ms)?;
        self.adopt(coordination)
    }

    /// Create a coordination and push it on the stack of `ctx`.
    pub fn begin(&self, ctx: ContextId, name: &str, timeout_ms: i64) -> Result<Arc<Coordination>> {
        let coordination = self.create(name, timeout_ms)?;
        coordination.push(ctx)?;
        Ok(coordination)
    }

    /// Current coordination of `ctx`.
    pub fn peek(&self, ctx: ContextId) -> Option<Arc<Coordination>> {
        self.manager.peek(ctx)
    }

    /// Pop the current coordination of `ctx`.
    pub fn pop(&self, ctx: ContextId) -> Result<Arc<Coordination>> {
        self.manager.pop(ctx)
    }

    /// Fail the current coordination of `ctx`.
    ///
    /// Returns `false` if there is none or it was no longer active.
    #[instrument(skip(self), fields(owner = %self.owner))]
    pub fn fail(&self, ctx: ContextId, reason: FailureReason) -> bool {
        self.peek(ctx).is_some_and(|c| c.fail(reason))
    }

    /// Enroll `participant` in the current coordination of `ctx`.
    ///
    /// Returns `false` if `ctx` has no current coordination.
    pub fn add_participant(&self, ctx: ContextId, participant: ParticipantRef) -> Result<bool> {
        match self.peek(ctx) {
            Some(coordination) => {
                coordination.add_participant(participant)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Look up a live coordination.
    pub fn get_coordination(&self, id: CoordinationId) -> Option<Arc<Coordination>> {
        self.manager.get(id)
    }

    /// All live coordinations.
    pub fn get_coordinations(&self) -> Vec<Arc<Coordination>> {
        self.manager.coordinations()
    }

    /// Release this coordinator, failing every coordination it created.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.manager.dispose(self.id);
        }
    }

    /// Check if [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(CoordinationError::EngineShutdown);
        }
        Ok(())
    }

    /// Hand out a freshly registered coordination unless a concurrent
    /// `dispose` started after the liveness check and missed it.
    fn adopt(&self, coordination: Arc<Coordination>) -> Result<Arc<Coordination>> {
        if self.is_disposed() {
            coordination.fail(FailureReason::released());
            return Err(CoordinationError::EngineShutdown);
        }
        Ok(coordination)
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.dispose();
    }
}
