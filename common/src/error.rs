//! Error types for the coordination engine.

use crate::{ContextId, CoordinationId, FailureReason};
use thiserror::Error;

/// Main error type for coordination operations.
#[derive(Error, Debug, Clone)]
pub enum CoordinationError {
    /// The coordination already ended.
    #[error("Coordination {id}/{name} has already terminated")]
    AlreadyEnded { id: CoordinationId, name: String },

    /// The coordination failed.
    #[error("Coordination {id}/{name} failed: {reason}")]
    Failed {
        id: CoordinationId,
        name: String,
        reason: FailureReason,
    },

    /// One or more participants raised an error while the coordination ended.
    #[error("Coordination {id}/{name} partially ended: {} participant(s) failed", .causes.len())]
    PartiallyEnded {
        id: CoordinationId,
        name: String,
        causes: Vec<String>,
    },

    /// Name does not match the coordination name grammar.
    #[error("Invalid coordination name: {0:?}")]
    InvalidName(String),

    /// Negative or out-of-range timeout.
    #[error("Invalid timeout: {0}ms")]
    InvalidTimeout(i64),

    /// Pop on an empty stack, or the top is not the expected coordination.
    #[error("Coordination stack mismatch on {context}: expected {expected:?}, found {found:?}")]
    StackMismatch {
        context: ContextId,
        expected: Option<CoordinationId>,
        found: Option<CoordinationId>,
    },

    /// Ended from a thread-of-control other than the one it is associated with.
    #[error("Coordination {id} is associated with {associated}, not {caller}")]
    WrongThread {
        id: CoordinationId,
        associated: ContextId,
        caller: ContextId,
    },

    /// Pushed while already on a stack.
    #[error("Coordination {id} is already pushed on {context}")]
    AlreadyPushed { id: CoordinationId, context: ContextId },

    /// Participant could not be acquired within the configured wait.
    #[error("Timed out after {waited_ms}ms waiting for participant held by coordination {holder}")]
    LockTimeout {
        coordination: CoordinationId,
        holder: CoordinationId,
        waited_ms: u64,
    },

    /// Waiting for the participant would close a wait-for cycle.
    #[error("Deadlock: coordination {coordination} waits on {holder}, which waits on {coordination}")]
    Deadlock {
        coordination: CoordinationId,
        holder: CoordinationId,
    },

    /// The engine is shutting down or stopped.
    #[error("Coordination engine is shut down")]
    EngineShutdown,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CoordinationError {
    /// Check if this error reports a coordination's terminal state rather
    /// than caller misuse.
    pub fn is_terminal_signal(&self) -> bool {
        matches!(
            self,
            CoordinationError::AlreadyEnded { .. }
                | CoordinationError::Failed { .. }
                | CoordinationError::PartiallyEnded { .. }
        )
    }

    /// Failure reason carried by a `Failed` error.
    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match self {
            CoordinationError::Failed { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Get error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoordinationError::AlreadyEnded { .. } => "ALREADY_ENDED",
            CoordinationError::Failed { .. } => "FAILED",
            CoordinationError::PartiallyEnded { .. } => "PARTIALLY_ENDED",
            CoordinationError::InvalidName(_) => "INVALID_NAME",
            CoordinationError::InvalidTimeout(_) => "INVALID_TIMEOUT",
            CoordinationError::StackMismatch { .. } => "STACK_MISMATCH",
            CoordinationError::WrongThread { .. } => "WRONG_THREAD",
            CoordinationError::AlreadyPushed { .. } => "ALREADY_PUSHED",
            CoordinationError::LockTimeout { .. } => "LOCK_TIMEOUT",
            CoordinationError::Deadlock { .. } => "DEADLOCK",
            CoordinationError::EngineShutdown => "ENGINE_SHUTDOWN",
            CoordinationError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }
}

/// Result type alias for coordination operations.
pub type Result<T> = std::result::Result<T, CoordinationError>;
