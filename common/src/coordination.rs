//! Coordination lifecycle states and failure reasons.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordination state representing the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinationState {
    /// Accepting participants.
    Active,
    /// One thread won the termination transition and is notifying participants.
    Terminating,
    /// Failed; participants were notified through `failed`.
    Failed,
    /// Ended; no further changes.
    Terminated,
}

impl CoordinationState {
    /// Check if this is a final state.
    pub fn is_final(&self) -> bool {
        matches!(self, CoordinationState::Failed | CoordinationState::Terminated)
    }

    /// Check if the coordination left the active state.
    pub fn is_terminated(&self) -> bool {
        !matches!(self, CoordinationState::Active)
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[CoordinationState] {
        match self {
            CoordinationState::Active => &[CoordinationState::Terminating],
            CoordinationState::Terminating => {
                &[CoordinationState::Failed, CoordinationState::Terminated]
            }
            // `end()` on a failed coordination finalizes it.
            CoordinationState::Failed => &[CoordinationState::Terminated],
            CoordinationState::Terminated => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: CoordinationState) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for CoordinationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoordinationState::Active => "ACTIVE",
            CoordinationState::Terminating => "TERMINATING",
            CoordinationState::Failed => "FAILED",
            CoordinationState::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

/// Failure codes for coordinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    /// The deadline elapsed before the coordination ended.
    Timeout,
    /// The owner went away or the engine shut down.
    Released,
    /// A nested coordination failed while the enclosing one was ending.
    NestedFailed,
    /// Failed explicitly by application code.
    Application,
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureCode::Timeout => "TIMEOUT",
            FailureCode::Released => "RELEASED",
            FailureCode::NestedFailed => "NESTED_FAILED",
            FailureCode::Application => "APPLICATION",
        };
        f.write_str(s)
    }
}

/// Why a coordination failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Failure code.
    pub code: FailureCode,
    /// Human-readable message.
    pub message: String,
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
}

impl FailureReason {
    /// Create a failure reason.
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            failed_at: Utc::now(),
        }
    }

    /// The deadline elapsed.
    pub fn timeout() -> Self {
        Self::new(FailureCode::Timeout, "coordination timed out")
    }

    /// The owner released the coordination.
    pub fn released() -> Self {
        Self::new(FailureCode::Released, "coordination released by its owner")
    }

    /// A nested coordination failed to end.
    pub fn nested(cause: impl fmt::Display) -> Self {
        Self::new(
            FailureCode::NestedFailed,
            format!("nested coordination failed: {cause}"),
        )
    }

    /// Application-supplied failure.
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(FailureCode::Application, message)
    }

    /// Check if this failure was caused by the deadline elapsing.
    pub fn is_timeout(&self) -> bool {
        self.code == FailureCode::Timeout
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        assert!(CoordinationState::Active.can_transition_to(CoordinationState::Terminating));
        assert!(CoordinationState::Terminating.can_transition_to(CoordinationState::Failed));
        assert!(CoordinationState::Terminating.can_transition_to(CoordinationState::Terminated));
        assert!(CoordinationState::Failed.can_transition_to(CoordinationState::Terminated));
    }

    #[test]
    fn test_no_transition_back_to_active() {
        for state in [
            CoordinationState::Active,
            CoordinationState::Terminating,
            CoordinationState::Failed,
            CoordinationState::Terminated,
        ] {
            assert!(!state.can_transition_to(CoordinationState::Active));
        }
        assert!(!CoordinationState::Active.can_transition_to(CoordinationState::Terminated));
    }

    #[test]
    fn test_final_states() {
        assert!(CoordinationState::Failed.is_final());
        assert!(CoordinationState::Terminated.is_final());
        assert!(!CoordinationState::Terminating.is_final());
        assert!(CoordinationState::Terminating.is_terminated());
        assert!(!CoordinationState::Active.is_terminated());
    }

    #[test]
    fn test_failure_reason_serialization() {
        let reason = FailureReason::timeout();
        assert!(reason.is_timeout());

        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["code"], "TIMEOUT");
        assert_eq!(reason.to_string(), "TIMEOUT: coordination timed out");
    }
}
