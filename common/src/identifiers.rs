//! Identifier types for coordination engine entities.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::error::{CoordinationError, Result};

/// Unique identifier for a coordination.
/// Assigned by the manager from a monotonically increasing counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoordinationId(u64);

impl CoordinationId {
    /// Create a coordination ID from a raw value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CoordinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token identifying a thread-of-control.
///
/// Coordination stacks are keyed by this token instead of living in
/// thread-local storage. [`ContextId::current`] hands out one stable token per
/// OS thread; [`ContextId::new`] mints arbitrary tokens for callers that
/// multiplex several logical contexts onto one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(u64);

static NEXT_THREAD_CONTEXT: AtomicU64 = AtomicU64::new(1 << 32);

thread_local! {
    static THREAD_CONTEXT: ContextId =
        ContextId(NEXT_THREAD_CONTEXT.fetch_add(1, Ordering::Relaxed));
}

impl ContextId {
    /// Create a context token from a raw value.
    ///
    /// Values at or above `2^32` are reserved for [`ContextId::current`].
    pub fn new(id: u32) -> Self {
        Self(u64::from(id))
    }

    /// Token of the calling OS thread.
    pub fn current() -> Self {
        THREAD_CONTEXT.with(|ctx| *ctx)
    }

    /// Get the raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Identifier of the logical owner of a coordinator façade.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(String);

impl OwnerId {
    /// Create a new owner ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random owner ID.
    pub fn generate() -> Self {
        Self(format!("owner-{}", Uuid::new_v4()))
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for OwnerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Validated coordination name.
///
/// Grammar: one or more dot-separated segments, each a non-empty run of
/// ASCII letters, digits, `_` or `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoordinationName(String);

impl CoordinationName {
    /// Parse and validate a name.
    pub fn parse(name: &str) -> Result<Self> {
        if Self::is_valid(name) {
            Ok(Self(name.to_string()))
        } else {
            Err(CoordinationError::InvalidName(name.to_string()))
        }
    }

    /// Check a candidate name against the token grammar.
    pub fn is_valid(name: &str) -> bool {
        !name.is_empty()
            && name.split('.').all(|segment| {
                !segment.is_empty()
                    && segment
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
            })
    }

    /// Get the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CoordinationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_name_validation() {
        assert!(CoordinationName::is_valid("txn"));
        assert!(CoordinationName::is_valid("com.example.batch-import_2"));
        assert!(CoordinationName::is_valid("valid.name-1"));
        assert!(!CoordinationName::is_valid(""));
        assert!(!CoordinationName::is_valid("bad name!"));
        assert!(!CoordinationName::is_valid(" valid.name-1"));
        assert!(!CoordinationName::is_valid("a..b"));
        assert!(!CoordinationName::is_valid(".leading"));
        assert!(!CoordinationName::is_valid("trailing."));
        assert!(!CoordinationName::is_valid("ünïcode"));
    }

    #[test]
    fn test_name_parse_error() {
        let err = CoordinationName::parse("bad name!").unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidName(ref n) if n == "bad name!"));
    }

    #[test]
    fn test_thread_context_is_stable() {
        let first = ContextId::current();
        assert_eq!(first, ContextId::current());

        let other = std::thread::spawn(ContextId::current).join().unwrap();
        assert_ne!(first, other);
        assert_ne!(first, ContextId::new(1));
    }

    #[test]
    fn test_owner_id_generate() {
        let a = OwnerId::generate();
        let b = OwnerId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("owner-"));
    }

    proptest! {
        #[test]
        fn prop_dotted_tokens_are_valid(segments in prop::collection::vec("[A-Za-z0-9_-]{1,8}", 1..5)) {
            let name = segments.join(".");
            prop_assert!(CoordinationName::is_valid(&name));
        }

        #[test]
        fn prop_names_with_forbidden_chars_are_invalid(
            prefix in "[a-z]{0,4}",
            bad in "[ !@#$%^&*()+=/]",
            suffix in "[a-z]{0,4}",
        ) {
            let name = format!("{prefix}{bad}{suffix}");
            prop_assert!(!CoordinationName::is_valid(&name));
        }
    }
}
