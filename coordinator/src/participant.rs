//! Participant capability and identity.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::coordination::Coordination;

/// A collaborator enrolled in a coordination.
///
/// Exactly one of the two callbacks is invoked, exactly once, when the
/// coordination terminates. Errors and panics are caught by the engine: during
/// `fail` they are logged, during `end` they are reported together as a
/// partially-ended error once every participant has been notified.
pub trait Participant: Send + Sync {
    /// The coordination ended successfully.
    fn ended(&self, coordination: &Coordination) -> anyhow::Result<()>;

    /// The coordination failed.
    fn failed(&self, coordination: &Coordination) -> anyhow::Result<()>;
}

/// Shared handle to a participant.
pub type ParticipantRef = Arc<dyn Participant>;

/// Identity of a participant instance.
///
/// Two handles are the same participant when they point at the same
/// allocation. The lock table only holds keys of participants that are also
/// held by a live coordination, so an address cannot be reused while locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantKey(usize);

impl ParticipantKey {
    /// Key of the participant behind `participant`.
    pub fn of(participant: &ParticipantRef) -> Self {
        Self(Arc::as_ptr(participant) as *const () as usize)
    }
}

impl fmt::Display for ParticipantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "participant@{:#x}", self.0)
    }
}

/// Which terminal callback to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Ended,
    Failed,
}

/// Invoke a terminal callback, converting a panic into an error.
pub(crate) fn notify(
    participant: &ParticipantRef,
    coordination: &Coordination,
    outcome: Outcome,
) -> anyhow::Result<()> {
    let result = panic::catch_unwind(AssertUnwindSafe(|| match outcome {
        Outcome::Ended => participant.ended(coordination),
        Outcome::Failed => participant.failed(coordination),
    }));

    match result {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!(
            "participant panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Behavior {
        Succeed,
        Error,
        Panic,
    }

    /// Participant appending `label:ended` / `label:failed` to a shared log.
    pub struct Recorder {
        label: String,
        log: Arc<Mutex<Vec<String>>>,
        behavior: Behavior,
    }

    impl Recorder {
        pub fn new(label: &str) -> Arc<Self> {
            Self::with_log(label, Arc::new(Mutex::new(Vec::new())), Behavior::Succeed)
        }

        pub fn with_log(
            label: &str,
            log: Arc<Mutex<Vec<String>>>,
            behavior: Behavior,
        ) -> Arc<Self> {
            Arc::new(Self {
                label: label.to_string(),
                log,
                behavior,
            })
        }

        pub fn events(&self) -> Vec<String> {
            self.log.lock().clone()
        }

        fn record(&self, event: &str) -> anyhow::Result<()> {
            self.log.lock().push(format!("{}:{}", self.label, event));
            match self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Error => anyhow::bail!("{} refused", self.label),
                Behavior::Panic => panic!("{} exploded", self.label),
            }
        }
    }

    impl Participant for Recorder {
        fn ended(&self, _: &Coordination) -> anyhow::Result<()> {
            self.record("ended")
        }

        fn failed(&self, _: &Coordination) -> anyhow::Result<()> {
            self.record("failed")
        }
    }
}
