//! Participant that records every notification it receives.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use concord_common::{now, CoordinationId, FailureCode, Timestamp};
use concord_coordinator::{Coordination, Participant};

/// Which callback was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Notification {
    Ended,
    Failed,
}

/// One delivered notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantEvent {
    /// Label of the notified participant.
    pub participant: String,
    /// Coordination that terminated.
    pub coordination: CoordinationId,
    /// Callback that was delivered.
    pub notification: Notification,
    /// Failure code, for failed notifications.
    pub failure: Option<FailureCode>,
    /// When the notification was delivered.
    pub at: Timestamp,
}

/// Event log shared between any number of recording participants.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<ParticipantEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, event: ParticipantEvent) {
        self.events.lock().push(event);
    }

    /// Copy of every event, in delivery order.
    pub fn snapshot(&self) -> Vec<ParticipantEvent> {
        self.events.lock().clone()
    }

    /// Events delivered for one coordination, in delivery order.
    pub fn for_coordination(&self, id: CoordinationId) -> Vec<ParticipantEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.coordination == id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

/// Participant that appends a [`ParticipantEvent`] to an [`EventLog`].
pub struct RecordingParticipant {
    label: String,
    log: EventLog,
}

impl RecordingParticipant {
    /// Create a participant with its own log.
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_log(label, EventLog::new())
    }

    /// Create a participant appending to a shared log.
    pub fn with_log(label: impl Into<String>, log: EventLog) -> Self {
        Self {
            label: label.into(),
            log,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    fn record(&self, coordination: &Coordination, notification: Notification) {
        self.log.record(ParticipantEvent {
            participant: self.label.clone(),
            coordination: coordination.id(),
            notification,
            failure: coordination.failure().map(|r| r.code),
            at: now(),
        });
    }
}

impl Participant for RecordingParticipant {
    fn ended(&self, coordination: &Coordination) -> anyhow::Result<()> {
        self.record(coordination, Notification::Ended);
        Ok(())
    }

    fn failed(&self, coordination: &Coordination) -> anyhow::Result<()> {
        self.record(coordination, Notification::Failed);
        Ok(())
    }
}
