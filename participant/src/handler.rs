//! Logging and callback participants.

use concord_coordinator::{Coordination, Participant};

/// Participant that logs notifications but doesn't act on them.
pub struct LoggingParticipant {
    label: String,
}

impl LoggingParticipant {
    /// Create a logging participant.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Participant for LoggingParticipant {
    fn ended(&self, coordination: &Coordination) -> anyhow::Result<()> {
        tracing::info!(
            participant = %self.label,
            coordination_id = %coordination.id(),
            name = %coordination.name(),
            "Coordination ended"
        );
        Ok(())
    }

    fn failed(&self, coordination: &Coordination) -> anyhow::Result<()> {
        let reason = coordination
            .failure()
            .map(|r| r.to_string())
            .unwrap_or_default();
        tracing::warn!(
            participant = %self.label,
            coordination_id = %coordination.id(),
            name = %coordination.name(),
            reason = %reason,
            "Coordination failed"
        );
        Ok(())
    }
}

type Callback = Box<dyn Fn(&Coordination) -> anyhow::Result<()> + Send + Sync>;

/// Participant that forwards notifications to callback functions.
///
/// A missing callback accepts the notification.
pub struct CallbackParticipant {
    on_ended: Option<Callback>,
    on_failed: Option<Callback>,
}

impl CallbackParticipant {
    /// Create a participant without callbacks.
    pub fn new() -> Self {
        Self {
            on_ended: None,
            on_failed: None,
        }
    }

    /// Set the ended callback.
    pub fn on_ended<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Coordination) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_ended = Some(Box::new(callback));
        self
    }

    /// Set the failed callback.
    pub fn on_failed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Coordination) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_failed = Some(Box::new(callback));
        self
    }
}

impl Default for CallbackParticipant {
    fn default() -> Self {
        Self::new()
    }
}

impl Participant for CallbackParticipant {
    fn ended(&self, coordination: &Coordination) -> anyhow::Result<()> {
        match &self.on_ended {
            Some(callback) => callback(coordination),
            None => Ok(()),
        }
    }

    fn failed(&self, coordination: &Coordination) -> anyhow::Result<()> {
        match &self.on_failed {
            Some(callback) => callback(coordination),
            None => Ok(()),
        }
    }
}
