//! Simulated shared resources enrolled as participants.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use concord_coordinator::{Coordination, Participant};
use concord_participant::{EventLog, RecordingParticipant};

/// A resource that coordinations compete for.
pub struct SimulatedResource {
    /// Resource identifier.
    pub id: String,
    recorder: RecordingParticipant,
    /// When set, `ended` callbacks report an error.
    faulty: AtomicBool,
    ended: AtomicU64,
    failed: AtomicU64,
}

impl SimulatedResource {
    /// Create a resource appending its notifications to `log`.
    pub fn new(id: impl Into<String>, log: EventLog) -> Self {
        let id = id.into();
        Self {
            recorder: RecordingParticipant::with_log(id.clone(), log),
            id,
            faulty: AtomicBool::new(false),
            ended: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Inject or clear a fault.
    pub fn set_faulty(&self, faulty: bool) {
        self.faulty.store(faulty, Ordering::SeqCst);
    }

    pub fn ended_count(&self) -> u64 {
        self.ended.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl Participant for SimulatedResource {
    fn ended(&self, coordination: &Coordination) -> anyhow::Result<()> {
        self.ended.fetch_add(1, Ordering::Relaxed);
        self.recorder.ended(coordination)?;
        if self.faulty.load(Ordering::SeqCst) {
            anyhow::bail!("resource {} could not apply work", self.id);
        }
        Ok(())
    }

    fn failed(&self, coordination: &Coordination) -> anyhow::Result<()> {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.recorder.failed(coordination)
    }
}

/// Resource factory for simulations.
pub struct ResourceFactory;

impl ResourceFactory {
    /// Create `count` resources sharing one event log; the first `faulty` are faulty.
    pub fn create_resources(count: usize, faulty: usize, log: &EventLog) -> Vec<Arc<SimulatedResource>> {
        (0..count)
            .map(|i| {
                let resource = SimulatedResource::new(format!("res-{:03}", i + 1), log.clone());
                resource.set_faulty(i < faulty);
                Arc::new(resource)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_marks_faulty_prefix() {
        let log = EventLog::new();
        let resources = ResourceFactory::create_resources(4, 1, &log);

        assert_eq!(resources.len(), 4);
        assert_eq!(resources[0].id, "res-001");
        assert!(resources[0].faulty.load(Ordering::SeqCst));
        assert!(!resources[3].faulty.load(Ordering::SeqCst));
    }
}
