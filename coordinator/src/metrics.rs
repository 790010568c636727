//! Metrics collection for engine monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Engine metrics.
#[derive(Debug)]
pub struct Metrics {
    /// Total coordinations created.
    pub coordinations_created: AtomicU64,
    /// Coordinations that ended.
    pub coordinations_ended: AtomicU64,
    /// Coordinations that failed (including timeouts).
    pub coordinations_failed: AtomicU64,
    /// Coordinations failed by their deadline.
    pub coordinations_timed_out: AtomicU64,
    /// Live coordinations.
    pub coordinations_active: AtomicU64,
    /// Total participants enrolled.
    pub participants_enrolled: AtomicU64,
    /// Participant callbacks that returned an error or panicked.
    pub participant_errors: AtomicU64,
    /// Participant acquisitions that had to wait.
    pub lock_waits: AtomicU64,
    /// Participant acquisitions that gave up waiting.
    pub lock_timeouts: AtomicU64,
    /// Participant acquisitions refused because of a wait-for cycle.
    pub deadlocks_detected: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            coordinations_created: AtomicU64::new(0),
            coordinations_ended: AtomicU64::new(0),
            coordinations_failed: AtomicU64::new(0),
            coordinations_timed_out: AtomicU64::new(0),
            coordinations_active: AtomicU64::new(0),
            participants_enrolled: AtomicU64::new(0),
            participant_errors: AtomicU64::new(0),
            lock_waits: AtomicU64::new(0),
            lock_timeouts: AtomicU64::new(0),
            deadlocks_detected: AtomicU64::new(0),
        }
    }

    /// Record coordination created.
    pub fn coordination_created(&self) {
        self.coordinations_created.fetch_add(1, Ordering::Relaxed);
        self.coordinations_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record coordination ended.
    pub fn coordination_ended(&self) {
        self.coordinations_ended.fetch_add(1, Ordering::Relaxed);
        self.coordinations_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record coordination failed.
    pub fn coordination_failed(&self, timed_out: bool) {
        self.coordinations_failed.fetch_add(1, Ordering::Relaxed);
        self.coordinations_active.fetch_sub(1, Ordering::Relaxed);
        if timed_out {
            self.coordinations_timed_out.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record participant enrolled.
    pub fn participant_enrolled(&self) {
        self.participants_enrolled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record participant callback error.
    pub fn participant_error(&self) {
        self.participant_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a blocked participant acquisition.
    pub fn lock_wait(&self) {
        self.lock_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record lock timeout.
    pub fn lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record detected deadlock.
    pub fn deadlock_detected(&self) {
        self.deadlocks_detected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            coordinations_created: self.coordinations_created.load(Ordering::Relaxed),
            coordinations_ended: self.coordinations_ended.load(Ordering::Relaxed),
            coordinations_failed: self.coordinations_failed.load(Ordering::Relaxed),
            coordinations_timed_out: self.coordinations_timed_out.load(Ordering::Relaxed),
            coordinations_active: self.coordinations_active.load(Ordering::Relaxed),
            participants_enrolled: self.participants_enrolled.load(Ordering::Relaxed),
            participant_errors: self.participant_errors.load(Ordering::Relaxed),
            lock_waits: self.lock_waits.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            deadlocks_detected: self.deadlocks_detected.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            r#"# HELP concord_coordinations_created Total number of coordinations
# TYPE concord_coordinations_created counter
concord_coordinations_created {}

# HELP concord_coordinations_ended Total ended coordinations
# TYPE concord_coordinations_ended counter
concord_coordinations_ended {}

# HELP concord_coordinations_failed Total failed coordinations
# TYPE concord_coordinations_failed counter
concord_coordinations_failed {}

# HELP concord_coordinations_timed_out Total coordinations failed by timeout
# TYPE concord_coordinations_timed_out counter
concord_coordinations_timed_out {}

# HELP concord_coordinations_active Current live coordinations
# TYPE concord_coordinations_active gauge
concord_coordinations_active {}

# HELP concord_participants_enrolled Total participants enrolled
# TYPE concord_participants_enrolled counter
concord_participants_enrolled {}

# HELP concord_participant_errors Total participant callback errors
# TYPE concord_participant_errors counter
concord_participant_errors {}

# HELP concord_lock_waits Total participant acquisitions that blocked
# TYPE concord_lock_waits counter
concord_lock_waits {}

# HELP concord_lock_timeouts Total participant acquisitions that timed out
# TYPE concord_lock_timeouts counter
concord_lock_timeouts {}

# HELP concord_deadlocks_detected Total wait-for cycles refused
# TYPE concord_deadlocks_detected counter
concord_deadlocks_detected {}
"#,
            snapshot.coordinations_created,
            snapshot.coordinations_ended,
            snapshot.coordinations_failed,
            snapshot.coordinations_timed_out,
            snapshot.coordinations_active,
            snapshot.participants_enrolled,
            snapshot.participant_errors,
            snapshot.lock_waits,
            snapshot.lock_timeouts,
            snapshot.deadlocks_detected,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub coordinations_created: u64,
    pub coordinations_ended: u64,
    pub coordinations_failed: u64,
    pub coordinations_timed_out: u64,
    pub coordinations_active: u64,
    pub participants_enrolled: u64,
    pub participant_errors: u64,
    pub lock_waits: u64,
    pub lock_timeouts: u64,
    pub deadlocks_detected: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;
