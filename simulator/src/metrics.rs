//! Simulation metrics.

use std::collections::VecDeque;

/// How an iteration's outermost coordination finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Ended with every participant accepting.
    Ended,
    /// Ended, but some participant reported an error.
    PartiallyEnded,
    /// Failed explicitly or through a failed nested coordination.
    Failed,
    /// Failed by a deadline.
    TimedOut,
    /// Enrollment was refused (lock timeout, deadlock, terminated).
    Rejected,
}

/// Simulation metrics.
#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    /// Total iterations run.
    pub total_iterations: u64,
    /// Cleanly ended iterations.
    pub ended: u64,
    /// Partially ended iterations.
    pub partially_ended: u64,
    /// Failed iterations.
    pub failed: u64,
    /// Timed-out iterations.
    pub timed_out: u64,
    /// Iterations whose enrollment was refused.
    pub rejected: u64,
    /// Latency samples (ms).
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_iterations: 0,
            ended: 0,
            partially_ended: 0,
            failed: 0,
            timed_out: 0,
            rejected: 0,
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record one iteration.
    pub fn record(&mut self, outcome: IterationOutcome, latency_ms: u64) {
        self.total_iterations += 1;
        match outcome {
            IterationOutcome::Ended => self.ended += 1,
            IterationOutcome::PartiallyEnded => self.partially_ended += 1,
            IterationOutcome::Failed => self.failed += 1,
            IterationOutcome::TimedOut => self.timed_out += 1,
            IterationOutcome::Rejected => self.rejected += 1,
        }

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_ms);
    }

    /// Fold another worker's metrics into these.
    pub fn merge(&mut self, other: &SimulationMetrics) {
        self.total_iterations += other.total_iterations;
        self.ended += other.ended;
        self.partially_ended += other.partially_ended;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
        self.rejected += other.rejected;
        for sample in &other.latency_samples {
            if self.latency_samples.len() >= self.max_samples {
                self.latency_samples.pop_front();
            }
            self.latency_samples.push_back(*sample);
        }
    }

    /// Get average latency in ms.
    pub fn average_latency_ms(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    /// Get p50 latency.
    pub fn p50_latency_ms(&self) -> u64 {
        self.percentile_latency(50)
    }

    /// Get p99 latency.
    pub fn p99_latency_ms(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Share of iterations that ended (fully or partially).
    pub fn success_rate(&self) -> f64 {
        if self.total_iterations == 0 {
            return 0.0;
        }

        (self.ended + self.partially_ended) as f64 / self.total_iterations as f64
    }

    /// Iterations per second.
    pub fn throughput(&self, duration_secs: f64) -> f64 {
        if duration_secs <= 0.0 {
            return 0.0;
        }

        self.total_iterations as f64 / duration_secs
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let mut metrics = SimulationMetrics::new();

        metrics.record(IterationOutcome::Ended, 100);
        metrics.record(IterationOutcome::PartiallyEnded, 200);
        metrics.record(IterationOutcome::Ended, 150);
        metrics.record(IterationOutcome::TimedOut, 50);

        assert_eq!(metrics.total_iterations, 4);
        assert_eq!(metrics.ended, 2);
        assert_eq!(metrics.timed_out, 1);
        assert_eq!(metrics.average_latency_ms(), 125);
        assert_eq!(metrics.success_rate(), 0.75);
        assert_eq!(metrics.p50_latency_ms(), 150);
        assert_eq!(metrics.p99_latency_ms(), 200);
    }

    #[test]
    fn test_merge() {
        let mut a = SimulationMetrics::new();
        a.record(IterationOutcome::Failed, 10);
        let mut b = SimulationMetrics::new();
        b.record(IterationOutcome::Rejected, 30);

        a.merge(&b);
        assert_eq!(a.total_iterations, 2);
        assert_eq!(a.failed, 1);
        assert_eq!(a.rejected, 1);
        assert_eq!(a.average_latency_ms(), 20);
        assert_eq!(a.throughput(2.0), 1.0);
    }
}
