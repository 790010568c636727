//! Simulation controller.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use concord_common::{
    as_millis, constants, remaining, ContextId, CoordinationError, FailureReason,
};
use concord_coordinator::{
    Coordination, CoordinationMgr, Coordinator, EngineConfig, MetricsSnapshot, ParticipantRef,
};
use concord_participant::EventLog;

use crate::metrics::{IterationOutcome, SimulationMetrics};
use crate::resource::{ResourceFactory, SimulatedResource};
use crate::scenario::Scenario;

/// Upper bound on termination polls for an expiring coordination.
const MAX_TERMINATION_POLLS: usize = 500;

/// What a worker does with one iteration's coordinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    End,
    Fail,
    Expire,
}

/// Result of a simulation run.
#[derive(Debug)]
pub struct SimulationReport {
    /// Scenario name.
    pub scenario: String,
    /// Seed the workers derived their generators from.
    pub seed: u64,
    /// Per-iteration outcomes.
    pub metrics: SimulationMetrics,
    /// Engine counters after the run.
    pub engine: MetricsSnapshot,
    /// Engine metrics in Prometheus text format.
    pub prometheus: String,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
    /// Broken engine guarantees observed after the run.
    pub violations: Vec<String>,
}

/// Controls the simulation.
pub struct SimulationController {
    /// Scenario being run.
    scenario: Scenario,
    /// Base seed for the worker generators.
    seed: u64,
    /// Engine under test.
    manager: Arc<CoordinationMgr>,
    /// Shared resource pool.
    resources: Vec<Arc<SimulatedResource>>,
    /// Notifications delivered to the pool.
    log: EventLog,
}

impl SimulationController {
    /// Create a controller and its engine.
    pub fn new(scenario: Scenario, mut config: EngineConfig, seed: Option<u64>) -> anyhow::Result<Self> {
        scenario.validate()?;

        config.lock_config.acquire_timeout = (scenario.lock_timeout_ms > 0)
            .then(|| Duration::from_millis(scenario.lock_timeout_ms));
        let manager = CoordinationMgr::new(config)?;

        let seed = seed.unwrap_or_else(rand::random);
        let log = EventLog::new();
        let resources =
            ResourceFactory::create_resources(scenario.resources, scenario.faulty_resources, &log);

        info!(
            scenario = %scenario.name,
            workers = scenario.workers,
            resources = resources.len(),
            seed,
            "Simulation initialized"
        );

        Ok(Self {
            scenario,
            seed,
            manager,
            resources,
            log,
        })
    }

    /// Run every worker to completion.
    pub async fn run(&self) -> anyhow::Result<SimulationReport> {
        info!(
            "Running scenario: {} - {}",
            self.scenario.name, self.scenario.description
        );
        let started = Instant::now();

        let handles = (0..self.scenario.workers).map(|id| {
            let worker = Worker {
                id,
                scenario: self.scenario.clone(),
                manager: self.manager.clone(),
                resources: self.resources.clone(),
                rng: StdRng::seed_from_u64(self.seed.wrapping_add(id as u64)),
            };
            tokio::task::spawn_blocking(move || worker.run())
        });

        let mut metrics = SimulationMetrics::new();
        for result in futures::future::join_all(handles).await {
            metrics.merge(&result??);
        }
        let elapsed = started.elapsed();

        let violations = self.check_invariants();
        for violation in &violations {
            warn!(violation = %violation, "Engine guarantee violated");
        }

        let engine = self.manager.metrics();
        Ok(SimulationReport {
            scenario: self.scenario.name.clone(),
            seed: self.seed,
            metrics,
            engine: engine.snapshot(),
            prometheus: engine.to_prometheus(),
            elapsed,
            violations,
        })
    }

    /// Stop the engine.
    pub fn shutdown(&self) {
        self.manager.shutdown();
    }

    /// Resources whose callbacks ran, with (ended, failed) counts.
    pub fn resource_usage(&self) -> Vec<(String, u64, u64)> {
        self.resources
            .iter()
            .map(|r| (r.id.clone(), r.ended_count(), r.failed_count()))
            .filter(|(_, ended, failed)| ended + failed > 0)
            .collect()
    }

    fn check_invariants(&self) -> Vec<String> {
        let mut violations = Vec::new();

        let mut seen = HashSet::new();
        for event in self.log.snapshot() {
            if !seen.insert((event.coordination, event.participant.clone())) {
                violations.push(format!(
                    "{} notified more than once by coordination {}",
                    event.participant, event.coordination
                ));
            }
        }

        for resource in &self.resources {
            let participant: ParticipantRef = resource.clone();
            if let Some(holder) = self.manager.participant_holder(&participant) {
                violations.push(format!("{} still held by coordination {}", resource.id, holder));
            }
        }

        let live = self.manager.coordinations();
        if !live.is_empty() {
            violations.push(format!("{} coordinations still live", live.len()));
        }

        violations
    }
}

/// One simulated thread-of-control.
struct Worker {
    id: usize,
    scenario: Scenario,
    manager: Arc<CoordinationMgr>,
    resources: Vec<Arc<SimulatedResource>>,
    rng: StdRng,
}

impl Worker {
    fn run(mut self) -> anyhow::Result<SimulationMetrics> {
        let ctx = ContextId::new(self.id as u32 + 1);
        let coordinator = self.manager.coordinator(format!("worker-{}", self.id));
        let mut metrics = SimulationMetrics::new();

        for iteration in 0..self.scenario.iterations {
            let started = Instant::now();
            let outcome = self.iteration(&coordinator, ctx, iteration)?;
            drain(&coordinator, ctx);
            metrics.record(outcome, as_millis(started.elapsed()));
        }

        debug!(worker = self.id, "Worker finished");
        Ok(metrics)
    }

    fn iteration(
        &mut self,
        coordinator: &Coordinator,
        ctx: ContextId,
        iteration: usize,
    ) -> anyhow::Result<IterationOutcome> {
        let plan = self.plan();
        let depth = self.scenario.nesting_depth;

        let mut levels = Vec::with_capacity(depth);
        for level in 0..depth {
            let timeout_ms = if plan == Plan::Expire && level + 1 == depth {
                i64::try_from(self.scenario.timeout_ms)?
            } else {
                0
            };
            let name = format!("sim.w{}.i{}.l{}", self.id, iteration, level);
            levels.push(coordinator.begin(ctx, &name, timeout_ms)?);
        }
        let outer = levels[0].clone();
        let innermost = levels[depth - 1].clone();

        let picks = self.pick_resources();
        let per_level = picks.len().div_ceil(depth).max(1);
        for (i, participant) in picks.into_iter().enumerate() {
            let level = (i / per_level).min(depth - 1);
            if let Err(e) = levels[level].add_participant(participant) {
                debug!(worker = self.id, iteration, code = e.error_code(), error = %e, "Enrollment refused");
                innermost.fail(FailureReason::application(format!("enrollment refused: {e}")));
                end_logged(&outer, ctx);
                return Ok(if is_timed_out(&innermost) {
                    IterationOutcome::TimedOut
                } else {
                    IterationOutcome::Rejected
                });
            }
        }

        let hold = Duration::from_millis(self.scenario.hold_ms);
        match plan {
            Plan::End => thread::sleep(hold),
            Plan::Fail => {
                thread::sleep(hold);
                coordinator.fail(ctx, FailureReason::application("simulated abort"));
            }
            Plan::Expire => {
                if let Some(deadline) = innermost.deadline() {
                    thread::sleep(remaining(deadline));
                }
                await_termination(&innermost)?;
            }
        }

        Ok(classify(outer.end(ctx), &innermost))
    }

    fn plan(&mut self) -> Plan {
        let roll: f64 = self.rng.gen();
        if roll < self.scenario.fail_probability {
            Plan::Fail
        } else if roll < self.scenario.fail_probability + self.scenario.timeout_probability {
            Plan::Expire
        } else {
            Plan::End
        }
    }

    fn pick_resources(&mut self) -> Vec<ParticipantRef> {
        let mut picks = rand::seq::index::sample(
            &mut self.rng,
            self.resources.len(),
            self.scenario.participants_per_iteration,
        )
        .into_vec();
        if self.scenario.ordered_acquisition {
            picks.sort_unstable();
        }

        picks
            .into_iter()
            .map(|i| -> ParticipantRef { self.resources[i].clone() })
            .collect()
    }
}

fn is_timed_out(coordination: &Coordination) -> bool {
    coordination.failure().is_some_and(|r| r.is_timeout())
}

fn classify(result: Result<(), CoordinationError>, innermost: &Coordination) -> IterationOutcome {
    match result {
        Ok(()) => IterationOutcome::Ended,
        Err(CoordinationError::PartiallyEnded { .. }) => IterationOutcome::PartiallyEnded,
        Err(_) if is_timed_out(innermost) => IterationOutcome::TimedOut,
        Err(_) => IterationOutcome::Failed,
    }
}

fn await_termination(coordination: &Coordination) -> anyhow::Result<()> {
    let tick = i64::try_from(as_millis(constants::poll_interval()))?;
    for _ in 0..MAX_TERMINATION_POLLS {
        if coordination.join(tick)? {
            return Ok(());
        }
    }
    anyhow::bail!("coordination {} did not reach a final state", coordination.id())
}

/// End `coordination`, logging errors other than its terminal outcome.
///
/// Returns the unexpected error, if any.
fn end_logged(coordination: &Coordination, ctx: ContextId) -> Option<CoordinationError> {
    match coordination.end(ctx) {
        Err(e) if !e.is_terminal_signal() => {
            warn!(coordination_id = %coordination.id(), error = %e, "Could not end coordination");
            Some(e)
        }
        _ => None,
    }
}

/// End whatever an aborted iteration left on the stack of `ctx`.
fn drain(coordinator: &Coordinator, ctx: ContextId) {
    while let Ok(leftover) = coordinator.pop(ctx) {
        if end_logged(&leftover, ctx).is_none() {
            debug!(coordination_id = %leftover.id(), "Drained coordination");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(name: &str) -> Scenario {
        Scenario {
            workers: 3,
            iterations: 12,
            hold_ms: 1,
            timeout_ms: 10,
            ..Scenario::load(name).unwrap()
        }
    }

    #[test]
    fn test_end_logged_reports_only_unexpected_errors() {
        let manager = CoordinationMgr::new(EngineConfig::default()).unwrap();
        let coordinator = manager.coordinator("worker-test");
        let ctx = ContextId::new(1);

        let pinned = coordinator.begin(ctx, "pinned", 0).unwrap();
        assert!(matches!(
            end_logged(&pinned, ContextId::new(2)),
            Some(CoordinationError::WrongThread { .. })
        ));

        pinned.fail(FailureReason::application("abort"));
        assert!(end_logged(&pinned, ctx).is_none());
        assert!(end_logged(&pinned, ctx).is_none());
        assert!(coordinator.peek(ctx).is_none());
    }

    #[tokio::test]
    async fn test_contention_keeps_guarantees() {
        let scenario = small("contention");
        let controller =
            SimulationController::new(scenario, EngineConfig::default(), Some(7)).unwrap();

        let report = controller.run().await.unwrap();

        assert_eq!(report.metrics.total_iterations, 36);
        assert!(report.violations.is_empty(), "{:?}", report.violations);
        assert_eq!(report.engine.coordinations_active, 0);
        controller.shutdown();
    }

    #[tokio::test]
    async fn test_timeouts_are_counted() {
        let scenario = Scenario {
            timeout_probability: 1.0,
            ..small("timeouts")
        };
        let controller =
            SimulationController::new(scenario, EngineConfig::default(), Some(11)).unwrap();

        let report = controller.run().await.unwrap();

        assert_eq!(report.metrics.timed_out, 36);
        assert_eq!(report.engine.coordinations_timed_out, 36);
        assert!(report.violations.is_empty(), "{:?}", report.violations);
    }

    #[tokio::test]
    async fn test_nested_and_faulty_resources() {
        let scenario = Scenario {
            faulty_resources: 24,
            fail_probability: 0.0,
            ..small("nested")
        };
        let controller =
            SimulationController::new(scenario, EngineConfig::default(), Some(3)).unwrap();

        let report = controller.run().await.unwrap();

        // Every resource is faulty, so no iteration ends cleanly.
        assert_eq!(report.metrics.ended, 0);
        assert_eq!(
            report.metrics.partially_ended + report.metrics.failed,
            report.metrics.total_iterations
        );
        assert!(report.violations.is_empty(), "{:?}", report.violations);
        assert!(report.prometheus.contains("concord_coordinations_created"));
        assert!(!controller.resource_usage().is_empty());
    }
}
