//! Simulation scenarios.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Concurrent workers, each with its own thread-of-control.
    pub workers: usize,
    /// Coordinations begun by each worker.
    pub iterations: usize,
    /// Size of the shared resource pool.
    pub resources: usize,
    /// Resources whose `ended` callback reports an error.
    pub faulty_resources: usize,
    /// Resources enrolled per iteration, spread over the nesting levels.
    pub participants_per_iteration: usize,
    /// Coordinations stacked per iteration.
    pub nesting_depth: usize,
    /// Simulated work between enrollment and termination (ms).
    pub hold_ms: u64,
    /// Timeout given to coordinations that are left to expire (ms).
    pub timeout_ms: u64,
    /// Participant lock wait bound (ms, 0 = unbounded).
    pub lock_timeout_ms: u64,
    /// Acquire resources in pool order, which rules out wait-for cycles.
    pub ordered_acquisition: bool,
    /// Share of iterations failed explicitly.
    pub fail_probability: f64,
    /// Share of iterations left to time out.
    pub timeout_probability: f64,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            name: "custom".to_string(),
            description: String::new(),
            workers: 4,
            iterations: 50,
            resources: 8,
            faulty_resources: 0,
            participants_per_iteration: 2,
            nesting_depth: 1,
            hold_ms: 2,
            timeout_ms: 25,
            lock_timeout_ms: 2_000,
            ordered_acquisition: true,
            fail_probability: 0.0,
            timeout_probability: 0.0,
        }
    }
}

impl Scenario {
    /// Load a scenario by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "contention" => Ok(Self::contention()),
            "timeouts" => Ok(Self::timeouts()),
            "nested" => Ok(Self::nested()),
            "mixed" => Ok(Self::mixed()),
            _ => Err(anyhow::anyhow!("Unknown scenario: {}", name)),
        }
    }

    /// Load a scenario from a JSON file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario file {}", path.display()))?;
        let scenario: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing scenario file {}", path.display()))?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Validate scenario parameters.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 || self.iterations == 0 {
            anyhow::bail!("workers and iterations must be positive");
        }
        if self.participants_per_iteration > self.resources {
            anyhow::bail!(
                "cannot enroll {} of {} resources",
                self.participants_per_iteration,
                self.resources
            );
        }
        if self.nesting_depth == 0 {
            anyhow::bail!("nesting depth must be at least 1");
        }
        if self.timeout_ms == 0 {
            anyhow::bail!("timeout must be positive");
        }
        let probabilities = self.fail_probability + self.timeout_probability;
        if self.fail_probability < 0.0 || self.timeout_probability < 0.0 || probabilities > 1.0 {
            anyhow::bail!("outcome probabilities must lie in [0, 1] and sum to at most 1");
        }
        Ok(())
    }

    /// Many workers competing for few resources in random order.
    fn contention() -> Self {
        Self {
            name: "contention".to_string(),
            description: "Workers race for a small pool; wait-for cycles are refused".to_string(),
            workers: 8,
            iterations: 100,
            resources: 4,
            participants_per_iteration: 2,
            ordered_acquisition: false,
            ..Self::default()
        }
    }

    /// Most coordinations are left to their deadline.
    fn timeouts() -> Self {
        Self {
            name: "timeouts".to_string(),
            description: "Coordinations expire while holding resources".to_string(),
            workers: 4,
            iterations: 40,
            resources: 16,
            timeout_ms: 20,
            timeout_probability: 0.7,
            ..Self::default()
        }
    }

    /// Stacked coordinations ended from the outermost level.
    fn nested() -> Self {
        Self {
            name: "nested".to_string(),
            description: "Three-level nesting with occasional inner failures".to_string(),
            workers: 4,
            iterations: 50,
            resources: 24,
            participants_per_iteration: 3,
            nesting_depth: 3,
            fail_probability: 0.2,
            ..Self::default()
        }
    }

    /// Every outcome, nesting and a faulty resource.
    fn mixed() -> Self {
        Self {
            name: "mixed".to_string(),
            description: "Ends, failures, timeouts and faulty participants together".to_string(),
            workers: 6,
            iterations: 60,
            resources: 12,
            faulty_resources: 1,
            participants_per_iteration: 3,
            nesting_depth: 2,
            fail_probability: 0.15,
            timeout_probability: 0.15,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_scenarios_are_valid() {
        for name in ["contention", "timeouts", "nested", "mixed"] {
            let scenario = Scenario::load(name).unwrap();
            assert_eq!(scenario.name, name);
            scenario.validate().unwrap();
        }
        assert!(Scenario::load("nope").is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let scenario: Scenario =
            serde_json::from_str(r#"{"name": "tiny", "workers": 2, "iterations": 3}"#).unwrap();

        assert_eq!(scenario.workers, 2);
        assert_eq!(scenario.resources, Scenario::default().resources);
        scenario.validate().unwrap();
    }

    #[test]
    fn test_invalid_probabilities() {
        let scenario = Scenario {
            fail_probability: 0.7,
            timeout_probability: 0.5,
            ..Scenario::default()
        };
        assert!(scenario.validate().is_err());
    }
}
