//! Engine configuration.

use std::time::Duration;

use concord_common::constants;

/// Participant lock configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Maximum time to wait for a participant held by another coordination.
    /// `None` waits until the holder terminates.
    pub acquire_timeout: Option<Duration>,
    /// Fail fast when waiting would close a wait-for cycle between coordinations.
    pub detect_deadlocks: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Some(constants::default_lock_acquire_timeout()),
            detect_deadlocks: true,
        }
    }
}

/// Timeout scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Name of the timer worker thread.
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_name: "concord-timer".to_string(),
        }
    }
}

/// Main engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lock configuration.
    pub lock_config: LockConfig,
    /// Scheduler configuration.
    pub scheduler_config: SchedulerConfig,
    /// Upper bound for coordination timeouts in milliseconds (0 = unlimited).
    pub max_timeout_ms: u64,
    /// Log level.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_config: LockConfig::default(),
            scheduler_config: SchedulerConfig::default(),
            max_timeout_ms: 0,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(ms) = std::env::var("CONCORD_LOCK_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                config.lock_config.acquire_timeout =
                    (ms > 0).then(|| Duration::from_millis(ms));
            }
        }

        if let Ok(flag) = std::env::var("CONCORD_DETECT_DEADLOCKS") {
            if let Ok(flag) = flag.parse() {
                config.lock_config.detect_deadlocks = flag;
            }
        }

        if let Ok(ms) = std::env::var("CONCORD_MAX_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                config.max_timeout_ms = ms;
            }
        }

        if let Ok(name) = std::env::var("CONCORD_TIMER_THREAD") {
            config.scheduler_config.thread_name = name;
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.lock_config.acquire_timeout == Some(Duration::ZERO) {
            return Err("Lock acquire timeout cannot be zero".to_string());
        }

        if self.scheduler_config.thread_name.is_empty() {
            return Err("Timer thread name cannot be empty".to_string());
        }

        if i64::try_from(self.max_timeout_ms).is_err() {
            return Err("Maximum timeout is out of range".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.lock_config.detect_deadlocks);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = EngineConfig::default();
        config.lock_config.acquire_timeout = Some(Duration::ZERO);
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.scheduler_config.thread_name.clear();
        assert!(config.validate().is_err());
    }
}
