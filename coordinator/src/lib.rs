//! Concord Coordinator
//!
//! In-process coordination engine. A coordination groups participants so that
//! they all learn the same outcome: either every participant is told the work
//! ended, or every participant is told it failed. Participants are held by at
//! most one coordination at a time, and coordinations can be stacked per
//! thread-of-control to express nesting.

pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod lock_table;
pub mod manager;
pub mod metrics;
pub mod participant;
pub mod scheduler;
pub mod state;
pub mod variables;

pub use config::{EngineConfig, LockConfig, SchedulerConfig};
pub use coordination::Coordination;
pub use coordinator::{Coordinator, CoordinatorId};
pub use manager::CoordinationMgr;
pub use metrics::{Metrics, MetricsSnapshot, SharedMetrics};
pub use participant::{Participant, ParticipantKey, ParticipantRef};
pub use state::EngineState;
pub use variables::Variables;
