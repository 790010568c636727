//! Concord Participant Library
//!
//! Ready-made [`Participant`](concord_coordinator::Participant) implementations:
//! one that only logs, one that forwards to closures, and one that records
//! every notification for later inspection.

pub mod handler;
pub mod recording;

pub use handler::{CallbackParticipant, LoggingParticipant};
pub use recording::{EventLog, Notification, ParticipantEvent, RecordingParticipant};
