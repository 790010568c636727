//! Concord Common Types
//!
//! This crate contains shared types used across the Concord coordination
//! engine, including identifiers, coordination states, failure reasons and
//! the error taxonomy.

pub mod identifiers;
pub mod coordination;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use coordination::*;
pub use error::*;
pub use time::*;
