//! Core types shared by every driftwood crate.
//!
//! This crate provides the strongly-typed identifiers, the clock abstraction
//! used for every time-dependent decision (replay, leases, schedules), and the
//! rootcause-based `Result` alias.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::Result;
pub use id::{AgentId, ParseIdError, RunId, WorkerId};
