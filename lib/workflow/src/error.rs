//! Error types for the workflow crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `JournalError`: Structural corruption of a run log
//! - `WorkflowError`: What a workflow body returns (interrupt or failure)
//! - `HostcallError`: Failures of calls proxied from a worker to its host
//! - `DeterminismError`: A replay diverged from the recorded history
//! - `RetryError`: Invalid retry/backoff configuration
//! - `RegistryError`: Conflicting workflow registrations

use crate::interrupt::Interrupt;
use driftwood_core::RunId;
use std::fmt;

/// Structural errors in a run log.
///
/// These are fatal for the affected run only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalError {
    /// The Start/Stop running balance left the range `0..=1`.
    Unbalanced {
        run_id: RunId,
        index: usize,
        counter: i64,
    },
    /// The first operation of the run is not a Start.
    MissingStart { run_id: RunId },
}

impl fmt::Display for JournalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbalanced {
                run_id,
                index,
                counter,
            } => write!(
                f,
                "run {run_id} has unbalanced Start/Stop operations at index {index} (balance {counter})"
            ),
            Self::MissingStart { run_id } => {
                write!(f, "run {run_id} does not begin with a Start operation")
            }
        }
    }
}

impl std::error::Error for JournalError {}

/// Result of a workflow body that did not complete.
///
/// `Interrupted` is control flow: the run is persisted and replayed later.
/// `Failed` ends the run with `Stop{Err}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// The body suspended at a durable primitive.
    Interrupted(Interrupt),
    /// The body failed.
    Failed { message: String },
}

impl WorkflowError {
    /// Builds a failure from any message.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Returns the interrupt if this is control flow.
    #[must_use]
    pub fn interrupt(&self) -> Option<Interrupt> {
        match self {
            Self::Interrupted(interrupt) => Some(*interrupt),
            Self::Failed { .. } => None,
        }
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted(interrupt) => write!(f, "interrupted: {interrupt}"),
            Self::Failed { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for WorkflowError {}

impl From<Interrupt> for WorkflowError {
    fn from(interrupt: Interrupt) -> Self {
        Self::Interrupted(interrupt)
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(e: serde_json::Error) -> Self {
        Self::failed(e.to_string())
    }
}

impl From<HostcallError> for WorkflowError {
    fn from(e: HostcallError) -> Self {
        Self::failed(e.to_string())
    }
}

/// Errors from calls a worker proxies to its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostcallError {
    /// The host does not implement the operation.
    Unsupported { op_name: String },
    /// The host executed the operation and it failed.
    Rejected { op_name: String, message: String },
    /// The channel to the host closed before a response arrived.
    Disconnected,
}

impl fmt::Display for HostcallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported { op_name } => write!(f, "hostcall '{op_name}' is not supported"),
            Self::Rejected { op_name, message } => {
                write!(f, "hostcall '{op_name}' failed: {message}")
            }
            Self::Disconnected => write!(f, "host disconnected before responding"),
        }
    }
}

impl std::error::Error for HostcallError {}

/// A replay produced a different decision than the recorded history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterminismError {
    /// The run that diverged.
    pub run_id: RunId,
    /// Position in the decision sequence where the logs disagree.
    pub position: usize,
    /// The recorded decision.
    pub expected: String,
    /// The decision made by this replay.
    pub found: String,
}

impl fmt::Display for DeterminismError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "non-deterministic replay of run {}: decision #{} was {} but replay produced {}",
            self.run_id, self.position, self.expected, self.found
        )
    }
}

impl std::error::Error for DeterminismError {}

/// Invalid retry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// `max_retries` must be at least one.
    NoRetries,
    /// The maximum backoff is smaller than the initial backoff.
    InvertedBounds { initial_ms: u64, max_ms: u64 },
}

impl fmt::Display for RetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRetries => write!(f, "retry config must allow at least one retry"),
            Self::InvertedBounds { initial_ms, max_ms } => write!(
                f,
                "max backoff {max_ms}ms is smaller than initial backoff {initial_ms}ms"
            ),
        }
    }
}

impl std::error::Error for RetryError {}

/// A workflow name is already taken by a body at another location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryError {
    pub name: String,
    pub existing: String,
    pub rejected: String,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "workflow {} is already registered as {}, cannot register {}",
            self.name, self.existing, self.rejected
        )
    }
}

impl std::error::Error for RegistryError {}
