//! Error types for the store and the agent.

use driftwood_core::RunId;
use driftwood_pool::PoolError;
use driftwood_workflow::JournalError;
use std::fmt;

/// Errors from store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Failed to reach the backing store.
    Connection { details: String },
    /// Failed to read a record.
    Read { details: String },
    /// Failed to write a record.
    Write { details: String },
    /// A stored record could not be decoded.
    Corrupt { key: String, details: String },
    /// The schedule entry does not exist or was already closed.
    ScheduleClosed { run_id: RunId },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection { details } => write!(f, "store connection failed: {details}"),
            Self::Read { details } => write!(f, "store read failed: {details}"),
            Self::Write { details } => write!(f, "store write failed: {details}"),
            Self::Corrupt { key, details } => write!(f, "stored record {key} is corrupt: {details}"),
            Self::ScheduleClosed { run_id } => write!(f, "no open schedule for run {run_id}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors surfaced by the agent, the worker manager and the query facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// Store error.
    Store(StoreError),
    /// Worker pool error.
    Pool(PoolError),
    /// The run log violates the Start/Stop balance.
    Journal(JournalError),
    /// No workflow of this name is registered.
    UnknownWorkflow { name: String },
    /// A run id could not be made from the workflow name.
    InvalidWorkflowName { name: String, reason: String },
    /// A value handed to a run could not be encoded as JSON.
    InvalidPayload { details: String },
    /// The run does not exist.
    RunNotFound { run_id: RunId },
    /// The run has no worker assigned by this process.
    NotRunning { run_id: RunId },
    /// A message could not be delivered to the run's worker.
    WorkerGone { run_id: RunId, details: String },
    /// Configuration could not be loaded.
    Config { details: String },
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Pool(e) => write!(f, "pool error: {e}"),
            Self::Journal(e) => write!(f, "journal error: {e}"),
            Self::UnknownWorkflow { name } => write!(f, "unknown workflow: {name}"),
            Self::InvalidWorkflowName { name, reason } => {
                write!(f, "invalid workflow name '{name}': {reason}")
            }
            Self::InvalidPayload { details } => write!(f, "invalid payload: {details}"),
            Self::RunNotFound { run_id } => write!(f, "run not found: {run_id}"),
            Self::NotRunning { run_id } => write!(f, "run {run_id} has no worker in this process"),
            Self::WorkerGone { run_id, details } => {
                write!(f, "worker for run {run_id} is gone: {details}")
            }
            Self::Config { details } => write!(f, "configuration error: {details}"),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<StoreError> for AgentError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<PoolError> for AgentError {
    fn from(e: PoolError) -> Self {
        Self::Pool(e)
    }
}

impl From<JournalError> for AgentError {
    fn from(e: JournalError) -> Self {
        Self::Journal(e)
    }
}
