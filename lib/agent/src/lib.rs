//! Durable execution for driftwood.
//!
//! This crate owns everything outside the worker:
//!
//! - **Store**: run logs, schedules, leases, links and diagnostic logs,
//!   in memory or in NATS JetStream key-value buckets
//! - **Workers**: thread, inline and remote transports behind one pool
//! - **Manager**: which worker replays which run, and hostcall routing
//! - **Agent**: the poll, lease and dispatch loop
//! - **Workflows**: the facade for starting, signalling, stopping and
//!   inspecting runs

pub mod agent;
pub mod config;
pub mod error;
pub mod host;
pub mod manager;
pub mod service;
pub mod store;
pub mod worker;

pub use agent::{Agent, AgentBuilder, TickOutcome};
pub use config::AgentConfig;
pub use error::{AgentError, StoreError};
pub use host::AgentHost;
pub use manager::{ActiveRun, HostcallHandler, WorkflowWorkerManager};
pub use service::{CompletedRun, CompletionStatus, STOPPED_MESSAGE, WorkflowResults, Workflows};
pub use store::{
    LeaseRecord, LogEntry, MemoryStore, NatsStore, NatsStoreConfig, NextRun, Store,
};
pub use worker::{
    InlineWorker, POOL_NAME, RemoteWorker, ThreadWorker, TransportKind, WorkflowPool,
    WorkflowWorker, WorkflowWorkerFactory, serve_remote_host,
};
