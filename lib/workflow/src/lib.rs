//! Durable workflow replay for driftwood.
//!
//! This crate provides the pieces that run inside a worker:
//!
//! - **Journal**: the append-only run log and its Start/Stop balance check
//! - **Context**: deterministic replay of save, sleep, receive, handle,
//!   ensure and log against that log
//! - **Interrupts**: suspension returned as data rather than unwound
//! - **Wire protocol**: START/HOSTCALL messages between a worker and its host
//! - **Executor**: the worker loop every transport runs

pub mod child;
pub mod context;
pub mod determinism;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod interrupt;
pub mod operation;
pub mod registry;
pub mod retry;
pub mod wire;

pub use child::{ChildStatus, ChildWorkflowHandle, Host, NoHost};
pub use context::{Context, ContextBuilder, SaveOptions};
pub use determinism::{DecisionPrefix, DeterminismCheck};
pub use envelope::{Envelope, EnvelopeError};
pub use error::{
    DeterminismError, HostcallError, JournalError, RegistryError, RetryError, WorkflowError,
};
pub use executor::{ChannelHost, StartRequest, execute_start, serve_worker};
pub use interrupt::{Interrupt, Outcome};
pub use operation::{LogLevel, Operation, OperationEvent, Run, SavedValue, StopResult};
pub use registry::{WorkflowDescriptor, WorkflowFn, WorkflowRegistry};
pub use retry::{BackoffPolicy, BackoffStrategy, RetryConfig, StrategyBackoff, strategy_retry};
pub use wire::{FromWorker, Internal, ToWorker};
