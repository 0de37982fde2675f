//! Pool errors.

use driftwood_core::WorkerId;
use std::fmt;

/// Errors from borrowing, creating or talking to pooled workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The factory could not create a worker.
    Create { pool: String, message: String },
    /// A borrower waited longer than the configured wait timeout.
    WaitTimeout { pool: String, timeout_ms: u64 },
    /// The pool is shutting down and no longer lends workers.
    ShutDown { pool: String },
    /// A message could not be delivered to a worker.
    Send { worker_id: WorkerId, message: String },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create { pool, message } => {
                write!(f, "pool '{pool}' failed to create a worker: {message}")
            }
            Self::WaitTimeout { pool, timeout_ms } => write!(
                f,
                "timed out after {timeout_ms}ms waiting for a worker from pool '{pool}'"
            ),
            Self::ShutDown { pool } => write!(f, "pool '{pool}' is shut down"),
            Self::Send { worker_id, message } => {
                write!(f, "failed to send to worker {worker_id}: {message}")
            }
        }
    }
}

impl std::error::Error for PoolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display_names_pool() {
        let err = PoolError::WaitTimeout {
            pool: "workflows".to_string(),
            timeout_ms: 250,
        };
        assert_eq!(
            err.to_string(),
            "timed out after 250ms waiting for a worker from pool 'workflows'"
        );
    }
}
