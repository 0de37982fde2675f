//! Replay divergence checks.
//!
//! Before a suspended run's new log is persisted, the agent compares it with
//! the log the replay started from. A mismatch means the workflow body no
//! longer makes the same decisions in the same order.

use crate::error::DeterminismError;
use crate::operation::{OperationEvent, Run};

/// Compares the log a replay started from with the log it produced.
pub trait DeterminismCheck: Send + Sync {
    /// # Errors
    ///
    /// Returns an error describing the first diverging decision.
    fn compare(&self, old: &Run, new: &Run) -> Result<(), DeterminismError>;
}

impl<F> DeterminismCheck for F
where
    F: Fn(&Run, &Run) -> Result<(), DeterminismError> + Send + Sync,
{
    fn compare(&self, old: &Run, new: &Run) -> Result<(), DeterminismError> {
        self(old, new)
    }
}

/// Requires the Save and Sleep decisions of both logs to agree, kind and id,
/// over their common prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionPrefix;

fn decisions(run: &Run) -> Vec<(&'static str, u32)> {
    run.operations
        .iter()
        .filter_map(|op| match op.event {
            OperationEvent::Save { id, .. } => Some(("Save", id)),
            OperationEvent::Sleep { id, .. } => Some(("Sleep", id)),
            _ => None,
        })
        .collect()
}

impl DeterminismCheck for DecisionPrefix {
    fn compare(&self, old: &Run, new: &Run) -> Result<(), DeterminismError> {
        let recorded = decisions(old);
        let replayed = decisions(new);
        match recorded
            .iter()
            .zip(&replayed)
            .position(|(was, now)| was != now)
        {
            Some(position) => Err(DeterminismError {
                run_id: new.run_id.clone(),
                position,
                expected: format!("{}#{}", recorded[position].0, recorded[position].1),
                found: format!("{}#{}", replayed[position].0, replayed[position].1),
            }),
            None => Ok(()),
        }
    }
}
