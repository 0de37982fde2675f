//! The run journal.
//!
//! A run is an append-only log of timestamped operations and is the only
//! source of truth for a workflow's progress. Replaying a workflow body
//! against this log reproduces every decision it has already made.

use crate::error::JournalError;
use chrono::{DateTime, Utc};
use driftwood_core::RunId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// One timestamped entry of a run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// When the operation was recorded.
    pub at: DateTime<Utc>,
    /// What happened.
    pub event: OperationEvent,
}

impl Operation {
    /// Creates an operation recorded at `at`.
    #[must_use]
    pub fn new(at: DateTime<Utc>, event: OperationEvent) -> Self {
        Self { at, event }
    }
}

/// The events a run log can contain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OperationEvent {
    /// The run started with the given arguments.
    Start { kwargs: JsonValue },
    /// A durable sleep from `start` until `end`.
    Sleep {
        id: u32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// The recorded result of a saved step.
    Save { id: u32, value: SavedValue },
    /// An event delivered to the run from outside.
    Send { event_name: String, value: JsonValue },
    /// A log line emitted by the workflow body.
    Log {
        id: u32,
        level: LogLevel,
        payload: JsonValue,
    },
    /// The run finished.
    Stop { result: StopResult },
}

impl OperationEvent {
    /// Short name of the variant, for logs and diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "Start",
            Self::Sleep { .. } => "Sleep",
            Self::Save { .. } => "Save",
            Self::Send { .. } => "Send",
            Self::Log { .. } => "Log",
            Self::Stop { .. } => "Stop",
        }
    }
}

/// State of a saved step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SavedValue {
    /// The step succeeded; replays return `payload` without re-running it.
    Resolved { payload: JsonValue },
    /// The step failed and may run again once `wait_until` has passed.
    Retry {
        wait_until: DateTime<Utc>,
        counter: u32,
    },
    /// The step exhausted its retries.
    Failed { message: String, retries: u32 },
}

/// Final result recorded by a Stop operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum StopResult {
    Ok(JsonValue),
    Err(JsonValue),
}

impl StopResult {
    /// Returns true for a successful completion.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// The recorded value, whichever the outcome.
    #[must_use]
    pub fn value(&self) -> &JsonValue {
        match self {
            Self::Ok(value) | Self::Err(value) => value,
        }
    }
}

/// Severity of a workflow log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

/// The complete history of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// The run ID.
    pub run_id: RunId,
    /// Operations in the order they were recorded.
    pub operations: Vec<Operation>,
}

impl Run {
    /// Creates an empty run.
    #[must_use]
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            operations: Vec::new(),
        }
    }

    /// Appends an operation.
    pub fn push(&mut self, at: DateTime<Utc>, event: OperationEvent) {
        self.operations.push(Operation::new(at, event));
    }

    /// Walks the Start/Stop balance and reports whether the run has stopped.
    ///
    /// The balance increments on Start and decrements on Stop; it must stay
    /// within `0..=1` at every step. A run has stopped when at least one Stop
    /// was seen and the final balance is zero.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Unbalanced`] if the counter leaves its range,
    /// which means the log is corrupted.
    pub fn is_stopped(&self) -> Result<bool, JournalError> {
        let mut counter: i64 = 0;
        let mut saw_stop = false;
        for (index, op) in self.operations.iter().enumerate() {
            match op.event {
                OperationEvent::Start { .. } => counter += 1,
                OperationEvent::Stop { .. } => {
                    counter -= 1;
                    saw_stop = true;
                }
                _ => continue,
            }
            if !(0..=1).contains(&counter) {
                return Err(JournalError::Unbalanced {
                    run_id: self.run_id.clone(),
                    index,
                    counter,
                });
            }
        }
        Ok(saw_stop && counter == 0)
    }

    /// Returns the arguments of the leading Start operation.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::MissingStart`] if the first operation is
    /// anything else, or the run is empty.
    pub fn start_kwargs(&self) -> Result<&JsonValue, JournalError> {
        match self.operations.first().map(|op| &op.event) {
            Some(OperationEvent::Start { kwargs }) => Ok(kwargs),
            _ => Err(JournalError::MissingStart {
                run_id: self.run_id.clone(),
            }),
        }
    }

    /// When the run started, if it has.
    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.operations
            .iter()
            .find(|op| matches!(op.event, OperationEvent::Start { .. }))
            .map(|op| op.at)
    }

    /// The most recent Stop operation's result and timestamp.
    #[must_use]
    pub fn last_stop(&self) -> Option<(&StopResult, DateTime<Utc>)> {
        self.operations.iter().rev().find_map(|op| match &op.event {
            OperationEvent::Stop { result } => Some((result, op.at)),
            _ => None,
        })
    }

    /// Seeds the log a replay rebuilds.
    ///
    /// A stopped run is cloned whole. Otherwise only the leading Start is
    /// kept; the replay re-appends everything else as it reaches it.
    #[must_use]
    pub fn replay_seed(&self) -> Run {
        if matches!(self.is_stopped(), Ok(true)) {
            return self.clone();
        }
        let operations = match self.operations.first() {
            Some(op) if matches!(op.event, OperationEvent::Start { .. }) => vec![op.clone()],
            _ => Vec::new(),
        };
        Run {
            run_id: self.run_id.clone(),
            operations,
        }
    }

    /// Number of operations of the given kind, for diagnostics and tests.
    #[must_use]
    pub fn count(&self, kind: &str) -> usize {
        self.operations
            .iter()
            .filter(|op| op.event.kind() == kind)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run_with(events: Vec<OperationEvent>) -> Run {
        let mut run = Run::new(RunId::generate("journal").unwrap());
        for event in events {
            run.push(Utc::now(), event);
        }
        run
    }

    fn start() -> OperationEvent {
        OperationEvent::Start { kwargs: json!({}) }
    }

    fn stop() -> OperationEvent {
        OperationEvent::Stop {
            result: StopResult::Ok(json!(null)),
        }
    }

    #[test]
    fn fresh_run_is_not_stopped() {
        assert!(!run_with(vec![]).is_stopped().unwrap());
        assert!(!run_with(vec![start()]).is_stopped().unwrap());
    }

    #[test]
    fn start_then_stop_is_stopped() {
        let run = run_with(vec![start(), stop()]);
        assert!(run.is_stopped().unwrap());
    }

    #[test]
    fn double_start_is_corruption() {
        let err = run_with(vec![start(), start()]).is_stopped().unwrap_err();
        assert!(matches!(
            err,
            JournalError::Unbalanced {
                index: 1,
                counter: 2,
                ..
            }
        ));
    }

    #[test]
    fn lone_stop_is_corruption() {
        let err = run_with(vec![stop()]).is_stopped().unwrap_err();
        assert!(matches!(
            err,
            JournalError::Unbalanced {
                index: 0,
                counter: -1,
                ..
            }
        ));
    }

    #[test]
    fn start_kwargs_requires_leading_start() {
        let run = run_with(vec![
            OperationEvent::Start {
                kwargs: json!({"a": 2}),
            },
            stop(),
        ]);
        assert_eq!(run.start_kwargs().unwrap(), &json!({"a": 2}));

        let bad = run_with(vec![OperationEvent::Send {
            event_name: "ping".to_string(),
            value: json!(1),
        }]);
        assert!(matches!(
            bad.start_kwargs(),
            Err(JournalError::MissingStart { .. })
        ));
    }

    #[test]
    fn replay_seed_truncates_running_runs() {
        let run = run_with(vec![
            start(),
            OperationEvent::Save {
                id: 1,
                value: SavedValue::Resolved { payload: json!(3) },
            },
        ]);
        let seed = run.replay_seed();
        assert_eq!(seed.operations.len(), 1);
        assert_eq!(seed.operations[0], run.operations[0]);
    }

    #[test]
    fn replay_seed_keeps_stopped_runs() {
        let run = run_with(vec![start(), stop()]);
        assert_eq!(run.replay_seed(), run);
    }

    #[test]
    fn last_stop_reports_result() {
        let run = run_with(vec![
            start(),
            OperationEvent::Stop {
                result: StopResult::Err(json!("boom")),
            },
        ]);
        let (result, _) = run.last_stop().unwrap();
        assert!(!result.is_ok());
        assert_eq!(result.value(), &json!("boom"));
    }

    #[test]
    fn operation_json_shape() {
        let op = Operation::new(
            Utc::now(),
            OperationEvent::Save {
                id: 4,
                value: SavedValue::Retry {
                    wait_until: Utc::now(),
                    counter: 1,
                },
            },
        );
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["event"]["type"], "Save");
        assert_eq!(json["event"]["value"]["type"], "Retry");
        assert_eq!(json["event"]["value"]["counter"], 1);
    }
}
