//! Suspension signals and replay outcomes.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Why a replay stopped early.
///
/// Interrupts are never persisted; they tell the agent to save the new tail
/// and try the run again later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Interrupt {
    /// A durable sleep has not elapsed.
    Sleep,
    /// A saved step failed and is waiting for its retry window.
    SaveRetry,
    /// `receive` found no pending event.
    WaitReceiveEvent,
    /// `handle` found no pending event.
    WaitHandleEvent,
    /// An `ensure` condition evaluated to false.
    WaitEnsureValue,
}

impl Interrupt {
    /// Wire name of the interrupt.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sleep => "SLEEP",
            Self::SaveRetry => "SAVE_RETRY",
            Self::WaitReceiveEvent => "WAIT_RECEIVE_EVENT",
            Self::WaitHandleEvent => "WAIT_HANDLE_EVENT",
            Self::WaitEnsureValue => "WAIT_ENSURE_VALUE",
        }
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one replay of a workflow body ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The body returned a value.
    Completed(JsonValue),
    /// The body failed; the run ends with `Stop{Err}`.
    Failed(String),
    /// The body suspended; the run is retried later.
    Suspended(Interrupt),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_wire_names() {
        let json = serde_json::to_string(&Interrupt::WaitReceiveEvent).unwrap();
        assert_eq!(json, "\"WAIT_RECEIVE_EVENT\"");
        assert_eq!(Interrupt::SaveRetry.to_string(), "SAVE_RETRY");
    }
}
