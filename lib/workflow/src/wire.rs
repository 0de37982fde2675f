//! Messages exchanged between a worker and the process that owns it.

use crate::interrupt::Interrupt;
use crate::operation::Run;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Host bookkeeping passed through to the worker untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Internal {
    pub agent_id: String,
    pub queue: String,
}

/// Messages sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToWorker {
    /// Replay `module_path::function_name` against `run`.
    Start {
        module_path: String,
        function_name: String,
        run: Run,
        schedule: DateTime<Utc>,
        internal: Internal,
    },
    /// Answer to a worker's hostcall; exactly one of `result`/`error` is set.
    HostcallResp {
        id: u64,
        result: Option<JsonValue>,
        error: Option<String>,
    },
}

/// Messages sent by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FromWorker {
    /// The body returned a value.
    Success {
        result: JsonValue,
        run: Run,
        schedule: DateTime<Utc>,
    },
    /// The body suspended.
    Interrupt {
        interrupt: Interrupt,
        run: Run,
        schedule: DateTime<Utc>,
    },
    /// The body failed. `exception` names the kind of failure when it was
    /// not an ordinary error return.
    Fail {
        error: String,
        exception: Option<String>,
        run: Run,
        schedule: DateTime<Utc>,
    },
    /// The worker itself failed and did not run the body.
    Error { error: String },
    /// The body needs the host to perform `op_name`.
    Hostcall {
        id: u64,
        op_name: String,
        json: JsonValue,
    },
}

impl FromWorker {
    /// Returns true for the messages that end a replay.
    #[must_use]
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Hostcall { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_screaming_snake_case() {
        let msg = ToWorker::HostcallResp {
            id: 3,
            result: None,
            error: Some("nope".to_string()),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "HOSTCALL_RESP");

        let msg = FromWorker::Error {
            error: "boom".to_string(),
        };
        assert_eq!(serde_json::to_value(&msg).unwrap()["type"], "ERROR");
    }

    #[test]
    fn hostcall_is_not_final() {
        let call = FromWorker::Hostcall {
            id: 1,
            op_name: "send_event".to_string(),
            json: JsonValue::Null,
        };
        assert!(!call.is_final());
        assert!(
            FromWorker::Error {
                error: String::new()
            }
            .is_final()
        );
    }
}
