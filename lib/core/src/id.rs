//! Strongly-typed identifiers.
//!
//! Process-scoped identities (agents, workers) are plain ULIDs with a display
//! prefix. Run identifiers additionally carry the name of the workflow they
//! execute, so an agent can route a due run without loading its log first.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Error returned when parsing an ID from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Macro to generate a strongly-typed ID wrapper around ULID.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Creates a new ID with a randomly generated ULID.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let ulid_str = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ulid::from_str(ulid_str)
                    .map(Self)
                    .map_err(|e| ParseIdError {
                        id_type: stringify!($name),
                        reason: e.to_string(),
                    })
            }
        }
    };
}

define_id!(
    /// Identity of one agent process taking part in lease arbitration.
    AgentId,
    "agent"
);

define_id!(
    /// Identity of one pooled execution unit.
    WorkerId,
    "wkr"
);

/// Identifier of one workflow run.
///
/// Formatted as `<workflow name>_<ulid>`. Workflow names are restricted to
/// ASCII alphanumerics, `-` and `_`, which keeps run ids usable as key-value
/// store keys and message subjects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId {
    workflow: String,
    ulid: Ulid,
}

impl RunId {
    /// Generates a fresh run id for the given workflow.
    ///
    /// # Errors
    ///
    /// Returns an error if the workflow name is empty or contains characters
    /// outside `[A-Za-z0-9_-]`.
    pub fn generate(workflow: &str) -> Result<Self, ParseIdError> {
        validate_workflow_name(workflow)?;
        Ok(Self {
            workflow: workflow.to_string(),
            ulid: Ulid::new(),
        })
    }

    /// Name of the workflow this run executes.
    #[must_use]
    pub fn workflow_name(&self) -> &str {
        &self.workflow
    }

    /// Returns the unique part of the id.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

fn validate_workflow_name(name: &str) -> Result<(), ParseIdError> {
    if name.is_empty() {
        return Err(ParseIdError {
            id_type: "RunId",
            reason: "workflow name is empty".to_string(),
        });
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(ParseIdError {
            id_type: "RunId",
            reason: format!("invalid character {c:?} in workflow name {name:?}"),
        });
    }
    Ok(())
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.workflow, self.ulid)
    }
}

impl FromStr for RunId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (workflow, ulid) = s.rsplit_once('_').ok_or_else(|| ParseIdError {
            id_type: "RunId",
            reason: format!("missing workflow prefix in {s:?}"),
        })?;
        validate_workflow_name(workflow)?;
        let ulid = Ulid::from_str(ulid).map_err(|e| ParseIdError {
            id_type: "RunId",
            reason: e.to_string(),
        })?;
        Ok(Self {
            workflow: workflow.to_string(),
            ulid,
        })
    }
}

impl TryFrom<String> for RunId {
    type Error = ParseIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_display_format() {
        let id = WorkerId::new();
        assert!(id.to_string().starts_with("wkr_"));
    }

    #[test]
    fn agent_id_parse_with_and_without_prefix() {
        let id = AgentId::new();
        let parsed: AgentId = id.to_string().parse().expect("should parse");
        assert_eq!(id, parsed);

        let raw: AgentId = id.as_ulid().to_string().parse().expect("should parse");
        assert_eq!(id, raw);
    }

    #[test]
    fn run_id_carries_workflow_name() {
        let id = RunId::generate("order_fulfilment").expect("valid name");
        assert_eq!(id.workflow_name(), "order_fulfilment");

        let parsed: RunId = id.to_string().parse().expect("should parse");
        assert_eq!(parsed, id);
        assert_eq!(parsed.workflow_name(), "order_fulfilment");
    }

    #[test]
    fn run_id_rejects_bad_names() {
        assert!(RunId::generate("").is_err());
        assert!(RunId::generate("has space").is_err());
        assert!(RunId::generate("dotted.name").is_err());
    }

    #[test]
    fn run_id_parse_invalid() {
        let err = "no-separator".parse::<RunId>().unwrap_err();
        assert_eq!(err.id_type, "RunId");
        assert!("add_notaulid".parse::<RunId>().is_err());
    }

    #[test]
    fn run_id_serializes_as_string() {
        let id = RunId::generate("add").expect("valid name");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{id}\""));
        let parsed: RunId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, id);
    }
}
