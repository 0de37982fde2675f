//! Versioned envelope for persisted records.
//!
//! Runs and schedule entries written to a durable store are wrapped so that
//! agents of different builds can share one store during a rolling upgrade.
//! A record written by a newer build is refused instead of half-read.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Envelope version written by this build.
pub const CURRENT_VERSION: u32 = 1;

/// Errors opening a sealed record.
#[derive(Debug)]
pub enum EnvelopeError {
    /// The bytes are not a valid envelope or the payload has the wrong shape.
    Malformed(serde_json::Error),
    /// The record was written by a newer build.
    UnsupportedVersion { found: u32, supported: u32 },
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed envelope: {e}"),
            Self::UnsupportedVersion { found, supported } => write!(
                f,
                "envelope version {found} is newer than supported version {supported}"
            ),
        }
    }
}

impl std::error::Error for EnvelopeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Malformed(e) => Some(e),
            Self::UnsupportedVersion { .. } => None,
        }
    }
}

impl From<serde_json::Error> for EnvelopeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e)
    }
}

/// A versioned wrapper around a persisted payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Format version of the payload.
    pub version: u32,
    /// The wrapped payload.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Wraps a payload at the current version.
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            payload,
        }
    }

    /// Unwraps the envelope, returning the payload.
    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }
}

/// Envelope header read before the payload is decoded.
#[derive(Deserialize)]
struct Header {
    version: u32,
    payload: serde_json::Value,
}

/// Serializes `payload` inside an envelope.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized.
pub fn seal<T: Serialize>(payload: &T) -> Result<Vec<u8>, EnvelopeError> {
    Ok(serde_json::to_vec(&Envelope::new(payload))?)
}

/// Decodes a sealed record.
///
/// The version is checked before the payload is interpreted.
///
/// # Errors
///
/// Returns [`EnvelopeError::UnsupportedVersion`] for records from a newer
/// build, and [`EnvelopeError::Malformed`] if the bytes do not decode.
pub fn open<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EnvelopeError> {
    let header: Header = serde_json::from_slice(bytes)?;
    if header.version > CURRENT_VERSION {
        return Err(EnvelopeError::UnsupportedVersion {
            found: header.version,
            supported: CURRENT_VERSION,
        });
    }
    Ok(serde_json::from_value(header.payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Entry {
        queue: String,
        attempt: u32,
    }

    #[test]
    fn sealed_record_carries_version() {
        let bytes = seal(&Entry {
            queue: "default".to_string(),
            attempt: 2,
        })
        .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["version"], CURRENT_VERSION);
        assert_eq!(json["payload"]["attempt"], 2);

        let entry: Entry = open(&bytes).unwrap();
        assert_eq!(entry.queue, "default");
    }

    #[test]
    fn newer_version_is_rejected() {
        let bytes = serde_json::to_vec(&json!({
            "version": CURRENT_VERSION + 1,
            "payload": {"queue": "default", "attempt": 1}
        }))
        .unwrap();
        let err = open::<Entry>(&bytes).unwrap_err();
        assert!(matches!(
            err,
            EnvelopeError::UnsupportedVersion { found, .. } if found == CURRENT_VERSION + 1
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        let err = open::<Entry>(b"not json").unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }
}
