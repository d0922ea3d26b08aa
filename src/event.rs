//! Build event schema and wire codec.
//!
//! A [`BuildEvent`] is the unit of record: one build/deploy lifecycle signal
//! emitted by a CI pipeline. The wire encoding is deterministic — identical
//! logical events always produce identical bytes — because both idempotency
//! keys and on-chain storage are derived from it.

use serde::{Deserialize, Serialize};

/// Build lifecycle status reported by the CI pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildStatus {
    Started,
    Success,
    Failure,
    Aborted,
}

impl BuildStatus {
    /// All statuses accepted on the wire.
    pub const ALL: [BuildStatus; 4] = [
        BuildStatus::Started,
        BuildStatus::Success,
        BuildStatus::Failure,
        BuildStatus::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Started => "Started",
            BuildStatus::Success => "Success",
            BuildStatus::Failure => "Failure",
            BuildStatus::Aborted => "Aborted",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Started" => Ok(BuildStatus::Started),
            "Success" => Ok(BuildStatus::Success),
            "Failure" => Ok(BuildStatus::Failure),
            "Aborted" => Ok(BuildStatus::Aborted),
            other => Err(CodecError::MalformedEvent(format!(
                "unknown build status '{}'",
                other
            ))),
        }
    }
}

/// A single build/deploy event.
///
/// `ledger_timestamp` and `sequence` are unset until the reconciler observes
/// the event on-chain; the writer's own acknowledgement is a hint, never a
/// confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEvent {
    /// Caller-assigned build identifier. Opaque; not guaranteed unique.
    pub build_id: String,
    /// Build lifecycle status.
    pub status: BuildStatus,
    /// Identity of the developer who triggered the build.
    pub developer: String,
    /// Client-side submission timestamp (Unix seconds). Advisory only.
    pub submitted_at: i64,
    /// Ledger-assigned timestamp, set once confirmed. Authoritative.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ledger_timestamp: Option<i64>,
    /// Ledger-assigned position, set once confirmed.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sequence: Option<u64>,
}

impl BuildEvent {
    /// Create a new unconfirmed event with the current wall-clock time.
    pub fn new(build_id: impl Into<String>, status: BuildStatus, developer: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            status,
            developer: developer.into(),
            submitted_at: chrono::Utc::now().timestamp(),
            ledger_timestamp: None,
            sequence: None,
        }
    }

    /// Validate the caller-supplied fields. Used by both the producer API
    /// and the decoder so the two reject the same inputs.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.build_id.is_empty() {
            return Err(CodecError::MalformedEvent("empty build_id".to_string()));
        }
        if self.developer.is_empty() {
            return Err(CodecError::MalformedEvent("empty developer".to_string()));
        }
        Ok(())
    }

    /// True when this event and `other` describe the same logical submission.
    ///
    /// Confirmation fields are excluded — a confirmed copy observed on-chain
    /// still matches the unconfirmed record the writer holds.
    pub fn same_logical(&self, other: &BuildEvent) -> bool {
        self.build_id == other.build_id
            && self.status == other.status
            && self.developer == other.developer
            && self.submitted_at == other.submitted_at
    }
}

/// Wire representation. The field order of this struct *is* the wire format:
/// serde_json serializes struct fields in declaration order, which makes the
/// encoding deterministic. Do not reorder fields.
#[derive(Serialize, Deserialize)]
struct WireEvent {
    build_id: String,
    status: String,
    developer: String,
    submitted_at: i64,
}

/// Codec failures. Always a typed error, never a panic.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("malformed event: {0}")]
    MalformedEvent(String),
}

/// Encode an event into its canonical wire bytes.
///
/// Only the logical fields are encoded; ledger-assigned fields live outside
/// the payload (the ledger supplies them per entry), so the encoding of a
/// logical event is stable across its whole lifecycle.
pub fn encode(event: &BuildEvent) -> Vec<u8> {
    let wire = WireEvent {
        build_id: event.build_id.clone(),
        status: event.status.to_string(),
        developer: event.developer.clone(),
        submitted_at: event.submitted_at,
    };
    // Serializing a fixed struct cannot fail.
    serde_json::to_vec(&wire).unwrap_or_default()
}

/// Decode wire bytes back into an event.
///
/// Rejects schema-violating input (wrong shape, unknown status, empty
/// identity fields) with [`CodecError::MalformedEvent`].
pub fn decode(bytes: &[u8]) -> Result<BuildEvent, CodecError> {
    let wire: WireEvent = serde_json::from_slice(bytes)
        .map_err(|e| CodecError::MalformedEvent(format!("invalid wire payload: {}", e)))?;
    let status: BuildStatus = wire.status.parse()?;
    let event = BuildEvent {
        build_id: wire.build_id,
        status,
        developer: wire.developer,
        submitted_at: wire.submitted_at,
        ledger_timestamp: None,
        sequence: None,
    };
    event.validate()?;
    Ok(event)
}
