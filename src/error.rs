//! Error classification shared across every component (spec §7).
//!
//! Internals propagate `anyhow::Error` with `?`; the public operations
//! (`backup`, `restore`, `migrate`, `gc`, ...) convert to [`BackupError`] at
//! their boundary so callers can match on [`ErrorKind`] instead of parsing
//! message strings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse failure classification, used to decide retry vs. abort policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Store timeout, throttling, 5xx. Retried by the adapter before this
    /// is ever surfaced; surfacing it means retries were exhausted.
    Transient,
    /// Auth failure, missing bucket, invalid manifest, version mismatch.
    /// Never retried.
    Fatal,
    /// Disk full, out of memory. Never retried automatically.
    Resource,
    /// Checksum mismatch or malformed tuple.
    Data,
    /// A concurrent backup/migration holds the lock.
    Conflict,
    /// Tx log discontinuity detected on migration resume.
    CaptureGap,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Resource => "resource",
            ErrorKind::Data => "data",
            ErrorKind::Conflict => "conflict",
            ErrorKind::CaptureGap => "capture_gap",
        };
        f.write_str(s)
    }
}

/// A classified, structured error returned by every public operation.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct BackupError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

impl BackupError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), context: serde_json::Value::Null }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Data, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn capture_gap(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CaptureGap, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// Convert an opaque `anyhow::Error` that escaped classification into a
    /// `fatal` `BackupError`, preserving the full causal chain in the
    /// message (programmer errors, not covered by a closer `ErrorKind`).
    pub fn from_anyhow(kind: ErrorKind, err: anyhow::Error) -> Self {
        Self::new(kind, format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_display() {
        assert_eq!(ErrorKind::Transient.to_string(), "transient");
        assert_eq!(ErrorKind::CaptureGap.to_string(), "capture_gap");
    }

    #[test]
    fn error_serializes_with_kind_and_context() {
        let err = BackupError::data("bad checksum").with_context(serde_json::json!({"chunk_id": 3}));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "data");
        assert_eq!(value["context"]["chunk_id"], 3);
    }
}
