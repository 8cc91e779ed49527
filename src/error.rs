// ABOUTME: Custom error types for the migration orchestrator
// ABOUTME: Run-level error variants plus the tagged per-unit error used for retry decisions

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug)]
pub enum MigratorError {
    Connection(String),
    Validation(String),
    Migration(String),
    Integrity(String),
    Protected(String),
    Locked(String),
}

impl fmt::Display for MigratorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MigratorError::Connection(msg) => write!(f, "Connection error: {}", msg),
            MigratorError::Validation(msg) => write!(f, "Validation error: {}", msg),
            MigratorError::Migration(msg) => write!(f, "Migration error: {}", msg),
            MigratorError::Integrity(msg) => write!(f, "Backup integrity error: {}", msg),
            MigratorError::Protected(msg) => write!(f, "Protected environment: {}", msg),
            MigratorError::Locked(msg) => write!(f, "Target locked: {}", msg),
        }
    }
}

impl std::error::Error for MigratorError {}

/// Failure class reported by a unit migration (or any other external step).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitErrorKind {
    ConnectionTimeout,
    Lock,
    ConnectionRefused,
    Network,
    ResourceExhausted,
    Timeout,
    Fatal,
}

// Lowercased substrings that identify a transient failure in free-form output.
const TRANSIENT_SIGNATURES: &[(&str, UnitErrorKind)] = &[
    ("connection timed out", UnitErrorKind::ConnectionTimeout),
    ("connection timeout", UnitErrorKind::ConnectionTimeout),
    ("lock wait timeout", UnitErrorKind::Lock),
    ("deadlock", UnitErrorKind::Lock),
    ("connection refused", UnitErrorKind::ConnectionRefused),
    ("can't connect", UnitErrorKind::ConnectionRefused),
    ("network is unreachable", UnitErrorKind::Network),
    ("temporary failure", UnitErrorKind::Network),
    ("connection reset", UnitErrorKind::Network),
    ("too many connections", UnitErrorKind::ResourceExhausted),
    ("out of memory", UnitErrorKind::ResourceExhausted),
    ("resource temporarily unavailable", UnitErrorKind::ResourceExhausted),
];

impl UnitErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, UnitErrorKind::Fatal)
    }

    /// Classify free-text output from bindings that cannot report a structured kind.
    pub fn from_message(message: &str) -> Self {
        let lowered = message.to_lowercase();
        TRANSIENT_SIGNATURES
            .iter()
            .find(|(needle, _)| lowered.contains(needle))
            .map(|(_, kind)| *kind)
            .unwrap_or(UnitErrorKind::Fatal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitErrorKind::ConnectionTimeout => "connection_timeout",
            UnitErrorKind::Lock => "lock",
            UnitErrorKind::ConnectionRefused => "connection_refused",
            UnitErrorKind::Network => "network",
            UnitErrorKind::ResourceExhausted => "resource_exhausted",
            UnitErrorKind::Timeout => "timeout",
            UnitErrorKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for UnitErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitError {
    pub kind: UnitErrorKind,
    pub message: String,
}

impl UnitError {
    pub fn new(kind: UnitErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(UnitErrorKind::Fatal, message)
    }

    /// Build an error from free-text output, inferring the kind from known signatures.
    pub fn from_output(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = UnitErrorKind::from_message(&message);
        Self { kind, message }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for UnitError {}

impl From<anyhow::Error> for UnitError {
    fn from(err: anyhow::Error) -> Self {
        UnitError::from_output(format!("{:#}", err))
    }
}
