//! Error types for the off-chain engine

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Envelope signature verification failed
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Remote update cleared or rewrote a previously accepted field
    #[error("Merge conflict: {0}")]
    MergeConflict(String),

    /// Remote update touched a locally-owned or immutable field,
    /// or tried to leave a terminal state
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Required field missing or structurally invalid
    #[error("Missing field: {0}")]
    MissingField(String),

    /// Counterparty requested KYC data the local party has not supplied
    #[error("KYC data required for command {0}")]
    KycDataRequired(Uuid),

    /// Compliance check was inconclusive, manual review required
    #[error("Soft match requires manual review: {0}")]
    SoftMatch(String),

    /// Negotiation aborted by one of the parties (normal negative outcome)
    #[error("Command aborted: {code}")]
    Abort {
        /// Machine-readable abort code
        code: String,
        /// Optional human-readable detail
        message: Option<String>,
    },

    /// Transport retry budget exhausted
    #[error("Transport timeout: {0}")]
    TransportTimeout(String),

    /// Store version race, caller must re-fetch and reapply
    #[error("Version conflict for command {0}")]
    Conflict(Uuid),

    /// Command not found in the store
    #[error("Command not found: {0}")]
    CommandNotFound(Uuid),

    /// Ledger submission failed
    #[error("Ledger submission failed: {0}")]
    LedgerSubmissionFailure(String),

    /// Funding transaction executed with an error status
    #[error("Ledger execution failed: {0}")]
    LedgerExecutionError(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}

/// Wire error classes per the off-chain protocol
pub const ERROR_TYPE_COMMAND: &str = "command_error";
/// Protocol-level wire error class (malformed request, bad signature)
pub const ERROR_TYPE_PROTOCOL: &str = "protocol_error";

/// Structured error object carried in failure responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// `command_error` or `protocol_error`
    pub error_type: String,

    /// Machine-readable error code
    pub code: String,

    /// Dotted path of the offending field, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,

    /// Human-readable detail
    pub message: String,
}

impl WireError {
    /// Build a command-level error (the request was well-formed but rejected)
    pub fn command(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: ERROR_TYPE_COMMAND.to_string(),
            code: code.into(),
            field: None,
            message: message.into(),
        }
    }

    /// Build a protocol-level error (the request itself was invalid)
    pub fn protocol(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: ERROR_TYPE_PROTOCOL.to_string(),
            code: code.into(),
            field: None,
            message: message.into(),
        }
    }

    /// Attach the offending field path
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Convert back into an engine error on the requesting side
    pub fn into_error(self) -> Error {
        match self.code.as_str() {
            "invalid_signature" => Error::InvalidSignature(self.message),
            "merge_conflict" => Error::MergeConflict(self.message),
            "invalid_transition" => Error::InvalidTransition(self.message),
            "missing_field" | "unknown_command_type" => Error::MissingField(self.message),
            "soft_match" => Error::SoftMatch(self.message),
            _ => Error::Other(format!("{}: {}", self.code, self.message)),
        }
    }
}

impl Error {
    /// Map an engine error to its wire representation.
    ///
    /// Store conflicts are resolved locally and must never reach the wire;
    /// they map to an internal protocol error as a last resort.
    pub fn to_wire(&self) -> WireError {
        match self {
            Error::InvalidSignature(msg) => WireError::protocol("invalid_signature", msg.clone()),
            Error::MergeConflict(msg) => WireError::command("merge_conflict", msg.clone()),
            Error::InvalidTransition(msg) => {
                WireError::command("invalid_transition", msg.clone())
            }
            Error::MissingField(msg) => WireError::command("missing_field", msg.clone()),
            Error::SoftMatch(msg) => WireError::command("soft_match", msg.clone()),
            Error::Serialization(msg) => WireError::protocol("invalid_request", msg.clone()),
            other => WireError::protocol("internal_error", other.to_string()),
        }
    }
}
