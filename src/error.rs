//! Error types for minitx
//!
//! Defines a unified error type that can represent failures from the
//! transaction log, the coordinator, and the recovery manager. Phase-level
//! participant failures (votes, heuristics, unresponsiveness) are NOT
//! errors; they are modeled as reply variants in [`crate::resource`] so
//! the coordinator can branch on them exhaustively.

use std::fmt;
use std::io;

/// Unified error type for minitx operations
#[derive(Debug)]
pub enum MiniTxError {
    /// I/O error (log file operations)
    Io(io::Error),
    /// Log record encoding/decoding error
    Codec(String),
    /// Transaction log consistency error (unknown transaction, duplicate
    /// append, conflicting decision)
    Log(String),
    /// Transaction lifecycle error (not found, wrong state)
    Transaction(String),
    /// Resource reconstruction error (unknown factory, bad recovery info)
    Resource(String),
    /// Generic internal error
    Internal(String),
}

impl MiniTxError {
    /// A "transaction not found" error, in the coordinator's wording
    pub fn txn_not_found(txn_id: u64) -> Self {
        MiniTxError::Transaction(format!("Transaction {} not found", txn_id))
    }

    /// A "transaction is not active" error
    pub fn txn_not_active(txn_id: u64) -> Self {
        MiniTxError::Transaction(format!("Transaction {} is not active", txn_id))
    }
}

impl fmt::Display for MiniTxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MiniTxError::Io(e) => write!(f, "{}", e),
            MiniTxError::Codec(msg) => write!(f, "{}", msg),
            MiniTxError::Log(msg) => write!(f, "{}", msg),
            MiniTxError::Transaction(msg) => write!(f, "{}", msg),
            MiniTxError::Resource(msg) => write!(f, "{}", msg),
            MiniTxError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for MiniTxError {}

impl From<io::Error> for MiniTxError {
    fn from(e: io::Error) -> Self {
        MiniTxError::Io(e)
    }
}

impl From<bincode::Error> for MiniTxError {
    fn from(e: bincode::Error) -> Self {
        MiniTxError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for MiniTxError {
    fn from(e: serde_json::Error) -> Self {
        MiniTxError::Codec(e.to_string())
    }
}

/// Result type alias for minitx operations
pub type Result<T> = std::result::Result<T, MiniTxError>;
