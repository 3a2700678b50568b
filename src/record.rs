//! Transaction log record structures
//!
//! Each durable record is binary-encoded (bincode) with a 4-byte length
//! prefix. Records are append-only; a transaction's state is the
//! left-to-right fold of its records.

use serde::{Deserialize, Serialize};

use crate::types::{Decision, Lsn, ParticipantId, ParticipantOutcome, ParticipantRecord, TxnId};

/// A transaction log record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Log sequence number
    pub lsn: Lsn,
    /// Transaction ID
    pub txn_id: TxnId,
    /// The operation
    pub op: LogOperation,
    /// Timestamp (Unix epoch millis)
    pub timestamp: u64,
}

/// Operations that can be logged
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogOperation {
    /// The transaction entered the prepare phase with this participant
    /// list. Also doubles as the snapshot record during log compaction,
    /// which is why participants carry their current outcomes.
    Enlisted {
        participants: Vec<ParticipantRecord>,
    },
    /// The durable global decision, written before any phase-two call
    Decision { decision: Decision },
    /// A participant's outcome changed
    Outcome {
        participant_id: ParticipantId,
        outcome: ParticipantOutcome,
    },
    /// Every participant reached a terminal outcome
    Completed,
}
