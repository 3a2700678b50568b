//! Core transaction types: identifiers, statuses, outcomes, and the
//! materialized transaction view reconstructed from the durable log.

use serde::{Deserialize, Serialize};

/// Log Sequence Number - unique identifier for each log record
pub type Lsn = u64;

/// Transaction ID, unique per attempt (never reused across restarts)
pub type TxnId = u64;

/// Participant ID, the 1-based enlistment index within one transaction
pub type ParticipantId = u32;

/// Transaction state as seen through the coordinator and the durable log.
///
/// `Active` and `InDoubt` are coordinator-side states: `Active` before the
/// commit protocol starts, `InDoubt` when a log write failed mid-protocol
/// and the outcome can only be resolved by a later recovery pass. The
/// remaining states are derived from durable records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Preparing,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    HeuristicMixed,
    HeuristicHazard,
    InDoubt,
}

/// The durable global decision for a transaction.
///
/// A transaction with no durable decision is presumed aborted: recovery
/// defaults to rollback when the coordinator crashed before the decision
/// point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Commit,
    Rollback,
}

/// A unilateral decision a participant made without coordinator
/// instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Heuristic {
    Commit,
    Rollback,
    Mixed,
    Hazard,
}

/// Recorded outcome of one participant within one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantOutcome {
    Unknown,
    Prepared,
    Committed,
    RolledBack,
    HeurCommit,
    HeurRollback,
    HeurMixed,
    HeurHazard,
    Forgotten,
}

impl ParticipantOutcome {
    /// A terminal participant is never re-invoked.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ParticipantOutcome::Committed
                | ParticipantOutcome::RolledBack
                | ParticipantOutcome::Forgotten
        )
    }

    /// The heuristic this outcome reports, if any
    pub fn heuristic(&self) -> Option<Heuristic> {
        match self {
            ParticipantOutcome::HeurCommit => Some(Heuristic::Commit),
            ParticipantOutcome::HeurRollback => Some(Heuristic::Rollback),
            ParticipantOutcome::HeurMixed => Some(Heuristic::Mixed),
            ParticipantOutcome::HeurHazard => Some(Heuristic::Hazard),
            _ => None,
        }
    }
}

impl Heuristic {
    /// The participant outcome recording this heuristic
    pub fn as_outcome(&self) -> ParticipantOutcome {
        match self {
            Heuristic::Commit => ParticipantOutcome::HeurCommit,
            Heuristic::Rollback => ParticipantOutcome::HeurRollback,
            Heuristic::Mixed => ParticipantOutcome::HeurMixed,
            Heuristic::Hazard => ParticipantOutcome::HeurHazard,
        }
    }
}

/// One enlisted resource in one transaction branch, as recorded durably.
///
/// `heuristic` remembers which unilateral decision the participant
/// reported even after its outcome advances to `Forgotten`, so the
/// aggregate transaction state stays computable after acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    /// 1-based enlistment index
    pub id: ParticipantId,
    /// Opaque token sufficient to reconstruct a handle after restart
    pub recovery_info: crate::resource::RecoveryInfo,
    /// Explicit commit-order priority; lower runs earlier, ties broken by
    /// enlistment order
    pub priority: Option<i32>,
    /// Current outcome
    pub outcome: ParticipantOutcome,
    /// Remembered heuristic, surviving the transition to `Forgotten`
    pub heuristic: Option<Heuristic>,
}

impl ParticipantRecord {
    pub fn new(
        id: ParticipantId,
        recovery_info: crate::resource::RecoveryInfo,
        priority: Option<i32>,
    ) -> Self {
        Self {
            id,
            recovery_info,
            priority,
            outcome: ParticipantOutcome::Unknown,
            heuristic: None,
        }
    }

    /// Advance this participant's outcome, remembering any heuristic it
    /// reports.
    pub fn apply_outcome(&mut self, outcome: ParticipantOutcome) {
        if let Some(h) = outcome.heuristic() {
            self.heuristic = Some(h);
        }
        self.outcome = outcome;
    }
}

/// Caller-visible aggregate outcome of `commit`/`rollback`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed,
    RolledBack,
    HeuristicMixed,
    HeuristicHazard,
    /// A log write failed mid-protocol; only a recovery pass can resolve
    /// the transaction
    InDoubt,
}

/// Derive the aggregate outcome from the durable decision and the
/// participant records.
///
/// Any participant whose remembered heuristic diverges from the decision
/// forces `HeuristicMixed`; a hazard forces `HeuristicHazard` unless a
/// mixed outcome already applies.
pub fn aggregate_outcome(decision: Decision, participants: &[ParticipantRecord]) -> TxnOutcome {
    let mut mixed = false;
    let mut hazard = false;
    for p in participants {
        match (decision, p.heuristic) {
            (_, Some(Heuristic::Mixed)) => mixed = true,
            (_, Some(Heuristic::Hazard)) => hazard = true,
            (Decision::Commit, Some(Heuristic::Rollback)) => mixed = true,
            (Decision::Rollback, Some(Heuristic::Commit)) => mixed = true,
            _ => {}
        }
    }
    if mixed {
        TxnOutcome::HeuristicMixed
    } else if hazard {
        TxnOutcome::HeuristicHazard
    } else {
        match decision {
            Decision::Commit => TxnOutcome::Committed,
            Decision::Rollback => TxnOutcome::RolledBack,
        }
    }
}

/// A transaction materialized from its durable log records
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Transaction ID
    pub id: TxnId,
    /// Enlisted participants, in enlistment order
    pub participants: Vec<ParticipantRecord>,
    /// The durable global decision, if one was recorded
    pub decision: Option<Decision>,
    /// Whether the terminal marker was written
    pub complete: bool,
    /// LSN of the first record for this transaction
    pub first_lsn: Lsn,
    /// LSN of the most recent record for this transaction
    pub last_lsn: Lsn,
}

impl Transaction {
    /// Derive the transaction status from its durable state
    pub fn status(&self) -> TxnStatus {
        match (self.complete, self.decision) {
            (true, Some(d)) => match aggregate_outcome(d, &self.participants) {
                TxnOutcome::Committed => TxnStatus::Committed,
                TxnOutcome::RolledBack => TxnStatus::RolledBack,
                TxnOutcome::HeuristicMixed => TxnStatus::HeuristicMixed,
                TxnOutcome::HeuristicHazard => TxnStatus::HeuristicHazard,
                TxnOutcome::InDoubt => TxnStatus::InDoubt,
            },
            // Completed without a decision record: presumed abort
            (true, None) => TxnStatus::RolledBack,
            (false, None) => TxnStatus::Preparing,
            (false, Some(Decision::Commit)) => {
                // All votes are in; Prepared until the first participant
                // reaches a terminal outcome
                if self.participants.iter().any(|p| p.outcome.is_terminal()) {
                    TxnStatus::Committing
                } else {
                    TxnStatus::Prepared
                }
            }
            (false, Some(Decision::Rollback)) => TxnStatus::RollingBack,
        }
    }

    /// True once every participant has reached a terminal outcome
    pub fn all_terminal(&self) -> bool {
        self.participants.iter().all(|p| p.outcome.is_terminal())
    }
}
