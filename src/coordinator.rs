//! Transaction coordinator for minitx
//!
//! Drives each transaction's participants through the two-phase-commit
//! state machine, ordering calls, interpreting votes and heuristics, and
//! journaling every step through the write-ahead [`TransactionLog`].
//!
//! ## Protocol
//!
//! 1. BEGIN: allocate a transaction id, create an in-memory enlistment
//! 2. ENLIST: attach resource handles (optionally with a commit priority)
//! 3. COMMIT: prepare every participant in prepare order; if all vote
//!    commit, durably record the commit decision and commit in completion
//!    order; otherwise durably record rollback and undo in completion
//!    order
//! 4. The transaction is marked complete once every participant reached a
//!    terminal outcome; anything left unresolved belongs to recovery
//!
//! ## Write-ahead discipline
//!
//! The participant list hits the log before the first prepare, each vote
//! before the next participant call, and the global decision before any
//! phase-two call. A participant is therefore never asked to commit
//! unless its durable record shows a successful prepare vote, and a crash
//! at any point is recoverable from the log alone.
//!
//! ## Unresponsive participants
//!
//! Resource calls are the only operations that may block, so each one is
//! bounded by `call_timeout_ms` and issued from a helper thread; a
//! timeout is treated exactly like a participant that died mid-call: the
//! outcome is unknown and only the durable log plus a later recovery pass
//! may resolve it. A rollback decision stays definite even with
//! unresponsive participants (presumed abort); a commit decision is
//! definite once durably recorded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, RwLock};
use std::thread;
use std::time::Duration;

use crate::error::{MiniTxError, Result};
use crate::lock::TxnLocks;
use crate::order;
use crate::resource::{PhaseReply, PrepareReply, ResourceHandle};
use crate::types::{
    aggregate_outcome, Decision, Heuristic, ParticipantId, ParticipantOutcome, ParticipantRecord,
    TxnId, TxnOutcome, TxnStatus,
};
use crate::wal::TransactionLog;

/// Configuration for the coordinator and the recovery manager.
///
/// The default bounds each resource call at five seconds and lets a
/// recovery pass retry an unresponsive participant three times before
/// leaving it for the next pass.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum time to wait for one resource call (milliseconds); an
    /// expired call is treated as no reply received
    pub call_timeout_ms: u64,
    /// How many times one recovery pass re-attempts a participant
    pub recovery_retry_attempts: u32,
    /// Pause between recovery re-attempts (milliseconds)
    pub recovery_retry_pause_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
            recovery_retry_attempts: 3,
            recovery_retry_pause_ms: 50,
        }
    }
}

/// Run a resource call on a helper thread, bounded by `timeout`. When the
/// deadline expires the caller proceeds with `no_reply`; a late reply
/// goes to a dropped channel and is discarded.
pub(crate) fn call_bounded<R: Send + 'static>(
    timeout: Duration,
    no_reply: R,
    call: impl FnOnce() -> R + Send + 'static,
) -> R {
    let (tx, rx) = mpsc::sync_channel(1);
    thread::spawn(move || {
        let _ = tx.send(call());
    });
    rx.recv_timeout(timeout).unwrap_or(no_reply)
}

/// A live (not yet committed or rolled back) transaction
struct LiveTxn {
    status: TxnStatus,
    participants: Vec<ParticipantRecord>,
    handles: Vec<Arc<dyn ResourceHandle>>,
}

/// The transaction coordinator
pub struct TransactionCoordinator {
    log: Arc<TransactionLog>,
    locks: Arc<TxnLocks>,
    config: CoordinatorConfig,
    /// Next transaction id, seeded past everything already in the log
    next_txn_id: AtomicU64,
    /// Live transactions (txn_id -> enlistment)
    live: RwLock<HashMap<TxnId, LiveTxn>>,
}

impl TransactionCoordinator {
    pub fn new(log: Arc<TransactionLog>, locks: Arc<TxnLocks>, config: CoordinatorConfig) -> Self {
        let next_txn_id = AtomicU64::new(log.max_txn_id() + 1);
        Self {
            log,
            locks,
            config,
            next_txn_id,
            live: RwLock::new(HashMap::new()),
        }
    }

    /// Begin a new transaction
    pub fn begin(&self) -> Result<TxnId> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let mut live = self.live.write().expect("live transaction table poisoned");
        live.insert(
            txn_id,
            LiveTxn {
                status: TxnStatus::Active,
                participants: Vec::new(),
                handles: Vec::new(),
            },
        );
        log::debug!("Transaction {} begun", txn_id);
        Ok(txn_id)
    }

    /// Enlist a resource in a transaction. Enlistment order determines
    /// prepare order; an explicit priority overrides completion order
    /// (lower runs earlier, unprioritized participants run last).
    pub fn enlist(
        &self,
        txn_id: TxnId,
        handle: Arc<dyn ResourceHandle>,
        priority: Option<i32>,
    ) -> Result<ParticipantId> {
        let mut live = self.live.write().expect("live transaction table poisoned");
        let txn = live
            .get_mut(&txn_id)
            .ok_or_else(|| MiniTxError::txn_not_found(txn_id))?;
        if txn.status != TxnStatus::Active {
            return Err(MiniTxError::txn_not_active(txn_id));
        }
        let participant_id = (txn.participants.len() + 1) as ParticipantId;
        txn.participants.push(ParticipantRecord::new(
            participant_id,
            handle.recovery_info(),
            priority,
        ));
        txn.handles.push(handle);
        Ok(participant_id)
    }

    /// Check if a transaction is live and still accepting enlistments
    pub fn is_active(&self, txn_id: TxnId) -> bool {
        let live = self.live.read().expect("live transaction table poisoned");
        matches!(live.get(&txn_id), Some(t) if t.status == TxnStatus::Active)
    }

    /// Commit a transaction, returning the aggregate outcome. Heuristic
    /// variants are surfaced so the caller can decide whether follow-up
    /// operator action is needed; `InDoubt` is returned only when a log
    /// write failed and the next recovery pass owns the transaction.
    pub fn commit(&self, txn_id: TxnId) -> Result<TxnOutcome> {
        let lock = self.locks.handle(txn_id);
        let guard = lock.lock().expect("transaction lock poisoned");

        let (mut participants, handles) = self.start_protocol(txn_id)?;

        if participants.is_empty() {
            self.finish(txn_id);
            drop(guard);
            drop(lock);
            self.locks.retire(txn_id);
            log::debug!("Transaction {} has no participants, committed trivially", txn_id);
            return Ok(TxnOutcome::Committed);
        }

        let outcome = match self.drive_commit(txn_id, &mut participants, &handles) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!(
                    "Transaction {}: log failure mid-protocol, outcome in doubt: {}",
                    txn_id,
                    e
                );
                TxnOutcome::InDoubt
            }
        };
        self.finish(txn_id);
        drop(guard);
        drop(lock);
        self.locks.retire(txn_id);
        Ok(outcome)
    }

    /// Roll back a transaction, undoing every enlisted participant
    pub fn rollback(&self, txn_id: TxnId) -> Result<TxnOutcome> {
        let lock = self.locks.handle(txn_id);
        let guard = lock.lock().expect("transaction lock poisoned");

        let (mut participants, handles) = self.start_protocol(txn_id)?;

        if participants.is_empty() {
            self.finish(txn_id);
            drop(guard);
            drop(lock);
            self.locks.retire(txn_id);
            log::debug!("Transaction {} has no participants, rolled back trivially", txn_id);
            return Ok(TxnOutcome::RolledBack);
        }

        let outcome = match self.drive_abort(txn_id, &mut participants, &handles) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!(
                    "Transaction {}: log failure mid-rollback, outcome in doubt: {}",
                    txn_id,
                    e
                );
                TxnOutcome::InDoubt
            }
        };
        self.finish(txn_id);
        drop(guard);
        drop(lock);
        self.locks.retire(txn_id);
        Ok(outcome)
    }

    /// Claim a live transaction for its commit/rollback protocol run
    fn start_protocol(
        &self,
        txn_id: TxnId,
    ) -> Result<(Vec<ParticipantRecord>, Vec<Arc<dyn ResourceHandle>>)> {
        let mut live = self.live.write().expect("live transaction table poisoned");
        let txn = live
            .get_mut(&txn_id)
            .ok_or_else(|| MiniTxError::txn_not_found(txn_id))?;
        if txn.status != TxnStatus::Active {
            return Err(MiniTxError::txn_not_active(txn_id));
        }
        txn.status = TxnStatus::Preparing;
        Ok((txn.participants.clone(), txn.handles.clone()))
    }

    /// Drop the live entry; from here the durable log owns the
    /// transaction.
    fn finish(&self, txn_id: TxnId) {
        let mut live = self.live.write().expect("live transaction table poisoned");
        live.remove(&txn_id);
    }

    /// The full two-phase protocol for one transaction. Only log errors
    /// propagate; participant failures are absorbed into outcomes.
    fn drive_commit(
        &self,
        txn_id: TxnId,
        participants: &mut [ParticipantRecord],
        handles: &[Arc<dyn ResourceHandle>],
    ) -> Result<TxnOutcome> {
        self.log.append(txn_id, participants)?;

        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        let mut unresponsive = vec![false; participants.len()];
        let mut abort = false;

        for i in order::prepare_order(participants) {
            let handle = Arc::clone(&handles[i]);
            let reply = call_bounded(timeout, PrepareReply::NoReply, move || handle.prepare());
            match reply {
                PrepareReply::VoteCommit => {
                    self.record(txn_id, participants, i, ParticipantOutcome::Prepared)?;
                }
                PrepareReply::VoteRollback => {
                    log::info!(
                        "Transaction {}: participant {} voted rollback",
                        txn_id,
                        participants[i].id
                    );
                    // The vote is its own undo; this participant is done
                    self.record(txn_id, participants, i, ParticipantOutcome::RolledBack)?;
                    abort = true;
                }
                PrepareReply::Failed(msg) => {
                    log::warn!(
                        "Transaction {}: participant {} failed during prepare, treating as rollback vote: {}",
                        txn_id,
                        participants[i].id,
                        msg
                    );
                    abort = true;
                }
                PrepareReply::Heuristic(h) => {
                    log::warn!(
                        "Transaction {}: participant {} reported heuristic {:?} during prepare",
                        txn_id,
                        participants[i].id,
                        h
                    );
                    self.resolve_heuristic(txn_id, participants, i, &handles[i], h)?;
                    abort = true;
                }
                PrepareReply::NoReply => {
                    log::warn!(
                        "Transaction {}: participant {} unresponsive during prepare, deferring to recovery",
                        txn_id,
                        participants[i].id
                    );
                    unresponsive[i] = true;
                }
            }
            if abort {
                // Participants not yet prepared are skipped: never prepared
                break;
            }
        }

        // An unresponsive participant leaves its vote unknown, so the
        // transaction cannot commit; in-doubt implies abort.
        let decision = if abort || unresponsive.iter().any(|&u| u) {
            Decision::Rollback
        } else {
            Decision::Commit
        };
        self.log.record_decision(txn_id, decision)?;

        match decision {
            Decision::Commit => {
                for i in order::completion_order(participants) {
                    let handle = Arc::clone(&handles[i]);
                    let reply = call_bounded(timeout, PhaseReply::NoReply, move || handle.commit());
                    match reply {
                        PhaseReply::Done => {
                            self.record(txn_id, participants, i, ParticipantOutcome::Committed)?;
                        }
                        PhaseReply::Heuristic(h) => {
                            self.resolve_heuristic(txn_id, participants, i, &handles[i], h)?;
                        }
                        PhaseReply::NoReply => {
                            log::warn!(
                                "Transaction {}: participant {} unresponsive during commit, left prepared for recovery",
                                txn_id,
                                participants[i].id
                            );
                        }
                        PhaseReply::Failed(msg) => {
                            log::warn!(
                                "Transaction {}: participant {} failed during commit, left prepared for recovery: {}",
                                txn_id,
                                participants[i].id,
                                msg
                            );
                        }
                    }
                }
            }
            Decision::Rollback => {
                self.drive_rollback(txn_id, participants, handles, &unresponsive)?;
            }
        }

        if participants.iter().all(|p| p.outcome.is_terminal()) {
            self.log.mark_complete(txn_id)?;
            log::debug!("Transaction {} complete", txn_id);
        }

        Ok(aggregate_outcome(decision, participants))
    }

    /// Caller-initiated abort: durably decide rollback, then undo
    fn drive_abort(
        &self,
        txn_id: TxnId,
        participants: &mut [ParticipantRecord],
        handles: &[Arc<dyn ResourceHandle>],
    ) -> Result<TxnOutcome> {
        self.log.append(txn_id, participants)?;
        self.log.record_decision(txn_id, Decision::Rollback)?;

        let unresponsive = vec![false; participants.len()];
        self.drive_rollback(txn_id, participants, handles, &unresponsive)?;

        if participants.iter().all(|p| p.outcome.is_terminal()) {
            self.log.mark_complete(txn_id)?;
        }
        Ok(aggregate_outcome(Decision::Rollback, participants))
    }

    /// Send rollback to every participant still needing it, in
    /// completion order. Participants that never replied during prepare
    /// are skipped; only recovery may touch them.
    fn drive_rollback(
        &self,
        txn_id: TxnId,
        participants: &mut [ParticipantRecord],
        handles: &[Arc<dyn ResourceHandle>],
        unresponsive: &[bool],
    ) -> Result<()> {
        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        for i in order::completion_order(participants) {
            match participants[i].outcome {
                ParticipantOutcome::Unknown | ParticipantOutcome::Prepared => {}
                _ => continue,
            }
            if unresponsive[i] {
                continue;
            }
            let handle = Arc::clone(&handles[i]);
            let reply = call_bounded(timeout, PhaseReply::NoReply, move || handle.rollback());
            match reply {
                PhaseReply::Done => {
                    self.record(txn_id, participants, i, ParticipantOutcome::RolledBack)?;
                }
                PhaseReply::Heuristic(h) => {
                    self.resolve_heuristic(txn_id, participants, i, &handles[i], h)?;
                }
                PhaseReply::NoReply => {
                    log::warn!(
                        "Transaction {}: participant {} unresponsive during rollback, deferred to recovery",
                        txn_id,
                        participants[i].id
                    );
                }
                PhaseReply::Failed(msg) => {
                    log::warn!(
                        "Transaction {}: participant {} failed during rollback, deferred to recovery: {}",
                        txn_id,
                        participants[i].id,
                        msg
                    );
                }
            }
        }
        Ok(())
    }

    /// Durably record a participant outcome, then mirror it locally
    fn record(
        &self,
        txn_id: TxnId,
        participants: &mut [ParticipantRecord],
        i: usize,
        outcome: ParticipantOutcome,
    ) -> Result<()> {
        self.log.update_outcome(txn_id, participants[i].id, outcome)?;
        participants[i].apply_outcome(outcome);
        Ok(())
    }

    /// Record a heuristic outcome durably, acknowledge it with `forget`,
    /// and mark the participant forgotten. If the forget call gets no
    /// reply, the heuristic outcome stays recorded and recovery finishes
    /// the acknowledgment later.
    fn resolve_heuristic(
        &self,
        txn_id: TxnId,
        participants: &mut [ParticipantRecord],
        i: usize,
        handle: &Arc<dyn ResourceHandle>,
        heuristic: Heuristic,
    ) -> Result<()> {
        self.record(txn_id, participants, i, heuristic.as_outcome())?;

        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        let h = Arc::clone(handle);
        let acked = call_bounded(timeout, false, move || {
            h.forget();
            true
        });
        if acked {
            self.record(txn_id, participants, i, ParticipantOutcome::Forgotten)?;
        } else {
            log::warn!(
                "Transaction {}: participant {} did not acknowledge forget, deferring to recovery",
                txn_id,
                participants[i].id
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
