//! Transaction recovery
//!
//! A recovery pass reads every incomplete transaction from the durable
//! log, reconstructs a resource handle per unresolved participant from
//! its recovery info, and re-drives each one to a terminal outcome:
//! `commit` if the durable decision was commit, `rollback` otherwise. A
//! transaction whose decision was never durably recorded is presumed
//! aborted: the rollback decision is recorded first, then applied.
//!
//! Passes run at process startup and optionally on a timer. They are
//! idempotent: participants already terminal are never re-invoked, and a
//! pass over a quiet log is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::coordinator::{call_bounded, CoordinatorConfig};
use crate::error::Result;
use crate::lock::TxnLocks;
use crate::order;
use crate::resource::{PhaseReply, ResourceManager};
use crate::types::{Decision, ParticipantOutcome, Transaction};
use crate::wal::TransactionLog;

/// Re-drives in-doubt transactions to a terminal state after a crash
pub struct RecoveryManager {
    log: Arc<TransactionLog>,
    resources: Arc<ResourceManager>,
    locks: Arc<TxnLocks>,
    config: CoordinatorConfig,
}

impl RecoveryManager {
    pub fn new(
        log: Arc<TransactionLog>,
        resources: Arc<ResourceManager>,
        locks: Arc<TxnLocks>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            log,
            resources,
            locks,
            config,
        }
    }

    /// Run one recovery pass, returning how many transactions were fully
    /// resolved. Individual participant failures leave that participant
    /// for a later pass; they never abort the pass.
    pub fn run_recovery_pass(&self) -> Result<usize> {
        let incomplete = self.log.scan_incomplete();
        if incomplete.is_empty() {
            log::debug!("Recovery pass: nothing to resolve");
            return Ok(0);
        }
        log::info!(
            "Recovery pass: {} incomplete transaction(s)",
            incomplete.len()
        );

        let mut resolved = 0;
        for txn in incomplete {
            let txn_id = txn.id;
            let lock = self.locks.handle(txn_id);
            let guard = lock.lock().expect("transaction lock poisoned");

            // Re-read under the lock: a slow in-flight attempt may have
            // finished while we waited.
            let txn = match self.log.read(txn_id) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if txn.complete {
                continue;
            }

            let fully_resolved = match self.resolve_transaction(txn) {
                Ok(true) => {
                    resolved += 1;
                    log::info!("Transaction {} resolved by recovery", txn_id);
                    true
                }
                Ok(false) => {
                    log::warn!(
                        "Transaction {} still has unresolved participants, will retry next pass",
                        txn_id
                    );
                    false
                }
                Err(e) => {
                    log::error!("Transaction {} left unresolved: {}", txn_id, e);
                    false
                }
            };
            drop(guard);
            drop(lock);
            if fully_resolved {
                self.locks.retire(txn_id);
            }
        }

        if resolved > 0 {
            if let Err(e) = self.log.compact() {
                log::warn!("Post-recovery log compaction failed: {}", e);
            }
        }
        Ok(resolved)
    }

    /// Drive one incomplete transaction's participants; returns true when
    /// every participant reached a terminal outcome.
    fn resolve_transaction(&self, mut txn: Transaction) -> Result<bool> {
        let decision = match txn.decision {
            Some(d) => d,
            None => {
                // Crashed before the decision point: in-doubt implies abort
                log::info!(
                    "Transaction {}: no durable decision, presuming rollback",
                    txn.id
                );
                self.log.record_decision(txn.id, Decision::Rollback)?;
                Decision::Rollback
            }
        };

        for i in order::completion_order(&txn.participants) {
            let outcome = txn.participants[i].outcome;
            if outcome.is_terminal() {
                continue;
            }

            let handle = match self.resources.reconstruct(&txn.participants[i].recovery_info) {
                Ok(h) => h,
                Err(e) => {
                    log::warn!(
                        "Transaction {}: cannot reconstruct participant {}: {}",
                        txn.id,
                        txn.participants[i].id,
                        e
                    );
                    continue;
                }
            };

            if outcome.heuristic().is_some() {
                // Crashed between recording the heuristic and the
                // acknowledgment; finish the forget now.
                self.forget(txn.id, &mut txn, i, &handle)?;
                continue;
            }

            // UNKNOWN or PREPARED: re-issue the decision's call
            self.redrive(&mut txn, i, &handle, decision)?;
        }

        if txn.all_terminal() {
            self.log.mark_complete(txn.id)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Re-issue commit or rollback against one participant until it
    /// succeeds, reports a heuristic, or the attempt budget runs out.
    fn redrive(
        &self,
        txn: &mut Transaction,
        i: usize,
        handle: &Arc<dyn crate::resource::ResourceHandle>,
        decision: Decision,
    ) -> Result<()> {
        let txn_id = txn.id;
        let participant_id = txn.participants[i].id;
        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        let success = match decision {
            Decision::Commit => ParticipantOutcome::Committed,
            Decision::Rollback => ParticipantOutcome::RolledBack,
        };

        for attempt in 1..=self.config.recovery_retry_attempts {
            let h = Arc::clone(handle);
            let reply = call_bounded(timeout, PhaseReply::NoReply, move || match decision {
                Decision::Commit => h.commit(),
                Decision::Rollback => h.rollback(),
            });
            match reply {
                PhaseReply::Done => {
                    self.log.update_outcome(txn_id, participant_id, success)?;
                    txn.participants[i].apply_outcome(success);
                    return Ok(());
                }
                PhaseReply::Heuristic(heur) => {
                    log::warn!(
                        "Transaction {}: participant {} reported heuristic {:?} during recovery",
                        txn_id,
                        participant_id,
                        heur
                    );
                    self.log
                        .update_outcome(txn_id, participant_id, heur.as_outcome())?;
                    txn.participants[i].apply_outcome(heur.as_outcome());
                    self.forget(txn_id, txn, i, handle)?;
                    return Ok(());
                }
                PhaseReply::NoReply | PhaseReply::Failed(_) => {
                    log::debug!(
                        "Transaction {}: participant {} unresolved on recovery attempt {}/{}",
                        txn_id,
                        participant_id,
                        attempt,
                        self.config.recovery_retry_attempts
                    );
                    if attempt < self.config.recovery_retry_attempts {
                        thread::sleep(Duration::from_millis(self.config.recovery_retry_pause_ms));
                    }
                }
            }
        }
        log::warn!(
            "Transaction {}: participant {} still unresolved after {} attempts",
            txn_id,
            participant_id,
            self.config.recovery_retry_attempts
        );
        Ok(())
    }

    /// Acknowledge a recorded heuristic and mark the participant
    /// forgotten
    fn forget(
        &self,
        txn_id: crate::types::TxnId,
        txn: &mut Transaction,
        i: usize,
        handle: &Arc<dyn crate::resource::ResourceHandle>,
    ) -> Result<()> {
        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        let h = Arc::clone(handle);
        let acked = call_bounded(timeout, false, move || {
            h.forget();
            true
        });
        if acked {
            let participant_id = txn.participants[i].id;
            self.log
                .update_outcome(txn_id, participant_id, ParticipantOutcome::Forgotten)?;
            txn.participants[i].apply_outcome(ParticipantOutcome::Forgotten);
        } else {
            log::warn!(
                "Transaction {}: participant {} did not acknowledge forget",
                txn_id,
                txn.participants[i].id
            );
        }
        Ok(())
    }

    /// Spawn a dedicated thread that runs a recovery pass every
    /// `interval` until the returned handle is stopped or dropped.
    pub fn start_timer(manager: Arc<Self>, interval: Duration) -> RecoveryTimerHandle {
        let (tx, rx) = mpsc::channel::<()>();
        let running = Arc::new(AtomicBool::new(true));
        let running_flag = Arc::clone(&running);

        let join = thread::spawn(move || {
            loop {
                match rx.recv_timeout(interval) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if let Err(e) = manager.run_recovery_pass() {
                            log::error!("Periodic recovery pass failed: {}", e);
                        }
                    }
                    // Stop requested or handle dropped
                    _ => break,
                }
            }
            running_flag.store(false, Ordering::Release);
            log::debug!("Recovery timer stopped");
        });

        RecoveryTimerHandle {
            stop_tx: tx,
            join: Some(join),
            running,
        }
    }
}

/// Handle to a periodic recovery timer; stops the timer on `stop()` or
/// drop
pub struct RecoveryTimerHandle {
    stop_tx: mpsc::Sender<()>,
    join: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl RecoveryTimerHandle {
    /// Stop the timer and wait for its thread to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    /// Whether the timer thread is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for RecoveryTimerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
