//! Durable transaction log
//!
//! The log is the single source of truth for recovery. It is an
//! append-only file of binary records (4-byte little-endian length prefix
//! followed by a bincode-encoded [`LogRecord`]) plus an in-memory index of
//! materialized transactions rebuilt by replaying the file at open.
//!
//! ## Write-ahead discipline
//!
//! Every mutation is flushed and fsynced before the call returns. The
//! coordinator relies on this: a participant is only ever sent `commit`
//! after its prepare vote and the global commit decision are on disk,
//! so a crash between participant calls is always recoverable.
//!
//! ## Compaction
//!
//! Completed transactions are archived by rewriting the log with only the
//! incomplete ones (a snapshot `Enlisted` record plus the decision, if
//! any). The rewrite goes through a temp file and an atomic rename, and a
//! small JSON checkpoint marker records when it happened.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{MiniTxError, Result};
use crate::record::{LogOperation, LogRecord};
use crate::types::{
    Decision, Lsn, ParticipantId, ParticipantOutcome, ParticipantRecord, Transaction, TxnId,
};

const LOG_FILE: &str = "txn.log";
const CHECKPOINT_FILE: &str = "txn.checkpoint";

/// Durable, append-only record of each transaction's participant list and
/// per-participant outcomes. Safe under concurrent calls from different
/// transactions; a single interior mutex serializes the file.
pub struct TransactionLog {
    data_dir: PathBuf,
    inner: Mutex<LogInner>,
}

struct LogInner {
    file: File,
    next_lsn: Lsn,
    index: HashMap<TxnId, Transaction>,
}

impl TransactionLog {
    /// Open (or create) the log in `data_dir`, replaying any existing
    /// records into the in-memory index.
    pub fn open(data_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&data_dir)?;
        let log_path = data_dir.join(LOG_FILE);

        let mut index = HashMap::new();
        let mut next_lsn: Lsn = 1;
        if log_path.exists() {
            let mut file = File::open(&log_path)?;
            let mut records = 0usize;
            loop {
                let mut len_buf = [0u8; 4];
                match file.read_exact(&mut len_buf) {
                    Ok(_) => {}
                    Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                }
                let len = u32::from_le_bytes(len_buf) as usize;

                let mut record_buf = vec![0u8; len];
                match file.read_exact(&mut record_buf) {
                    Ok(_) => {}
                    Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        log::warn!("Dropping torn record at tail of transaction log");
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }

                let record: LogRecord = match bincode::deserialize(&record_buf) {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("Skipping malformed transaction log record: {}", e);
                        continue;
                    }
                };

                next_lsn = next_lsn.max(record.lsn + 1);
                Self::apply(&mut index, &record);
                records += 1;
            }
            if records > 0 {
                log::info!(
                    "Transaction log replayed: {} records, {} transaction(s), next LSN {}",
                    records,
                    index.len(),
                    next_lsn
                );
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&log_path)?;

        Ok(Self {
            data_dir,
            inner: Mutex::new(LogInner {
                file,
                next_lsn,
                index,
            }),
        })
    }

    /// Fold one record into the materialized index
    fn apply(index: &mut HashMap<TxnId, Transaction>, record: &LogRecord) {
        match &record.op {
            LogOperation::Enlisted { participants } => {
                index.insert(
                    record.txn_id,
                    Transaction {
                        id: record.txn_id,
                        participants: participants.clone(),
                        decision: None,
                        complete: false,
                        first_lsn: record.lsn,
                        last_lsn: record.lsn,
                    },
                );
            }
            LogOperation::Decision { decision } => {
                if let Some(txn) = index.get_mut(&record.txn_id) {
                    txn.decision = Some(*decision);
                    txn.last_lsn = record.lsn;
                }
            }
            LogOperation::Outcome {
                participant_id,
                outcome,
            } => {
                if let Some(txn) = index.get_mut(&record.txn_id) {
                    if let Some(p) = txn
                        .participants
                        .iter_mut()
                        .find(|p| p.id == *participant_id)
                    {
                        p.apply_outcome(*outcome);
                    }
                    txn.last_lsn = record.lsn;
                }
            }
            LogOperation::Completed => {
                if let Some(txn) = index.get_mut(&record.txn_id) {
                    txn.complete = true;
                    txn.last_lsn = record.lsn;
                }
            }
        }
    }

    /// Get current timestamp in milliseconds
    fn timestamp() -> u64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(dur) => dur.as_millis() as u64,
            Err(_) => 0,
        }
    }

    /// Append one record durably (write, flush, fsync) and fold it into
    /// the index. Holds the inner lock across the whole write so records
    /// for one transaction are strictly ordered.
    fn append_record(&self, txn_id: TxnId, op: LogOperation) -> Result<Lsn> {
        let mut inner = self.inner.lock().expect("transaction log lock poisoned");
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;

        let record = LogRecord {
            lsn,
            txn_id,
            op,
            timestamp: Self::timestamp(),
        };

        let encoded = bincode::serialize(&record)?;
        let len = encoded.len() as u32;
        inner.file.write_all(&len.to_le_bytes())?;
        inner.file.write_all(&encoded)?;
        inner.file.flush()?;
        inner.file.sync_data()?;

        Self::apply(&mut inner.index, &record);
        Ok(lsn)
    }

    /// Record a transaction's participant list at the start of its
    /// prepare phase.
    pub fn append(&self, txn_id: TxnId, participants: &[ParticipantRecord]) -> Result<()> {
        {
            let inner = self.inner.lock().expect("transaction log lock poisoned");
            if inner.index.contains_key(&txn_id) {
                return Err(MiniTxError::Log(format!(
                    "Transaction {} already logged",
                    txn_id
                )));
            }
        }
        self.append_record(
            txn_id,
            LogOperation::Enlisted {
                participants: participants.to_vec(),
            },
        )?;
        Ok(())
    }

    /// Durably record the global decision for a transaction. Rejects a
    /// conflicting decision; re-recording the same decision is a no-op.
    pub fn record_decision(&self, txn_id: TxnId, decision: Decision) -> Result<()> {
        {
            let inner = self.inner.lock().expect("transaction log lock poisoned");
            match inner.index.get(&txn_id) {
                None => return Err(MiniTxError::Log(format!("Transaction {} not in log", txn_id))),
                Some(txn) => match txn.decision {
                    Some(existing) if existing == decision => return Ok(()),
                    Some(existing) => {
                        return Err(MiniTxError::Log(format!(
                            "Transaction {} already decided {:?}, refusing {:?}",
                            txn_id, existing, decision
                        )))
                    }
                    None => {}
                },
            }
        }
        self.append_record(txn_id, LogOperation::Decision { decision })?;
        Ok(())
    }

    /// Durably record a participant outcome change
    pub fn update_outcome(
        &self,
        txn_id: TxnId,
        participant_id: ParticipantId,
        outcome: ParticipantOutcome,
    ) -> Result<()> {
        {
            let inner = self.inner.lock().expect("transaction log lock poisoned");
            let txn = inner
                .index
                .get(&txn_id)
                .ok_or_else(|| MiniTxError::Log(format!("Transaction {} not in log", txn_id)))?;
            if !txn.participants.iter().any(|p| p.id == participant_id) {
                return Err(MiniTxError::Log(format!(
                    "Transaction {} has no participant {}",
                    txn_id, participant_id
                )));
            }
        }
        self.append_record(
            txn_id,
            LogOperation::Outcome {
                participant_id,
                outcome,
            },
        )?;
        Ok(())
    }

    /// Mark a transaction complete (every participant terminal). A second
    /// call is a no-op.
    pub fn mark_complete(&self, txn_id: TxnId) -> Result<()> {
        {
            let inner = self.inner.lock().expect("transaction log lock poisoned");
            match inner.index.get(&txn_id) {
                None => return Err(MiniTxError::Log(format!("Transaction {} not in log", txn_id))),
                Some(txn) if txn.complete => return Ok(()),
                Some(_) => {}
            }
        }
        self.append_record(txn_id, LogOperation::Completed)?;
        Ok(())
    }

    /// Every transaction that was appended but not yet marked complete,
    /// in ascending id order. Used at startup and by recovery passes.
    pub fn scan_incomplete(&self) -> Vec<Transaction> {
        let inner = self.inner.lock().expect("transaction log lock poisoned");
        let mut txns: Vec<Transaction> = inner
            .index
            .values()
            .filter(|t| !t.complete)
            .cloned()
            .collect();
        txns.sort_by_key(|t| t.id);
        txns
    }

    /// Read one transaction's materialized state
    pub fn read(&self, txn_id: TxnId) -> Result<Transaction> {
        let inner = self.inner.lock().expect("transaction log lock poisoned");
        inner
            .index
            .get(&txn_id)
            .cloned()
            .ok_or_else(|| MiniTxError::Log(format!("Transaction {} not in log", txn_id)))
    }

    /// Highest transaction id present in the log (0 when empty). Used to
    /// seed the id allocator so identifiers stay unique across restarts.
    pub fn max_txn_id(&self) -> TxnId {
        let inner = self.inner.lock().expect("transaction log lock poisoned");
        inner.index.keys().copied().max().unwrap_or(0)
    }

    /// Archive completed transactions: rewrite the log keeping only the
    /// incomplete ones, via a temp file and an atomic rename, then drop
    /// the completed entries from the index and write a checkpoint
    /// marker.
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("transaction log lock poisoned");
        let log_path = self.data_dir.join(LOG_FILE);

        let mut incomplete: Vec<&Transaction> =
            inner.index.values().filter(|t| !t.complete).collect();
        incomplete.sort_by_key(|t| t.id);

        let mut temp = tempfile::NamedTempFile::new_in(&self.data_dir)?;
        let mut next_lsn = inner.next_lsn;
        for txn in &incomplete {
            // One snapshot record captures the participant list with its
            // current outcomes; the decision follows if one was recorded.
            let mut ops = vec![LogOperation::Enlisted {
                participants: txn.participants.clone(),
            }];
            if let Some(decision) = txn.decision {
                ops.push(LogOperation::Decision { decision });
            }
            for op in ops {
                let record = LogRecord {
                    lsn: next_lsn,
                    txn_id: txn.id,
                    op,
                    timestamp: Self::timestamp(),
                };
                next_lsn += 1;
                let encoded = bincode::serialize(&record)?;
                let len = encoded.len() as u32;
                temp.write_all(&len.to_le_bytes())?;
                temp.write_all(&encoded)?;
            }
        }
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.persist(&log_path).map_err(|e| MiniTxError::Io(e.error))?;

        let archived = inner.index.len() - incomplete.len();
        let remaining = incomplete.len();
        inner.index.retain(|_, t| !t.complete);
        inner.next_lsn = next_lsn;
        inner.file = OpenOptions::new().append(true).open(&log_path)?;

        let checkpoint = serde_json::json!({
            "lsn": next_lsn - 1,
            "incomplete": remaining,
            "timestamp": Self::timestamp(),
        });
        fs::write(
            self.data_dir.join(CHECKPOINT_FILE),
            serde_json::to_string_pretty(&checkpoint)?,
        )?;

        log::info!(
            "Transaction log compacted: {} archived, {} incomplete retained",
            archived,
            remaining
        );
        Ok(())
    }
}
