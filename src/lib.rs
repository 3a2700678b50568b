//! minitx, a minimal two-phase-commit transaction coordinator
//!
//! A coordinator drives enlisted resource participants through the
//! prepare/commit/rollback phases of two-phase commit, journaling every
//! step through a durable write-ahead transaction log. After a crash, a
//! recovery manager re-reads the log, reconstructs participant handles
//! from their recovery info, and re-drives every in-doubt participant to
//! a terminal outcome.
//!
//! Everything is wired by plain construction: open a [`TxRuntime`],
//! register resource factories, run one recovery pass, then begin
//! transactions:
//!
//! ```no_run
//! use std::path::PathBuf;
//! use minitx::{CoordinatorConfig, TxRuntime};
//! use minitx::scripted::ScriptedFixture;
//!
//! # fn main() -> minitx::Result<()> {
//! let runtime = TxRuntime::open(PathBuf::from("./data"), CoordinatorConfig::default())?;
//! let fixture = ScriptedFixture::new(2);
//! runtime.resources().register(minitx::scripted::SCRIPTED_FACTORY, fixture.clone());
//! runtime.recover()?;
//!
//! let txn = runtime.coordinator().begin()?;
//! runtime.coordinator().enlist(txn, fixture.handle(0), None)?;
//! runtime.coordinator().enlist(txn, fixture.handle(1), None)?;
//! let outcome = runtime.coordinator().commit(txn)?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub mod coordinator;
pub mod error;
pub mod lock;
pub mod order;
pub mod record;
pub mod recovery;
pub mod resource;
pub mod scripted;
pub mod types;
pub mod wal;

pub use coordinator::{CoordinatorConfig, TransactionCoordinator};
pub use error::{MiniTxError, Result};
pub use recovery::{RecoveryManager, RecoveryTimerHandle};
pub use resource::{
    PhaseReply, PrepareReply, RecoveryInfo, ResourceFactory, ResourceHandle, ResourceManager,
};
pub use types::{
    aggregate_outcome, Decision, Heuristic, ParticipantId, ParticipantOutcome, ParticipantRecord,
    Transaction, TxnId, TxnOutcome, TxnStatus,
};
pub use wal::TransactionLog;

use crate::lock::TxnLocks;

/// The assembled transaction runtime: log, factory registry, coordinator,
/// and recovery manager sharing one lock table.
pub struct TxRuntime {
    log: Arc<TransactionLog>,
    resources: Arc<ResourceManager>,
    coordinator: TransactionCoordinator,
    recovery: Arc<RecoveryManager>,
}

impl TxRuntime {
    /// Open the runtime over a data directory. Replays any existing
    /// transaction log; register resource factories and call
    /// [`TxRuntime::recover`] before beginning new transactions.
    pub fn open(data_dir: PathBuf, config: CoordinatorConfig) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let log = Arc::new(TransactionLog::open(data_dir)?);
        let locks = Arc::new(TxnLocks::new());
        let resources = Arc::new(ResourceManager::new());

        let coordinator =
            TransactionCoordinator::new(Arc::clone(&log), Arc::clone(&locks), config.clone());
        let recovery = Arc::new(RecoveryManager::new(
            Arc::clone(&log),
            Arc::clone(&resources),
            locks,
            config,
        ));

        Ok(Self {
            log,
            resources,
            coordinator,
            recovery,
        })
    }

    /// Run one startup recovery pass, returning how many transactions
    /// were resolved
    pub fn recover(&self) -> Result<usize> {
        self.recovery.run_recovery_pass()
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    /// Start a periodic recovery timer; the timer stops when the
    /// returned handle is stopped or dropped
    pub fn start_recovery_timer(&self, interval: Duration) -> RecoveryTimerHandle {
        RecoveryManager::start_timer(Arc::clone(&self.recovery), interval)
    }

    pub fn log(&self) -> &Arc<TransactionLog> {
        &self.log
    }
}
