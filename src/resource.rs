//! Participant-side resource contract and factory registry
//!
//! A [`ResourceHandle`] represents one enlisted resource in one
//! transaction branch. Phase calls return closed reply enums instead of
//! raising, so the coordinator's phase logic can branch exhaustively:
//!
//! - a rollback vote is a normal prepare outcome, not an error;
//! - a heuristic reply is a unilateral decision that must be surfaced;
//! - `NoReply` means no response was received at all (the participant
//!   died or timed out) and the outcome is unknown; it must be resolved
//!   through the durable log, never assumed to be success or failure;
//! - `Failed` is an unexpected error, which during prepare counts as an
//!   implicit rollback vote.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{MiniTxError, Result};
use crate::types::Heuristic;

/// Reply to a prepare call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareReply {
    /// The participant votes to commit and guarantees it can
    VoteCommit,
    /// The participant votes to roll back and has already undone its
    /// work; it needs no further calls
    VoteRollback,
    /// The participant made a unilateral decision
    Heuristic(Heuristic),
    /// No response was received; outcome unknown
    NoReply,
    /// Unexpected participant error
    Failed(String),
}

/// Reply to a commit or rollback call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseReply {
    /// The requested outcome was applied
    Done,
    /// The participant had already decided unilaterally
    Heuristic(Heuristic),
    /// No response was received; outcome unknown
    NoReply,
    /// Unexpected participant error; the call may be retried
    Failed(String),
}

/// Opaque serializable token sufficient to reconstruct a
/// [`ResourceHandle`] after restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryInfo {
    /// Name of the registered factory that understands `data`
    pub factory: String,
    /// Resource-specific payload
    pub data: Vec<u8>,
}

impl RecoveryInfo {
    pub fn new(factory: &str, data: Vec<u8>) -> Self {
        Self {
            factory: factory.to_string(),
            data,
        }
    }
}

/// One enlisted resource in one transaction branch
pub trait ResourceHandle: Send + Sync {
    /// Phase one: ask the participant to vote
    fn prepare(&self) -> PrepareReply;
    /// Phase two: apply the commit decision
    fn commit(&self) -> PhaseReply;
    /// Phase two: apply the rollback decision
    fn rollback(&self) -> PhaseReply;
    /// Acknowledge a heuristic outcome, clearing the participant's
    /// heuristic state
    fn forget(&self);
    /// Token from which a fresh handle can be reconstructed after
    /// restart
    fn recovery_info(&self) -> RecoveryInfo;
}

/// Reconstructs handles from recovery info after a restart
pub trait ResourceFactory: Send + Sync {
    fn reconstruct(&self, info: &RecoveryInfo) -> Result<Arc<dyn ResourceHandle>>;
}

/// Registry of resource factories, keyed by factory name. Replaces the
/// platform service registry with explicit registration at startup.
pub struct ResourceManager {
    factories: RwLock<HashMap<String, Arc<dyn ResourceFactory>>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Register a factory under a name; recovery info carrying that name
    /// is routed to it. Re-registering a name replaces the previous
    /// factory.
    pub fn register(&self, name: &str, factory: Arc<dyn ResourceFactory>) {
        let mut factories = self.factories.write().expect("factory registry poisoned");
        if factories.insert(name.to_string(), factory).is_some() {
            log::debug!("Resource factory '{}' replaced", name);
        }
    }

    /// Reconstruct a handle from its recovery info
    pub fn reconstruct(&self, info: &RecoveryInfo) -> Result<Arc<dyn ResourceHandle>> {
        let factories = self.factories.read().expect("factory registry poisoned");
        let factory = factories.get(&info.factory).ok_or_else(|| {
            MiniTxError::Resource(format!("No resource factory registered as '{}'", info.factory))
        })?;
        factory.reconstruct(info)
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}
