//! Scripted resource fixture for fault-injection tests
//!
//! A [`ScriptedFixture`] owns the state of a set of scripted resources
//! and hands out [`ResourceHandle`]s bound to it. Each resource carries
//! one-shot action triggers per phase (vote rollback, die with no reply,
//! report a heuristic, or fail) that are consumed when they fire, so a
//! handle reconstructed by recovery behaves normally afterwards. The
//! fixture is itself a [`ResourceFactory`], playing the role of the
//! external resource world that survives a coordinator restart, and it
//! records every observed call for ordering assertions.
//!
//! The fixture is an explicit per-test-run object: two tests using two
//! fixtures share nothing, so scenarios run in parallel.

use std::sync::{Arc, Mutex};

use crate::error::{MiniTxError, Result};
use crate::resource::{PhaseReply, PrepareReply, RecoveryInfo, ResourceFactory, ResourceHandle};
use crate::types::Heuristic;

/// Factory name scripted handles are registered under
pub const SCRIPTED_FACTORY: &str = "scripted";

/// One-shot fault trigger for a single phase call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Vote to roll back during prepare (a normal outcome, not an error)
    VoteRollback,
    /// Return no reply at all, as if the process died mid-call
    Die,
    HeurCommit,
    HeurRollback,
    HeurMixed,
    HeurHazard,
    /// Return an unexpected error
    Fail,
}

/// Phase of an observed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prepare,
    Commit,
    Rollback,
    Forget,
}

#[derive(Debug, Default)]
struct ResourceState {
    prepare_action: Option<FaultAction>,
    commit_action: Option<FaultAction>,
    rollback_action: Option<FaultAction>,
    prepared: bool,
    committed: bool,
    rolled_back: bool,
    forgotten: bool,
}

#[derive(Debug, Default)]
struct FixtureState {
    resources: Vec<ResourceState>,
    calls: Vec<(usize, Phase)>,
}

/// Explicit per-test-run fixture owning `n` scripted resources
pub struct ScriptedFixture {
    state: Arc<Mutex<FixtureState>>,
}

impl ScriptedFixture {
    pub fn new(n: usize) -> Arc<Self> {
        let mut resources = Vec::with_capacity(n);
        resources.resize_with(n, ResourceState::default);
        Arc::new(Self {
            state: Arc::new(Mutex::new(FixtureState {
                resources,
                calls: Vec::new(),
            })),
        })
    }

    /// A handle for resource `index`, bound to this fixture
    pub fn handle(&self, index: usize) -> Arc<dyn ResourceHandle> {
        Arc::new(ScriptedResource {
            index,
            state: Arc::clone(&self.state),
        })
    }

    pub fn set_prepare_action(&self, index: usize, action: FaultAction) {
        self.lock().resources[index].prepare_action = Some(action);
    }

    pub fn set_commit_action(&self, index: usize, action: FaultAction) {
        self.lock().resources[index].commit_action = Some(action);
    }

    pub fn set_rollback_action(&self, index: usize, action: FaultAction) {
        self.lock().resources[index].rollback_action = Some(action);
    }

    /// Every observed call, in order
    pub fn calls(&self) -> Vec<(usize, Phase)> {
        self.lock().calls.clone()
    }

    /// Resource indices observed for one phase, in call order
    pub fn calls_for(&self, phase: Phase) -> Vec<usize> {
        self.lock()
            .calls
            .iter()
            .filter(|(_, p)| *p == phase)
            .map(|(i, _)| *i)
            .collect()
    }

    pub fn was_prepared(&self, index: usize) -> bool {
        self.lock().resources[index].prepared
    }

    pub fn is_committed(&self, index: usize) -> bool {
        self.lock().resources[index].committed
    }

    pub fn is_rolled_back(&self, index: usize) -> bool {
        self.lock().resources[index].rolled_back
    }

    pub fn is_forgotten(&self, index: usize) -> bool {
        self.lock().resources[index].forgotten
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FixtureState> {
        self.state.lock().expect("scripted fixture poisoned")
    }
}

impl ResourceFactory for ScriptedFixture {
    fn reconstruct(&self, info: &RecoveryInfo) -> Result<Arc<dyn ResourceHandle>> {
        let bytes: [u8; 4] = info.data.as_slice().try_into().map_err(|_| {
            MiniTxError::Resource("Malformed scripted recovery info".to_string())
        })?;
        let index = u32::from_le_bytes(bytes) as usize;
        let n = self.lock().resources.len();
        if index >= n {
            return Err(MiniTxError::Resource(format!(
                "Scripted resource {} out of range ({} configured)",
                index, n
            )));
        }
        Ok(self.handle(index))
    }
}

/// A handle to one scripted resource
struct ScriptedResource {
    index: usize,
    state: Arc<Mutex<FixtureState>>,
}

impl ScriptedResource {
    fn lock(&self) -> std::sync::MutexGuard<'_, FixtureState> {
        self.state.lock().expect("scripted fixture poisoned")
    }

    fn apply_phase(
        &self,
        s: &mut FixtureState,
        action: Option<FaultAction>,
        phase: Phase,
    ) -> PhaseReply {
        match action {
            None => {
                match phase {
                    Phase::Commit => s.resources[self.index].committed = true,
                    Phase::Rollback => s.resources[self.index].rolled_back = true,
                    _ => {}
                }
                PhaseReply::Done
            }
            Some(FaultAction::Die) => PhaseReply::NoReply,
            Some(FaultAction::Fail) => PhaseReply::Failed("injected failure".to_string()),
            Some(FaultAction::HeurCommit) => {
                // The participant unilaterally committed
                s.resources[self.index].committed = true;
                PhaseReply::Heuristic(Heuristic::Commit)
            }
            Some(FaultAction::HeurRollback) => {
                s.resources[self.index].rolled_back = true;
                PhaseReply::Heuristic(Heuristic::Rollback)
            }
            Some(FaultAction::HeurMixed) => PhaseReply::Heuristic(Heuristic::Mixed),
            Some(FaultAction::HeurHazard) => PhaseReply::Heuristic(Heuristic::Hazard),
            Some(FaultAction::VoteRollback) => {
                PhaseReply::Failed("vote action fired outside prepare".to_string())
            }
        }
    }
}

impl ResourceHandle for ScriptedResource {
    fn prepare(&self) -> PrepareReply {
        let mut s = self.lock();
        s.calls.push((self.index, Phase::Prepare));
        let action = s.resources[self.index].prepare_action.take();
        match action {
            None => {
                s.resources[self.index].prepared = true;
                PrepareReply::VoteCommit
            }
            Some(FaultAction::VoteRollback) => {
                s.resources[self.index].rolled_back = true;
                PrepareReply::VoteRollback
            }
            Some(FaultAction::Die) => PrepareReply::NoReply,
            Some(FaultAction::Fail) => {
                PrepareReply::Failed("injected prepare failure".to_string())
            }
            Some(FaultAction::HeurCommit) => PrepareReply::Heuristic(Heuristic::Commit),
            Some(FaultAction::HeurRollback) => PrepareReply::Heuristic(Heuristic::Rollback),
            Some(FaultAction::HeurMixed) => PrepareReply::Heuristic(Heuristic::Mixed),
            Some(FaultAction::HeurHazard) => PrepareReply::Heuristic(Heuristic::Hazard),
        }
    }

    fn commit(&self) -> PhaseReply {
        let mut s = self.lock();
        s.calls.push((self.index, Phase::Commit));
        let action = s.resources[self.index].commit_action.take();
        self.apply_phase(&mut s, action, Phase::Commit)
    }

    fn rollback(&self) -> PhaseReply {
        let mut s = self.lock();
        s.calls.push((self.index, Phase::Rollback));
        let action = s.resources[self.index].rollback_action.take();
        self.apply_phase(&mut s, action, Phase::Rollback)
    }

    fn forget(&self) {
        let mut s = self.lock();
        s.calls.push((self.index, Phase::Forget));
        s.resources[self.index].forgotten = true;
    }

    fn recovery_info(&self) -> RecoveryInfo {
        RecoveryInfo::new(
            SCRIPTED_FACTORY,
            (self.index as u32).to_le_bytes().to_vec(),
        )
    }
}
