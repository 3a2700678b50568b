use super::*;
use crate::scripted::{FaultAction, Phase, ScriptedFixture};
use crate::wal::TransactionLog;
use tempfile::tempdir;

fn coordinator(dir: &std::path::Path) -> TransactionCoordinator {
    let log = Arc::new(TransactionLog::open(dir.to_path_buf()).unwrap());
    TransactionCoordinator::new(log, Arc::new(TxnLocks::new()), CoordinatorConfig::default())
}

#[test]
fn test_begin_and_enlist() {
    let dir = tempdir().unwrap();
    let tm = coordinator(dir.path());
    let fixture = ScriptedFixture::new(2);

    let txn = tm.begin().unwrap();
    assert!(tm.is_active(txn));
    assert_eq!(tm.enlist(txn, fixture.handle(0), None).unwrap(), 1);
    assert_eq!(tm.enlist(txn, fixture.handle(1), Some(3)).unwrap(), 2);
}

#[test]
fn test_enlist_unknown_transaction() {
    let dir = tempdir().unwrap();
    let tm = coordinator(dir.path());
    let fixture = ScriptedFixture::new(1);

    let err = tm.enlist(99, fixture.handle(0), None).unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn test_empty_transaction_commits_without_logging() {
    let dir = tempdir().unwrap();
    let log = Arc::new(TransactionLog::open(dir.path().to_path_buf()).unwrap());
    let tm = TransactionCoordinator::new(
        Arc::clone(&log),
        Arc::new(TxnLocks::new()),
        CoordinatorConfig::default(),
    );

    let txn = tm.begin().unwrap();
    assert_eq!(tm.commit(txn).unwrap(), TxnOutcome::Committed);
    assert!(!tm.is_active(txn));
    assert!(log.read(txn).is_err());
}

#[test]
fn test_commit_happy_path() {
    let dir = tempdir().unwrap();
    let log = Arc::new(TransactionLog::open(dir.path().to_path_buf()).unwrap());
    let tm = TransactionCoordinator::new(
        Arc::clone(&log),
        Arc::new(TxnLocks::new()),
        CoordinatorConfig::default(),
    );
    let fixture = ScriptedFixture::new(3);

    let txn = tm.begin().unwrap();
    for i in 0..3 {
        tm.enlist(txn, fixture.handle(i), None).unwrap();
    }
    assert_eq!(tm.commit(txn).unwrap(), TxnOutcome::Committed);

    for i in 0..3 {
        assert!(fixture.was_prepared(i));
        assert!(fixture.is_committed(i));
    }
    let stored = log.read(txn).unwrap();
    assert!(stored.complete);
    assert_eq!(stored.status(), TxnStatus::Committed);
    for p in &stored.participants {
        assert_eq!(p.outcome, ParticipantOutcome::Committed);
    }
}

#[test]
fn test_commit_after_commit_is_rejected() {
    let dir = tempdir().unwrap();
    let tm = coordinator(dir.path());
    let fixture = ScriptedFixture::new(1);

    let txn = tm.begin().unwrap();
    tm.enlist(txn, fixture.handle(0), None).unwrap();
    tm.commit(txn).unwrap();
    assert!(tm.commit(txn).is_err());
    assert!(tm.enlist(txn, fixture.handle(0), None).is_err());
}

#[test]
fn test_rollback_vote_aborts_and_skips_rest() {
    let dir = tempdir().unwrap();
    let log = Arc::new(TransactionLog::open(dir.path().to_path_buf()).unwrap());
    let tm = TransactionCoordinator::new(
        Arc::clone(&log),
        Arc::new(TxnLocks::new()),
        CoordinatorConfig::default(),
    );
    let fixture = ScriptedFixture::new(3);
    fixture.set_prepare_action(1, FaultAction::VoteRollback);

    let txn = tm.begin().unwrap();
    for i in 0..3 {
        tm.enlist(txn, fixture.handle(i), None).unwrap();
    }
    assert_eq!(tm.commit(txn).unwrap(), TxnOutcome::RolledBack);

    // Participant 3 was enlisted after the rollback voter: never prepared
    assert_eq!(fixture.calls_for(Phase::Prepare), vec![0, 1]);
    assert!(fixture.was_prepared(0));
    assert!(!fixture.was_prepared(2));

    // The already-prepared participant was rolled back; the voter's vote
    // was its own undo; the skipped one was undone too
    assert!(fixture.is_rolled_back(0));
    assert!(fixture.is_rolled_back(1));
    assert_eq!(fixture.calls_for(Phase::Rollback), vec![2, 0]);

    let stored = log.read(txn).unwrap();
    assert!(stored.complete);
    assert_eq!(stored.status(), TxnStatus::RolledBack);
}

#[test]
fn test_prepare_failure_is_implicit_rollback_vote() {
    let dir = tempdir().unwrap();
    let tm = coordinator(dir.path());
    let fixture = ScriptedFixture::new(2);
    fixture.set_prepare_action(0, FaultAction::Fail);

    let txn = tm.begin().unwrap();
    tm.enlist(txn, fixture.handle(0), None).unwrap();
    tm.enlist(txn, fixture.handle(1), None).unwrap();
    assert_eq!(tm.commit(txn).unwrap(), TxnOutcome::RolledBack);

    // The second participant was never prepared, and both were undone
    assert_eq!(fixture.calls_for(Phase::Prepare), vec![0]);
    assert!(fixture.is_rolled_back(0));
    assert!(fixture.is_rolled_back(1));
}

#[test]
fn test_caller_rollback() {
    let dir = tempdir().unwrap();
    let log = Arc::new(TransactionLog::open(dir.path().to_path_buf()).unwrap());
    let tm = TransactionCoordinator::new(
        Arc::clone(&log),
        Arc::new(TxnLocks::new()),
        CoordinatorConfig::default(),
    );
    let fixture = ScriptedFixture::new(2);

    let txn = tm.begin().unwrap();
    tm.enlist(txn, fixture.handle(0), None).unwrap();
    tm.enlist(txn, fixture.handle(1), None).unwrap();
    assert_eq!(tm.rollback(txn).unwrap(), TxnOutcome::RolledBack);

    // Nothing was ever prepared; both participants were undone in
    // reverse enlistment order
    assert!(fixture.calls_for(Phase::Prepare).is_empty());
    assert_eq!(fixture.calls_for(Phase::Rollback), vec![1, 0]);
    assert!(log.read(txn).unwrap().complete);
}

#[test]
fn test_default_commit_order_is_reverse_enlistment() {
    let dir = tempdir().unwrap();
    let tm = coordinator(dir.path());
    let fixture = ScriptedFixture::new(3);

    let txn = tm.begin().unwrap();
    for i in 0..3 {
        tm.enlist(txn, fixture.handle(i), None).unwrap();
    }
    tm.commit(txn).unwrap();

    assert_eq!(fixture.calls_for(Phase::Prepare), vec![0, 1, 2]);
    assert_eq!(fixture.calls_for(Phase::Commit), vec![2, 1, 0]);
}

#[test]
fn test_priority_dictates_commit_order() {
    let dir = tempdir().unwrap();
    let tm = coordinator(dir.path());
    let fixture = ScriptedFixture::new(3);

    // A=1, B=-1, C unset: prioritized ascending first, then the rest
    let txn = tm.begin().unwrap();
    tm.enlist(txn, fixture.handle(0), Some(1)).unwrap();
    tm.enlist(txn, fixture.handle(1), Some(-1)).unwrap();
    tm.enlist(txn, fixture.handle(2), None).unwrap();
    tm.commit(txn).unwrap();

    assert_eq!(fixture.calls_for(Phase::Commit), vec![1, 0, 2]);
}

#[test]
fn test_heuristic_rollback_on_commit_is_mixed() {
    let dir = tempdir().unwrap();
    let log = Arc::new(TransactionLog::open(dir.path().to_path_buf()).unwrap());
    let tm = TransactionCoordinator::new(
        Arc::clone(&log),
        Arc::new(TxnLocks::new()),
        CoordinatorConfig::default(),
    );
    let fixture = ScriptedFixture::new(2);
    fixture.set_commit_action(1, FaultAction::HeurRollback);

    let txn = tm.begin().unwrap();
    tm.enlist(txn, fixture.handle(0), None).unwrap();
    tm.enlist(txn, fixture.handle(1), None).unwrap();
    assert_eq!(tm.commit(txn).unwrap(), TxnOutcome::HeuristicMixed);

    // The divergent participant was acknowledged and forgotten
    assert!(fixture.is_forgotten(1));
    assert!(fixture.is_committed(0));

    let stored = log.read(txn).unwrap();
    assert!(stored.complete);
    assert_eq!(stored.status(), TxnStatus::HeuristicMixed);
    assert_eq!(
        stored.participants[1].outcome,
        ParticipantOutcome::Forgotten
    );
    assert_eq!(stored.participants[1].heuristic, Some(Heuristic::Rollback));
}

#[test]
fn test_heuristic_commit_on_commit_stays_committed() {
    let dir = tempdir().unwrap();
    let tm = coordinator(dir.path());
    let fixture = ScriptedFixture::new(2);
    fixture.set_commit_action(0, FaultAction::HeurCommit);

    let txn = tm.begin().unwrap();
    tm.enlist(txn, fixture.handle(0), None).unwrap();
    tm.enlist(txn, fixture.handle(1), None).unwrap();

    // The heuristic matches the decision, so the aggregate is still a
    // commit; the participant is still forgotten
    assert_eq!(tm.commit(txn).unwrap(), TxnOutcome::Committed);
    assert!(fixture.is_forgotten(0));
}

#[test]
fn test_heuristic_hazard_on_commit() {
    let dir = tempdir().unwrap();
    let tm = coordinator(dir.path());
    let fixture = ScriptedFixture::new(2);
    fixture.set_commit_action(1, FaultAction::HeurHazard);

    let txn = tm.begin().unwrap();
    tm.enlist(txn, fixture.handle(0), None).unwrap();
    tm.enlist(txn, fixture.handle(1), None).unwrap();
    assert_eq!(tm.commit(txn).unwrap(), TxnOutcome::HeuristicHazard);
    assert!(fixture.is_forgotten(1));
}

#[test]
fn test_unresponsive_prepare_defers_to_recovery() {
    let dir = tempdir().unwrap();
    let log = Arc::new(TransactionLog::open(dir.path().to_path_buf()).unwrap());
    let tm = TransactionCoordinator::new(
        Arc::clone(&log),
        Arc::new(TxnLocks::new()),
        CoordinatorConfig::default(),
    );
    let fixture = ScriptedFixture::new(2);
    fixture.set_prepare_action(0, FaultAction::Die);

    let txn = tm.begin().unwrap();
    tm.enlist(txn, fixture.handle(0), None).unwrap();
    tm.enlist(txn, fixture.handle(1), None).unwrap();

    // A rollback decision is definite even with an unresponsive
    // participant (presumed abort)
    assert_eq!(tm.commit(txn).unwrap(), TxnOutcome::RolledBack);

    // The rest of the round still ran: participant 2 prepared, then was
    // rolled back; the dead participant was not touched again
    assert!(fixture.was_prepared(1));
    assert!(fixture.is_rolled_back(1));
    assert_eq!(fixture.calls_for(Phase::Rollback), vec![1]);

    let stored = log.read(txn).unwrap();
    assert!(!stored.complete);
    assert_eq!(stored.decision, Some(Decision::Rollback));
    assert_eq!(stored.participants[0].outcome, ParticipantOutcome::Unknown);
}

#[test]
fn test_blocking_resource_times_out_as_no_reply() {
    use crate::resource::{PhaseReply, PrepareReply, RecoveryInfo, ResourceHandle};
    use std::time::Instant;

    struct StuckHandle;

    impl ResourceHandle for StuckHandle {
        fn prepare(&self) -> PrepareReply {
            thread::sleep(Duration::from_secs(5));
            PrepareReply::VoteCommit
        }
        fn commit(&self) -> PhaseReply {
            PhaseReply::Done
        }
        fn rollback(&self) -> PhaseReply {
            PhaseReply::Done
        }
        fn forget(&self) {}
        fn recovery_info(&self) -> RecoveryInfo {
            RecoveryInfo::new("stuck", vec![])
        }
    }

    let dir = tempdir().unwrap();
    let log = Arc::new(TransactionLog::open(dir.path().to_path_buf()).unwrap());
    let config = CoordinatorConfig {
        call_timeout_ms: 50,
        ..Default::default()
    };
    let tm = TransactionCoordinator::new(Arc::clone(&log), Arc::new(TxnLocks::new()), config);

    let txn = tm.begin().unwrap();
    tm.enlist(txn, Arc::new(StuckHandle), None).unwrap();

    let start = Instant::now();
    assert_eq!(tm.commit(txn).unwrap(), TxnOutcome::RolledBack);
    assert!(start.elapsed() < Duration::from_secs(2));

    // Timeout and death are indistinguishable: outcome unknown, left for
    // recovery
    let stored = log.read(txn).unwrap();
    assert!(!stored.complete);
    assert_eq!(stored.participants[0].outcome, ParticipantOutcome::Unknown);
}

#[test]
fn test_txn_ids_resume_past_logged_transactions() {
    let dir = tempdir().unwrap();
    let fixture = ScriptedFixture::new(1);
    let first_txn;
    {
        let tm = coordinator(dir.path());
        first_txn = tm.begin().unwrap();
        tm.enlist(first_txn, fixture.handle(0), None).unwrap();
        fixture.set_commit_action(0, FaultAction::Die);
        tm.commit(first_txn).unwrap();
    }

    // A fresh coordinator over the same log must not reuse the id of the
    // incomplete transaction
    let tm = coordinator(dir.path());
    let next = tm.begin().unwrap();
    assert!(next > first_txn);
}

#[test]
fn test_concurrent_transactions_proceed_independently() {
    let dir = tempdir().unwrap();
    let log = Arc::new(TransactionLog::open(dir.path().to_path_buf()).unwrap());
    let tm = Arc::new(TransactionCoordinator::new(
        log,
        Arc::new(TxnLocks::new()),
        CoordinatorConfig::default(),
    ));

    let mut handles = Vec::new();
    for t in 0..4 {
        let tm = Arc::clone(&tm);
        handles.push(thread::spawn(move || {
            let fixture = ScriptedFixture::new(2);
            let txn = tm.begin().unwrap();
            tm.enlist(txn, fixture.handle(0), None).unwrap();
            tm.enlist(txn, fixture.handle(1), None).unwrap();
            let outcome = if t % 2 == 0 {
                tm.commit(txn).unwrap()
            } else {
                tm.rollback(txn).unwrap()
            };
            (t, outcome)
        }));
    }

    for handle in handles {
        let (t, outcome) = handle.join().unwrap();
        if t % 2 == 0 {
            assert_eq!(outcome, TxnOutcome::Committed);
        } else {
            assert_eq!(outcome, TxnOutcome::RolledBack);
        }
    }
}
