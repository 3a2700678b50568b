//! Participant ordering rules for the prepare and completion phases
//!
//! Both functions return indices into the enlistment-ordered participant
//! slice. Participants carrying an explicit priority always run first, in
//! ascending priority with ties broken by enlistment order. The
//! participants without a priority follow: in enlistment order for
//! prepare, and in reverse enlistment order for completion (commit,
//! rollback, and the recovery drive), letting the first-enlisted act as a
//! stable anchor.

use crate::types::ParticipantRecord;

/// Order in which participants are prepared
pub fn prepare_order(participants: &[ParticipantRecord]) -> Vec<usize> {
    let (mut prioritized, rest) = split(participants);
    prioritized.extend(rest);
    prioritized
}

/// Order in which participants are committed or rolled back
pub fn completion_order(participants: &[ParticipantRecord]) -> Vec<usize> {
    let (mut prioritized, rest) = split(participants);
    prioritized.extend(rest.into_iter().rev());
    prioritized
}

/// Split into (priority-carrying indices sorted ascending by priority
/// then enlistment, indices without a priority in enlistment order)
fn split(participants: &[ParticipantRecord]) -> (Vec<usize>, Vec<usize>) {
    let mut prioritized: Vec<usize> = Vec::new();
    let mut rest: Vec<usize> = Vec::new();
    for (i, p) in participants.iter().enumerate() {
        match p.priority {
            Some(_) => prioritized.push(i),
            None => rest.push(i),
        }
    }
    prioritized.sort_by_key(|&i| (participants[i].priority, i));
    (prioritized, rest)
}
