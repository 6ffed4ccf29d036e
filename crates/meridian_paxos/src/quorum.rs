//! Quorum tracking for in-flight acceptance and commit rounds.

use std::collections::HashSet;

use crate::types::{Ballot, MemberId, PaxosMessage, SlotId};

/// Progress of one quorum round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumState {
    Incomplete,
    QuorumReached,
    Complete,
}

/// Counts matching responses from distinct members.
///
/// `handle_response` reports a state change at most once per state so the
/// leader acts on a quorum exactly once.
pub struct QuorumTracker {
    num_members: usize,
    responded: HashSet<MemberId>,
    state: QuorumState,
    kind: TrackerKind,
}

/// Which round this tracker belongs to, plus the identity of the round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerKind {
    Acceptance { ballot: Ballot, slot: SlotId },
    Commit { slot: SlotId },
}

impl QuorumTracker {
    pub fn new(num_members: usize, kind: TrackerKind) -> Self {
        Self {
            num_members,
            responded: HashSet::new(),
            state: QuorumState::Incomplete,
            kind,
        }
    }

    pub fn kind(&self) -> TrackerKind {
        self.kind
    }

    pub fn state(&self) -> QuorumState {
        self.state
    }

    /// Feed a response into the tracker. Returns true when the state changed.
    pub fn handle_response(&mut self, msg: &PaxosMessage, from: MemberId) -> bool {
        if self.state == QuorumState::Complete {
            return false;
        }
        if !self.response_matches(msg) {
            return false;
        }
        self.responded.insert(from);

        let count = self.responded.len();
        if count == self.num_members {
            self.state = QuorumState::Complete;
            return true;
        }
        if count > self.num_members / 2 && self.state != QuorumState::QuorumReached {
            self.state = QuorumState::QuorumReached;
            return true;
        }
        false
    }

    fn response_matches(&self, msg: &PaxosMessage) -> bool {
        match (self.kind, msg) {
            (
                TrackerKind::Acceptance { ballot, slot },
                PaxosMessage::Accepted {
                    ballot: b,
                    slot: s,
                },
            ) => *b == ballot && *s == slot,
            (TrackerKind::Commit { slot }, PaxosMessage::CommitAck { slot: s }) => *s == slot,
            _ => false,
        }
    }
}
