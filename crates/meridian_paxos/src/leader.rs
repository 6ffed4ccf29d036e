//! Leader role: assigns slots to proposals and drives acceptance and commit
//! rounds. Every member runs a `Leader`, but only the member at
//! [`crate::types::DEFAULT_LEADER_POSITION`] in the member list is elected;
//! the others forward proposals to it.

use std::collections::HashMap;

use anyhow::bail;

use crate::quorum::{QuorumState, QuorumTracker, TrackerKind};
use crate::types::{Ballot, MemberId, PaxosMessage, PaxosSender, SlotId, DEFAULT_LEADER_POSITION};

#[derive(Debug, Clone, Copy)]
struct Proposal {
    ballot: Ballot,
    value: u64,
}

/// Sink for committed decrees, invoked strictly in slot order.
pub trait CommitSink: Send {
    fn on_commit(&mut self, slot: SlotId, value: u64);
}

impl<F: FnMut(SlotId, u64) + Send> CommitSink for F {
    fn on_commit(&mut self, slot: SlotId, value: u64) {
        self(slot, value)
    }
}

pub struct Leader {
    members: Vec<MemberId>,
    is_member: bool,
    is_elected: bool,
    elected_leader: MemberId,
    ballot: Ballot,

    /// Next slot the elected leader will assign.
    next_empty_slot: SlotId,
    /// Pending proposals by slot, kept until committed.
    proposals: HashMap<SlotId, Proposal>,
    /// Commits received but not yet delivered in order.
    committed: HashMap<SlotId, (Ballot, u64)>,
    /// Next slot to hand to the commit sink.
    next_delivery: SlotId,

    trackers: Vec<QuorumTracker>,
}

impl Leader {
    pub fn new(members: Vec<MemberId>, me: MemberId) -> Self {
        let position = members.iter().position(|m| *m == me);
        let is_member = position.is_some();
        // Non-members always forward proposals to the initially elected
        // leader of the group, which never changes in this deployment.
        let is_elected = position == Some(DEFAULT_LEADER_POSITION);
        let ballot = position.unwrap_or(0) as Ballot;
        let elected_leader = members[DEFAULT_LEADER_POSITION];
        Self {
            members,
            is_member,
            is_elected,
            elected_leader,
            ballot,
            next_empty_slot: 0,
            proposals: HashMap::new(),
            committed: HashMap::new(),
            next_delivery: 0,
            trackers: Vec::new(),
        }
    }

    pub fn is_member(&self) -> bool {
        self.is_member
    }

    /// Handle a request-type message (`Propose` or `Commit`).
    pub fn handle_request<S: PaxosSender>(
        &mut self,
        msg: &PaxosMessage,
        sender: &S,
        sink: &mut dyn CommitSink,
    ) -> anyhow::Result<()> {
        match *msg {
            PaxosMessage::Propose { value } => {
                if self.is_elected {
                    self.start_acceptance(value, sender);
                } else {
                    sender.send(self.elected_leader, PaxosMessage::Propose { value });
                }
            }
            PaxosMessage::Commit { ballot, slot, value } => {
                self.process_commit(ballot, slot, value, sink)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Handle a response-type message (`Accepted` or `CommitAck`).
    pub fn handle_response<S: PaxosSender>(
        &mut self,
        msg: &PaxosMessage,
        from: MemberId,
        sender: &S,
    ) {
        let mut commit_slots = Vec::new();
        for tracker in &mut self.trackers {
            if !tracker.handle_response(msg, from) {
                continue;
            }
            if let TrackerKind::Acceptance { slot, .. } = tracker.kind() {
                // With two or fewer members a tracker reaches Complete without
                // passing through QuorumReached, so check both states.
                if tracker.state() == QuorumState::QuorumReached
                    || (self.members.len() <= 2 && tracker.state() == QuorumState::Complete)
                {
                    commit_slots.push(slot);
                }
            }
        }
        self.trackers
            .retain(|t| t.state() != QuorumState::Complete);

        for slot in commit_slots {
            self.start_commit(slot, sender);
        }
    }

    fn start_acceptance<S: PaxosSender>(&mut self, value: u64, sender: &S) {
        let slot = self.next_empty_slot;
        self.next_empty_slot += 1;
        tracing::trace!(slot, value, "starting acceptance round");
        self.proposals.insert(slot, Proposal { ballot: self.ballot, value });
        self.trackers.push(QuorumTracker::new(
            self.members.len(),
            TrackerKind::Acceptance { ballot: self.ballot, slot },
        ));
        self.send_to_all_members(
            PaxosMessage::Accept { ballot: self.ballot, slot, value },
            sender,
        );
    }

    fn start_commit<S: PaxosSender>(&mut self, slot: SlotId, sender: &S) {
        let Some(proposal) = self.proposals.get(&slot).copied() else {
            return;
        };
        self.trackers.push(QuorumTracker::new(
            self.members.len(),
            TrackerKind::Commit { slot },
        ));
        self.send_to_all_members(
            PaxosMessage::Commit { ballot: proposal.ballot, slot, value: proposal.value },
            sender,
        );
    }

    fn process_commit(
        &mut self,
        ballot: Ballot,
        slot: SlotId,
        value: u64,
        sink: &mut dyn CommitSink,
    ) -> anyhow::Result<()> {
        if slot < self.next_delivery {
            // Values of delivered slots are forgotten, so retransmissions of
            // old commits cannot be checked and are simply dropped.
            return Ok(());
        }
        if let Some(&(prev_ballot, prev_value)) = self.committed.get(&slot) {
            if prev_value != value || prev_ballot != ballot {
                bail!(
                    "paxos invariant violated: slot {slot} committed twice with diverging \
                     decrees ({prev_value} by ballot {prev_ballot}, then {value} by ballot {ballot})"
                );
            }
            return Ok(());
        }
        self.committed.insert(slot, (ballot, value));
        self.proposals.remove(&slot);
        if slot >= self.next_empty_slot {
            self.next_empty_slot = slot + 1;
        }

        // Deliver the contiguous committed prefix in slot order.
        while let Some((_, value)) = self.committed.remove(&self.next_delivery) {
            sink.on_commit(self.next_delivery, value);
            self.next_delivery += 1;
        }
        Ok(())
    }

    fn send_to_all_members<S: PaxosSender>(&self, msg: PaxosMessage, sender: &S) {
        for member in &self.members {
            sender.send(*member, msg.clone());
        }
    }
}
