//! One Paxos group: a leader and an acceptor driven by tagged messages.

use crate::acceptor::Acceptor;
use crate::leader::Leader;
pub use crate::leader::CommitSink;
use crate::types::{MemberId, PaxosMessage, PaxosSender};

/// A member (or non-member client) of one Paxos group.
///
/// The embedding module owns the group, feeds every message that arrives on
/// the group's channel into [`handle_message`](Self::handle_message), and
/// receives committed `(slot, value)` pairs through the sink, strictly in
/// slot order.
pub struct PaxosGroup<S: PaxosSender> {
    leader: Leader,
    acceptor: Acceptor,
    sender: S,
    sink: Box<dyn CommitSink>,
}

impl<S: PaxosSender> PaxosGroup<S> {
    /// `members` lists the machines participating in consensus; `me` may or
    /// may not be among them. A non-member can still propose (proposals are
    /// forwarded to the elected leader) but stores no state.
    pub fn new(members: Vec<MemberId>, me: MemberId, sender: S, sink: Box<dyn CommitSink>) -> Self {
        Self {
            leader: Leader::new(members, me),
            acceptor: Acceptor::new(),
            sender,
            sink,
        }
    }

    pub fn is_member(&self) -> bool {
        self.leader.is_member()
    }

    /// Submit a value for ordering from this machine.
    pub fn propose(&mut self, value: u64) -> anyhow::Result<()> {
        self.handle_message(PaxosMessage::Propose { value }, 0)
    }

    /// Process one message from `from`. An error here is a consensus
    /// integrity violation and must be treated as fatal by the caller.
    pub fn handle_message(&mut self, msg: PaxosMessage, from: MemberId) -> anyhow::Result<()> {
        match msg {
            PaxosMessage::Propose { .. } | PaxosMessage::Commit { .. } => {
                self.leader
                    .handle_request(&msg, &self.sender, self.sink.as_mut())?;
                // Commit messages also reach the acceptor, which acknowledges
                // them and drops its acceptance state for the slot.
                self.acceptor.handle_message(&msg, from, &self.sender);
            }
            PaxosMessage::Accept { .. } => {
                self.acceptor.handle_message(&msg, from, &self.sender);
            }
            PaxosMessage::Accepted { .. } | PaxosMessage::CommitAck { .. } => {
                self.leader.handle_response(&msg, from, &self.sender);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Shared in-memory network: every send is queued as `(from, to, msg)`.
    #[derive(Clone, Default)]
    struct Network {
        queue: Arc<Mutex<VecDeque<(MemberId, MemberId, PaxosMessage)>>>,
    }

    /// Sender bound to one member so deliveries carry the true origin.
    #[derive(Clone)]
    struct MemberSender {
        me: MemberId,
        network: Network,
    }

    impl PaxosSender for MemberSender {
        fn send(&self, to: MemberId, msg: PaxosMessage) {
            self.network
                .queue
                .lock()
                .unwrap()
                .push_back((self.me, to, msg));
        }
    }

    type Commits = Arc<Mutex<Vec<(u64, u64)>>>;

    fn make_group(
        members: Vec<MemberId>,
        me: MemberId,
        network: &Network,
    ) -> (PaxosGroup<MemberSender>, Commits) {
        let commits: Commits = Arc::new(Mutex::new(Vec::new()));
        let sink_commits = commits.clone();
        let group = PaxosGroup::new(
            members,
            me,
            MemberSender { me, network: network.clone() },
            Box::new(move |slot, value| sink_commits.lock().unwrap().push((slot, value))),
        );
        (group, commits)
    }

    /// Deliver queued messages until the network is quiescent.
    fn pump(groups: &mut [(MemberId, PaxosGroup<MemberSender>)], network: &Network) {
        loop {
            let next = network.queue.lock().unwrap().pop_front();
            let Some((from, to, msg)) = next else { break };
            for (id, group) in groups.iter_mut() {
                if *id == to {
                    group.handle_message(msg.clone(), from).unwrap();
                }
            }
        }
    }

    #[test]
    fn single_member_commits_proposal_at_next_empty_slot() {
        let network = Network::default();
        let (mut group, commits) = make_group(vec![0], 0, &network);

        group.propose(42).unwrap();
        let mut groups = [(0u64, group)];
        pump(&mut groups, &network);

        assert_eq!(commits.lock().unwrap().as_slice(), &[(0, 42)]);
    }

    #[test]
    fn values_commit_in_proposal_order_on_one_member() {
        let network = Network::default();
        let (mut group, commits) = make_group(vec![0], 0, &network);

        group.propose(7).unwrap();
        group.propose(8).unwrap();
        group.propose(9).unwrap();
        let mut groups = [(0u64, group)];
        pump(&mut groups, &network);

        assert_eq!(
            commits.lock().unwrap().as_slice(),
            &[(0, 7), (1, 8), (2, 9)]
        );
    }

    #[test]
    fn three_members_reach_agreement() {
        let network = Network::default();
        let members = vec![0u64, 1, 2];
        let (leader, leader_commits) = make_group(members.clone(), 0, &network);
        let (m1, m1_commits) = make_group(members.clone(), 1, &network);
        let (m2, m2_commits) = make_group(members.clone(), 2, &network);

        let mut groups = [(0u64, leader), (1u64, m1), (2u64, m2)];
        groups[0].1.propose(11).unwrap();
        pump(&mut groups, &network);

        assert_eq!(leader_commits.lock().unwrap().as_slice(), &[(0, 11)]);
        assert_eq!(m1_commits.lock().unwrap().as_slice(), &[(0, 11)]);
        assert_eq!(m2_commits.lock().unwrap().as_slice(), &[(0, 11)]);
    }

    #[test]
    fn non_member_proposal_is_forwarded_to_the_leader() {
        let network = Network::default();
        let members = vec![0u64, 1];
        let (leader, leader_commits) = make_group(members.clone(), 0, &network);
        let (m1, _) = make_group(members.clone(), 1, &network);
        let (outsider, _) = make_group(members.clone(), 9, &network);

        let mut groups = [(0u64, leader), (1u64, m1), (9u64, outsider)];
        assert!(!groups[2].1.is_member());
        groups[2].1.propose(5).unwrap();
        pump(&mut groups, &network);

        assert_eq!(leader_commits.lock().unwrap().as_slice(), &[(0, 5)]);
    }

    #[test]
    fn divergent_recommit_is_fatal() {
        let network = Network::default();
        let (mut group, _commits) = make_group(vec![0, 1], 1, &network);

        group
            .handle_message(PaxosMessage::Commit { ballot: 0, slot: 5, value: 1 }, 0)
            .unwrap();
        let err = group
            .handle_message(PaxosMessage::Commit { ballot: 0, slot: 5, value: 2 }, 0)
            .unwrap_err();
        assert!(err.to_string().contains("paxos invariant violated"));
    }

    #[test]
    fn duplicate_commit_of_same_value_is_tolerated() {
        let network = Network::default();
        let (mut group, commits) = make_group(vec![0, 1], 1, &network);

        group
            .handle_message(PaxosMessage::Commit { ballot: 0, slot: 0, value: 3 }, 0)
            .unwrap();
        group
            .handle_message(PaxosMessage::Commit { ballot: 0, slot: 0, value: 3 }, 0)
            .unwrap();
        assert_eq!(commits.lock().unwrap().as_slice(), &[(0, 3)]);
    }

    #[test]
    fn out_of_order_commits_are_delivered_in_slot_order() {
        let network = Network::default();
        let (mut group, commits) = make_group(vec![0, 1], 1, &network);

        group
            .handle_message(PaxosMessage::Commit { ballot: 0, slot: 1, value: 20 }, 0)
            .unwrap();
        assert!(commits.lock().unwrap().is_empty());

        group
            .handle_message(PaxosMessage::Commit { ballot: 0, slot: 0, value: 10 }, 0)
            .unwrap();
        assert_eq!(commits.lock().unwrap().as_slice(), &[(0, 10), (1, 20)]);
    }
}
