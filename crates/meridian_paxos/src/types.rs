//! Shared types for the Paxos engine.
//!
//! These are kept in a small, dependency-light module because they are used
//! by both the consensus engine and the node's transport layer, which
//! serializes [`PaxosMessage`] onto the wire.

use serde::{Deserialize, Serialize};

/// Identifier of a machine participating in a Paxos group.
pub type MemberId = u64;

/// Position of a decree in the totally ordered log.
pub type SlotId = u64;

/// Position within the member list that is pre-elected as leader.
pub const DEFAULT_LEADER_POSITION: usize = 0;

/// Ballot used to distinguish leaders. Each member's ballot is its position
/// in the member list; leader change is not part of this deployment, so
/// ballots never advance past their initial values.
pub type Ballot = u32;

/// Messages exchanged between members of one Paxos group.
///
/// All messages of a group travel on that group's channel, so no group id is
/// carried here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PaxosMessage {
    /// Client request to order `value`. Non-leaders forward this to the
    /// elected leader.
    Propose { value: u64 },
    /// Leader asks acceptors to accept `value` at `slot`.
    Accept { ballot: Ballot, slot: SlotId, value: u64 },
    /// Acceptor vote for an `Accept`.
    Accepted { ballot: Ballot, slot: SlotId },
    /// Leader announces the chosen value for `slot`.
    Commit { ballot: Ballot, slot: SlotId, value: u64 },
    /// Member acknowledgement of a `Commit`.
    CommitAck { slot: SlotId },
}

/// Outbound transport used by the engine.
///
/// Implementations deliver a message to one member of the same group, on the
/// same logical channel the group receives on. Delivery between a pair of
/// machines must be FIFO; the engine relies on no other transport property.
pub trait PaxosSender: Send + 'static {
    fn send(&self, to: MemberId, msg: PaxosMessage);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_round_trip_through_serde() {
        let msg = PaxosMessage::Accept {
            ballot: 2,
            slot: 7,
            value: 41,
        };
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: PaxosMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, msg);
    }
}
