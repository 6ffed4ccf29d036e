//! Simple multi-decree Paxos for totally ordering integer values in a group.
//!
//! Meridian instantiates this engine twice per machine: once for the local
//! log of a region (ordering the partition ids of single-home batches) and
//! once for the global log (ordering multi-home batches). The engine is
//! transport-agnostic: messages go out through a [`PaxosSender`] and come
//! back in through [`PaxosGroup::handle_message`]. Committed slots are
//! delivered to the embedding module strictly in slot order.

mod acceptor;
mod group;
mod leader;
mod quorum;
mod types;

pub use group::{CommitSink, PaxosGroup};
pub use types::{Ballot, MemberId, PaxosMessage, PaxosSender, SlotId, DEFAULT_LEADER_POSITION};
