//! Internal wire contract between modules.
//!
//! Every message travels inside an [`Envelope`] naming the source machine
//! and the destination channel. The variant names are part of the contract;
//! modules match on them and ignore what they do not handle.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use meridian_paxos::PaxosMessage;

use crate::transaction::{Batch, Transaction};
use crate::types::{BatchId, Key, MachineId, MasterMetadata, PartitionId, SlotId, TxnId, Value};

/// Destination tags. Each module owns exactly one channel per machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Server,
    Forwarder,
    Sequencer,
    MultiHomeOrderer,
    Interleaver,
    Scheduler,
    LocalPaxos,
    GlobalPaxos,
}

/// A batch in flight: either its payload or its position in the owning log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ForwardBatch {
    Data {
        batch: Batch,
        /// Position of this batch within the emitting machine's own
        /// sequence, used by the local log to pair data with Paxos slots.
        same_origin_position: u64,
    },
    Order {
        batch_id: BatchId,
        slot: SlotId,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    /// Broker handshake announcing a live machine.
    Ready,
    /// A transaction on its way to a sequencer or the multi-home orderer.
    ForwardTxn { txn: Transaction },
    /// Batch replication and batch-order announcements.
    ForwardBatch(ForwardBatch),
    /// Local Paxos decision: the batch queue of `queue_id` owns `slot`.
    LocalQueueOrder { slot: SlotId, queue_id: PartitionId },
    /// Consensus traffic for the group owning the channel it arrives on.
    Paxos(PaxosMessage),
    /// Local reads of one partition shipped to the other involved partitions.
    RemoteReadResult {
        txn_id: TxnId,
        partition: PartitionId,
        reads: BTreeMap<Key, Value>,
        will_abort: bool,
    },
    /// One partition's slice of a finished transaction, sent to the
    /// coordinating server.
    CompletedSubtransaction {
        txn: Box<Transaction>,
        partition: PartitionId,
        involved_partitions: Vec<PartitionId>,
    },
    /// Master metadata lookup from a forwarder to a server.
    LookupMaster { txn_id: TxnId, keys: Vec<Key> },
    LookupMasterResult {
        txn_id: TxnId,
        metadata: BTreeMap<Key, MasterMetadata>,
        /// Keys this partition owns but has never stored.
        new_keys: Vec<Key>,
    },
    /// Stats poll routed from the server to a module.
    StatsRequest { id: u64, level: u32 },
    StatsResponse { id: u64, json: String },
}

/// Unit of delivery between modules, on one machine or across the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub from: MachineId,
    pub channel: Channel,
    pub message: Message,
}
