//! Core identifiers and constants shared by every module of the node.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Keys and values are opaque strings on the wire.
pub type Key = String;
pub type Value = String;

pub type TxnId = u64;
pub type BatchId = u64;
pub type SlotId = u64;
pub type RegionId = u32;
pub type PartitionId = u32;

/// Upper bound on cluster size used to carve id spaces: txn ids and batch
/// ids are `counter * MAX_NUM_MACHINES + machine_number`, which keeps them
/// globally unique without coordination.
pub const MAX_NUM_MACHINES: u64 = 1000;

/// Entries whose lock state returned to UNLOCKED are evicted once the lock
/// table grows past this limit.
pub const LOCK_TABLE_SIZE_LIMIT: usize = 1_000_000;

/// Region that masters keys never seen by any partition before.
pub const DEFAULT_MASTER_REGION_OF_NEW_KEY: RegionId = 0;

/// One machine of the cluster, addressed by region and partition.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MachineId {
    pub region: RegionId,
    pub partition: PartitionId,
}

impl MachineId {
    pub fn new(region: RegionId, partition: PartitionId) -> Self {
        Self { region, partition }
    }

    /// Dense code used wherever a machine must be a single integer (Paxos
    /// member ids). Independent of cluster shape.
    pub fn code(&self) -> u64 {
        (u64::from(self.region) << 32) | u64::from(self.partition)
    }

    pub fn from_code(code: u64) -> Self {
        Self {
            region: (code >> 32) as RegionId,
            partition: (code & u32::MAX as u64) as PartitionId,
        }
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.region, self.partition)
    }
}

impl fmt::Debug for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.region, self.partition)
    }
}

/// Mastership metadata attached to a record and echoed in transactions.
/// The counter increments by one on every successful remaster of the key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterMetadata {
    pub master: RegionId,
    pub counter: u32,
}

impl MasterMetadata {
    pub fn new(master: RegionId, counter: u32) -> Self {
        Self { master, counter }
    }
}

impl Default for MasterMetadata {
    fn default() -> Self {
        Self {
            master: DEFAULT_MASTER_REGION_OF_NEW_KEY,
            counter: 0,
        }
    }
}

/// A stored value with its mastership metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub value: Value,
    pub metadata: MasterMetadata,
}

impl Record {
    pub fn new(value: impl Into<Value>, metadata: MasterMetadata) -> Self {
        Self {
            value: value.into(),
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_code_round_trips() {
        let id = MachineId::new(3, 17);
        assert_eq!(MachineId::from_code(id.code()), id);
    }
}
