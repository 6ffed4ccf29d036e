//! Transaction and batch model.
//!
//! Key sets use `BTreeMap` so every machine iterates them in the same order;
//! the deterministic lock manager depends on that.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::Configuration;
use crate::types::{BatchId, Key, MachineId, MasterMetadata, PartitionId, RegionId, TxnId, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    SingleHome,
    MultiHome,
    LockOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    NotStarted,
    Committed,
    Aborted,
}

/// What the worker runs once all reads are assembled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Procedure {
    /// A program over the key sets: `GET k`, `SET k v`, `DEL k`,
    /// `COPY src dst`, `ABORT k`, whitespace-separated.
    KeyValue { code: String },
    /// Transfer mastership of the single write-set key to `new_master`.
    Remaster { new_master: RegionId },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxnId,
    pub txn_type: TransactionType,
    /// Key -> current value, filled in during execution.
    pub read_set: BTreeMap<Key, Value>,
    /// Key -> new value, filled in during execution.
    pub write_set: BTreeMap<Key, Value>,
    /// Keys removed at commit (produced by DEL commands).
    pub delete_set: Vec<Key>,
    pub procedure: Procedure,
    /// Mastership each key had when the forwarder classified the txn.
    pub master_metadata: BTreeMap<Key, MasterMetadata>,
    /// Machine whose server answers the client.
    pub coordinating_server: MachineId,
    pub status: TransactionStatus,
    pub abort_reason: Option<String>,
    /// Home region, set on lock-only sub-transactions.
    pub home: Option<RegionId>,
    /// Marks the lock-only generated at the new master region of a
    /// cross-region remaster.
    pub new_master_lock_only: bool,
}

impl Transaction {
    pub fn new(id: TxnId, procedure: Procedure, coordinating_server: MachineId) -> Self {
        Self {
            id,
            txn_type: TransactionType::SingleHome,
            read_set: BTreeMap::new(),
            write_set: BTreeMap::new(),
            delete_set: Vec::new(),
            procedure,
            master_metadata: BTreeMap::new(),
            coordinating_server,
            status: TransactionStatus::NotStarted,
            abort_reason: None,
            home: None,
            new_master_lock_only: false,
        }
    }

    /// All keys the transaction touches, write set last so a key in both
    /// sets is observed with its write intent.
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.read_set.keys().chain(self.write_set.keys())
    }

    pub fn accesses_no_key(&self) -> bool {
        self.read_set.is_empty() && self.write_set.is_empty()
    }

    pub fn is_remaster(&self) -> bool {
        matches!(self.procedure, Procedure::Remaster { .. })
    }

    /// Partitions holding at least one of the transaction's keys.
    pub fn involved_partitions(&self, config: &Configuration) -> BTreeSet<PartitionId> {
        self.keys().map(|k| config.partition_of_key(k)).collect()
    }

    /// Partitions holding at least one write-set key. Only these need the
    /// assembled read set to apply writes.
    pub fn active_partitions(&self, config: &Configuration) -> BTreeSet<PartitionId> {
        self.write_set
            .keys()
            .map(|k| config.partition_of_key(k))
            .collect()
    }

    /// Regions mastering at least one of the transaction's keys, per the
    /// attached metadata. For a remaster txn the new master region is
    /// involved as well.
    pub fn involved_regions(&self) -> BTreeSet<RegionId> {
        let mut regions: BTreeSet<RegionId> =
            self.master_metadata.values().map(|m| m.master).collect();
        if let Procedure::Remaster { new_master } = self.procedure {
            regions.insert(new_master);
        }
        regions
    }

    /// Build the lock-only sub-transaction for `region`, or `None` when the
    /// region masters none of the keys (and is not the target of a
    /// remaster). The lock-only carries the region's slice of the key sets;
    /// the metadata map stays complete so every record of the transaction
    /// names the full key set. A remaster's new-master region instead
    /// receives the full transaction flagged as the new-master lock-only.
    pub fn lock_only(&self, region: RegionId) -> Option<Transaction> {
        if let Procedure::Remaster { new_master } = self.procedure {
            let masters_nothing = !self.master_metadata.values().any(|m| m.master == region);
            if region == new_master && masters_nothing {
                let mut lo = self.clone();
                lo.txn_type = TransactionType::LockOnly;
                lo.home = Some(region);
                lo.new_master_lock_only = true;
                return Some(lo);
            }
        }

        let mut lo = Transaction::new(self.id, self.procedure.clone(), self.coordinating_server);
        lo.txn_type = TransactionType::LockOnly;
        lo.home = Some(region);
        for (key, value) in &self.read_set {
            if self.master_of(key) == Some(region) {
                lo.read_set.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in &self.write_set {
            if self.master_of(key) == Some(region) {
                lo.write_set.insert(key.clone(), value.clone());
            }
        }
        if lo.read_set.is_empty() && lo.write_set.is_empty() {
            return None;
        }
        lo.master_metadata = self.master_metadata.clone();
        Some(lo)
    }

    fn master_of(&self, key: &Key) -> Option<RegionId> {
        self.master_metadata.get(key).map(|m| m.master)
    }
}

/// Merge a completed sub-transaction into the accumulated result held by the
/// coordinating server. Values travel in the sub-txn's key sets; an aborted
/// sub-txn makes the whole transaction aborted.
pub fn merge_transaction(target: &mut Transaction, sub: &Transaction) {
    for (key, value) in &sub.read_set {
        target.read_set.insert(key.clone(), value.clone());
    }
    for (key, value) in &sub.write_set {
        target.write_set.insert(key.clone(), value.clone());
    }
    for key in &sub.delete_set {
        if !target.delete_set.contains(key) {
            target.delete_set.push(key.clone());
        }
    }
    if sub.status == TransactionStatus::Aborted {
        target.status = TransactionStatus::Aborted;
        if target.abort_reason.is_none() {
            target.abort_reason = sub.abort_reason.clone();
        }
    }
}

/// An ordered list of transactions, immutable once emitted by a sequencer
/// or the multi-home orderer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub transaction_type: TransactionType,
    pub transactions: Vec<Transaction>,
}

impl Batch {
    pub fn new(transaction_type: TransactionType) -> Self {
        Self {
            id: 0,
            transaction_type,
            transactions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_configuration;
    use crate::types::MasterMetadata;

    fn txn_with_keys(reads: &[(&str, u32)], writes: &[(&str, u32)]) -> Transaction {
        let mut txn = Transaction::new(
            100,
            Procedure::KeyValue { code: String::new() },
            MachineId::new(0, 0),
        );
        for (key, master) in reads {
            txn.read_set.insert((*key).to_string(), Value::new());
            txn.master_metadata
                .insert((*key).to_string(), MasterMetadata::new(*master, 0));
        }
        for (key, master) in writes {
            txn.write_set.insert((*key).to_string(), Value::new());
            txn.master_metadata
                .insert((*key).to_string(), MasterMetadata::new(*master, 0));
        }
        txn
    }

    #[test]
    fn lock_only_carries_the_home_regions_slice() {
        let txn = txn_with_keys(&[("0-a", 0), ("1-b", 1)], &[("1-c", 1)]);

        let lo0 = txn.lock_only(0).expect("region 0 masters a key");
        assert_eq!(lo0.read_set.len(), 1);
        assert!(lo0.read_set.contains_key("0-a"));
        assert!(lo0.write_set.is_empty());
        assert_eq!(lo0.home, Some(0));
        assert_eq!(lo0.txn_type, TransactionType::LockOnly);

        let lo1 = txn.lock_only(1).expect("region 1 masters keys");
        assert!(lo1.read_set.contains_key("1-b"));
        assert!(!lo1.read_set.contains_key("0-a"));
        assert!(lo1.write_set.contains_key("1-c"));
        // The metadata map stays complete on every record.
        assert_eq!(lo1.master_metadata.len(), 3);

        assert!(txn.lock_only(2).is_none());
    }

    #[test]
    fn remaster_new_master_region_gets_full_flagged_lock_only() {
        let mut txn = txn_with_keys(&[], &[("0-a", 0)]);
        txn.procedure = Procedure::Remaster { new_master: 1 };

        let lo = txn.lock_only(1).expect("new master region participates");
        assert!(lo.new_master_lock_only);
        assert_eq!(lo.home, Some(1));
        assert!(lo.write_set.contains_key("0-a"));

        let old = txn.lock_only(0).expect("old master region participates");
        assert!(!old.new_master_lock_only);
        assert!(old.write_set.contains_key("0-a"));
    }

    #[test]
    fn involved_partitions_follow_the_partitioning() {
        let config = test_configuration(2, 2, MachineId::new(0, 0));
        let txn = txn_with_keys(&[("0-a", 0)], &[("1-b", 0)]);
        let partitions = txn.involved_partitions(&config);
        assert!(!partitions.is_empty());
    }

    #[test]
    fn merge_prefers_abort_status_and_reason() {
        let mut target = txn_with_keys(&[("0-a", 0)], &[]);
        target.status = TransactionStatus::Committed;
        let mut sub = txn_with_keys(&[], &[("1-b", 1)]);
        sub.status = TransactionStatus::Aborted;
        sub.abort_reason = Some("stale master counter".to_string());

        merge_transaction(&mut target, &sub);
        assert_eq!(target.status, TransactionStatus::Aborted);
        assert_eq!(target.abort_reason.as_deref(), Some("stale master counter"));
        assert!(target.write_set.contains_key("1-b"));
    }
}
