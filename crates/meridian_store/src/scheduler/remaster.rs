//! Remaster manager: verifies a transaction's master counters against
//! storage and parks transactions that arrived ahead of the remaster they
//! were forwarded under.
//!
//! One FIFO queue per home region keeps each region's log order intact: a
//! transaction that finds its region's queue non-empty waits behind it
//! unconditionally, even if its own counters already match.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::bail;

use crate::config::Configuration;
use crate::storage::MemStorage;
use crate::transaction::{Transaction, TransactionType};
use crate::types::{Key, MasterMetadata, RegionId, TxnId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyMasterResult {
    Valid,
    Waiting,
    Abort,
}

/// Records whose verdict changed because of a remaster or a release. Each
/// entry names the transaction and the home region whose queue it sat in,
/// which identifies the exact record for transactions with several
/// lock-only sub-transactions in flight.
#[derive(Debug, Default)]
pub struct RemasterOccurredResult {
    pub unblocked: Vec<(TxnId, RegionId)>,
    pub should_abort: Vec<(TxnId, RegionId)>,
}

/// What the manager needs to re-check a parked transaction later.
#[derive(Debug, Clone)]
struct QueuedTxn {
    txn_id: TxnId,
    keys: Vec<(Key, MasterMetadata)>,
}

pub struct RemasterManager {
    config: Arc<Configuration>,
    storage: Arc<MemStorage>,
    blocked_queue: HashMap<RegionId, VecDeque<QueuedTxn>>,
}

impl RemasterManager {
    pub fn new(config: Arc<Configuration>, storage: Arc<MemStorage>) -> Self {
        Self {
            config,
            storage,
            blocked_queue: HashMap::new(),
        }
    }

    /// Check the transaction's declared counters against storage. WAITING
    /// parks the transaction in its home region's queue; the caller must
    /// hold lock acquisition until it is unblocked.
    pub fn verify_master(&mut self, txn: &Transaction) -> anyhow::Result<VerifyMasterResult> {
        // The new-master lock-only of a remaster carries the old mastership;
        // the old-master record performs the authoritative counter check.
        if txn.new_master_lock_only {
            return Ok(VerifyMasterResult::Valid);
        }
        let keys = keys_in_partition(&self.config, txn);
        if keys.is_empty() {
            return Ok(VerifyMasterResult::Valid);
        }
        if txn.master_metadata.is_empty() {
            tracing::warn!(txn_id = txn.id, "master metadata empty; skipping verification");
            return Ok(VerifyMasterResult::Valid);
        }
        let Some(home) = home_of(txn) else {
            return Ok(VerifyMasterResult::Valid);
        };

        // Preserve the region's log order: anything queued ahead means this
        // transaction waits too, regardless of its own counters.
        if self
            .blocked_queue
            .get(&home)
            .is_some_and(|queue| !queue.is_empty())
        {
            // A remaster whose counters line up is the event the queued
            // transactions are waiting for; parking it behind them would
            // wedge both sides.
            if txn.is_remaster() {
                let result = self.check_counters(&keys)?;
                if result != VerifyMasterResult::Waiting {
                    return Ok(result);
                }
            }
            self.push(home, txn.id, keys);
            return Ok(VerifyMasterResult::Waiting);
        }

        let result = self.check_counters(&keys)?;
        if result == VerifyMasterResult::Waiting {
            self.push(home, txn.id, keys);
        }
        Ok(result)
    }

    /// Re-evaluate queue heads referencing `key` after its counter moved.
    pub fn remaster_occurred(
        &mut self,
        key: &Key,
        _new_counter: u32,
    ) -> anyhow::Result<RemasterOccurredResult> {
        let mut result = RemasterOccurredResult::default();
        let regions: Vec<RegionId> = self
            .blocked_queue
            .iter()
            .filter(|(_, queue)| {
                queue
                    .front()
                    .is_some_and(|head| head.keys.iter().any(|(k, _)| k == key))
            })
            .map(|(region, _)| *region)
            .collect();
        for region in regions {
            self.try_to_unblock(region, &mut result)?;
        }
        Ok(result)
    }

    /// Drop a transaction from wherever it is parked and re-evaluate any
    /// queue head this exposes. The released transaction never appears in
    /// the returned result.
    pub fn release_transaction(&mut self, txn_id: TxnId) -> anyhow::Result<RemasterOccurredResult> {
        let mut exposed = Vec::new();
        for (region, queue) in self.blocked_queue.iter_mut() {
            let was_head = queue.front().is_some_and(|head| head.txn_id == txn_id);
            let before = queue.len();
            queue.retain(|entry| entry.txn_id != txn_id);
            if queue.len() != before && (was_head || !queue.is_empty()) {
                exposed.push(*region);
            }
        }
        self.blocked_queue.retain(|_, queue| !queue.is_empty());

        let mut result = RemasterOccurredResult::default();
        for region in exposed {
            self.try_to_unblock(region, &mut result)?;
        }
        Ok(result)
    }

    fn try_to_unblock(
        &mut self,
        region: RegionId,
        result: &mut RemasterOccurredResult,
    ) -> anyhow::Result<()> {
        loop {
            let head_keys = match self.blocked_queue.get(&region).and_then(|q| q.front()) {
                Some(head) => head.keys.clone(),
                None => {
                    self.blocked_queue.remove(&region);
                    return Ok(());
                }
            };
            match self.check_counters(&head_keys)? {
                VerifyMasterResult::Waiting => return Ok(()),
                VerifyMasterResult::Valid => {
                    let head = self.pop(region);
                    result.unblocked.push((head.txn_id, region));
                }
                VerifyMasterResult::Abort => {
                    let head = self.pop(region);
                    result.should_abort.push((head.txn_id, region));
                }
            }
        }
    }

    fn check_counters(&self, keys: &[(Key, MasterMetadata)]) -> anyhow::Result<VerifyMasterResult> {
        for (key, txn_meta) in keys {
            let storage_meta = self.storage.master_metadata(key).unwrap_or_default();
            if txn_meta.counter < storage_meta.counter {
                return Ok(VerifyMasterResult::Abort);
            }
            if txn_meta.counter > storage_meta.counter {
                return Ok(VerifyMasterResult::Waiting);
            }
            if txn_meta.master != storage_meta.master {
                bail!(
                    "masters diverge for key {key:?} at equal counter {}: txn says {}, \
                     storage says {}",
                    txn_meta.counter,
                    txn_meta.master,
                    storage_meta.master
                );
            }
        }
        Ok(VerifyMasterResult::Valid)
    }

    fn push(&mut self, region: RegionId, txn_id: TxnId, keys: Vec<(Key, MasterMetadata)>) {
        self.blocked_queue
            .entry(region)
            .or_default()
            .push_back(QueuedTxn { txn_id, keys });
    }

    fn pop(&mut self, region: RegionId) -> QueuedTxn {
        let queue = self.blocked_queue.get_mut(&region).expect("queue exists");
        let head = queue.pop_front().expect("queue non-empty");
        if queue.is_empty() {
            self.blocked_queue.remove(&region);
        }
        head
    }

    pub fn num_blocked(&self) -> usize {
        self.blocked_queue.values().map(VecDeque::len).sum()
    }
}

/// Home region used to select the verification queue.
fn home_of(txn: &Transaction) -> Option<RegionId> {
    txn.home
        .or_else(|| txn.master_metadata.values().next().map(|m| m.master))
}

/// Keys of the transaction that verify in this partition, with the metadata
/// the transaction was forwarded under. Lock-onlys verify only their home
/// region's keys.
fn keys_in_partition(
    config: &Configuration,
    txn: &Transaction,
) -> Vec<(Key, MasterMetadata)> {
    let mut keys = Vec::new();
    for key in txn.keys() {
        if !config.key_is_in_local_partition(key) {
            continue;
        }
        let Some(meta) = txn.master_metadata.get(key) else {
            continue;
        };
        if txn.txn_type == TransactionType::LockOnly {
            if let Some(home) = txn.home {
                if meta.master != home {
                    continue;
                }
            }
        }
        if keys.iter().any(|(k, _)| k == key) {
            continue;
        }
        keys.push((key.clone(), *meta));
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_configuration;
    use crate::transaction::Procedure;
    use crate::types::{MachineId, Record};

    fn manager() -> RemasterManager {
        let storage = Arc::new(MemStorage::new());
        storage.write(
            "A".to_string(),
            Record::new("valueA", MasterMetadata::new(0, 1)),
        );
        storage.write(
            "B".to_string(),
            Record::new("valueB", MasterMetadata::new(1, 1)),
        );
        RemasterManager::new(
            Arc::new(test_configuration(2, 1, MachineId::new(0, 0))),
            storage,
        )
    }

    fn txn(id: TxnId, keys: &[(&str, u32, u32)]) -> Transaction {
        let mut txn = Transaction::new(
            id,
            Procedure::KeyValue { code: String::new() },
            MachineId::new(0, 0),
        );
        for (key, master, counter) in keys {
            txn.read_set.insert((*key).to_string(), String::new());
            txn.master_metadata
                .insert((*key).to_string(), MasterMetadata::new(*master, *counter));
        }
        txn
    }

    #[test]
    fn matching_counters_are_valid() {
        let mut rm = manager();
        let t = txn(100, &[("A", 0, 1)]);
        assert_eq!(rm.verify_master(&t).unwrap(), VerifyMasterResult::Valid);
        assert_eq!(rm.num_blocked(), 0);
    }

    #[test]
    fn behind_counter_aborts() {
        let mut rm = manager();
        let t = txn(100, &[("A", 0, 0)]);
        assert_eq!(rm.verify_master(&t).unwrap(), VerifyMasterResult::Abort);
        assert_eq!(rm.num_blocked(), 0);
    }

    #[test]
    fn ahead_counter_waits_until_remaster_arrives() {
        let mut rm = manager();
        let t = txn(100, &[("A", 0, 2)]);
        assert_eq!(rm.verify_master(&t).unwrap(), VerifyMasterResult::Waiting);
        assert_eq!(rm.num_blocked(), 1);

        // The remaster lands: storage now carries counter 2.
        rm.storage.write(
            "A".to_string(),
            Record::new("valueA", MasterMetadata::new(0, 2)),
        );
        let result = rm.remaster_occurred(&"A".to_string(), 2).unwrap();
        assert_eq!(result.unblocked, vec![(100, 0)]);
        assert!(result.should_abort.is_empty());
        assert_eq!(rm.num_blocked(), 0);
    }

    #[test]
    fn remaster_past_a_waiter_aborts_it() {
        let mut rm = manager();
        let t = txn(100, &[("A", 0, 2)]);
        assert_eq!(rm.verify_master(&t).unwrap(), VerifyMasterResult::Waiting);

        // Two remasters race past; storage ends at counter 3.
        rm.storage.write(
            "A".to_string(),
            Record::new("valueA", MasterMetadata::new(0, 3)),
        );
        let result = rm.remaster_occurred(&"A".to_string(), 3).unwrap();
        assert!(result.unblocked.is_empty());
        assert_eq!(result.should_abort, vec![(100, 0)]);
    }

    #[test]
    fn later_arrivals_queue_behind_a_waiter_unconditionally() {
        let mut rm = manager();
        let waiting = txn(100, &[("A", 0, 2)]);
        assert_eq!(
            rm.verify_master(&waiting).unwrap(),
            VerifyMasterResult::Waiting
        );

        // This one's counters match storage, but region 0's queue is busy.
        let blocked = txn(200, &[("A", 0, 1)]);
        assert_eq!(
            rm.verify_master(&blocked).unwrap(),
            VerifyMasterResult::Waiting
        );
        assert_eq!(rm.num_blocked(), 2);

        rm.storage.write(
            "A".to_string(),
            Record::new("valueA", MasterMetadata::new(0, 2)),
        );
        let result = rm.remaster_occurred(&"A".to_string(), 2).unwrap();
        // The head unblocks; the second now fails its check (1 < 2).
        assert_eq!(result.unblocked, vec![(100, 0)]);
        assert_eq!(result.should_abort, vec![(200, 0)]);
    }

    #[test]
    fn released_transaction_never_appears_in_results() {
        let mut rm = manager();
        let first = txn(100, &[("A", 0, 2)]);
        let second = txn(200, &[("A", 0, 1)]);
        assert_eq!(
            rm.verify_master(&first).unwrap(),
            VerifyMasterResult::Waiting
        );
        assert_eq!(
            rm.verify_master(&second).unwrap(),
            VerifyMasterResult::Waiting
        );

        let result = rm.release_transaction(100).unwrap();
        assert!(result.unblocked.iter().all(|(id, _)| *id != 100));
        assert!(result.should_abort.iter().all(|(id, _)| *id != 100));
        // The exposed head re-checks: counters match, so it unblocks.
        assert_eq!(result.unblocked, vec![(200, 0)]);
        assert_eq!(rm.num_blocked(), 0);
    }

    #[test]
    fn master_mismatch_at_equal_counter_is_fatal() {
        let mut rm = manager();
        let t = txn(100, &[("A", 1, 1)]);
        assert!(rm.verify_master(&t).is_err());
    }

    #[test]
    fn valid_remaster_is_not_parked_behind_its_waiters() {
        let mut rm = manager();
        let waiting = txn(100, &[("A", 0, 2)]);
        assert_eq!(
            rm.verify_master(&waiting).unwrap(),
            VerifyMasterResult::Waiting
        );

        // The remaster that waiter 100 depends on shows up with matching
        // counters; it must pass through, not queue behind 100.
        let mut remaster = Transaction::new(
            200,
            Procedure::Remaster { new_master: 0 },
            MachineId::new(0, 0),
        );
        remaster.write_set.insert("A".to_string(), String::new());
        remaster
            .master_metadata
            .insert("A".to_string(), MasterMetadata::new(0, 1));
        assert_eq!(
            rm.verify_master(&remaster).unwrap(),
            VerifyMasterResult::Valid
        );
        assert_eq!(rm.num_blocked(), 1);
    }

    #[test]
    fn queues_are_per_home_region() {
        let mut rm = manager();
        let waiting_region0 = txn(100, &[("A", 0, 2)]);
        assert_eq!(
            rm.verify_master(&waiting_region0).unwrap(),
            VerifyMasterResult::Waiting
        );

        // Region 1's queue is empty, so this verifies immediately.
        let region1 = txn(200, &[("B", 1, 1)]);
        assert_eq!(rm.verify_master(&region1).unwrap(), VerifyMasterResult::Valid);
    }
}
