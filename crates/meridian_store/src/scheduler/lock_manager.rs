//! Deterministic lock manager.
//!
//! Locks are granted strictly in the order requests are presented, which is
//! the order of the interleaved log. Since every replica presents the same
//! sequence, every replica computes the same grants, waits and releases.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::config::Configuration;
use crate::transaction::{Transaction, TransactionType};
use crate::types::{Key, TxnId, LOCK_TABLE_SIZE_LIMIT};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockMode {
    #[default]
    Unlocked,
    Read,
    Write,
}

/// Locking state of one key: current holders plus an ordered waiter queue.
/// `waiters` mirrors the queue for O(1) membership checks.
#[derive(Debug, Default)]
struct LockState {
    mode: LockMode,
    holders: HashSet<TxnId>,
    waiters: HashSet<TxnId>,
    waiter_queue: VecDeque<(TxnId, LockMode)>,
}

impl LockState {
    fn acquire_read(&mut self, txn_id: TxnId) -> bool {
        match self.mode {
            LockMode::Unlocked => {
                self.holders.insert(txn_id);
                self.mode = LockMode::Read;
                true
            }
            LockMode::Read => {
                if self.waiter_queue.is_empty() {
                    self.holders.insert(txn_id);
                    true
                } else {
                    // A write request is already queued; queue behind it to
                    // keep writers from starving.
                    self.waiters.insert(txn_id);
                    self.waiter_queue.push_back((txn_id, LockMode::Read));
                    false
                }
            }
            LockMode::Write => {
                self.waiters.insert(txn_id);
                self.waiter_queue.push_back((txn_id, LockMode::Read));
                false
            }
        }
    }

    fn acquire_write(&mut self, txn_id: TxnId) -> bool {
        match self.mode {
            LockMode::Unlocked => {
                self.holders.insert(txn_id);
                self.mode = LockMode::Write;
                true
            }
            LockMode::Read | LockMode::Write => {
                self.waiters.insert(txn_id);
                self.waiter_queue.push_back((txn_id, LockMode::Write));
                false
            }
        }
    }

    fn is_queued(&self, txn_id: TxnId) -> bool {
        self.holders.contains(&txn_id) || self.waiters.contains(&txn_id)
    }

    /// Remove `txn_id` as holder or waiter; returns the transactions
    /// promoted to holders by this release.
    fn release(&mut self, txn_id: TxnId) -> Vec<TxnId> {
        if !self.holders.contains(&txn_id) {
            self.waiter_queue.retain(|(id, _)| *id != txn_id);
            self.waiters.remove(&txn_id);
            return Vec::new();
        }

        self.holders.remove(&txn_id);
        if !self.holders.is_empty() {
            return Vec::new();
        }
        if self.waiter_queue.is_empty() {
            self.mode = LockMode::Unlocked;
            return Vec::new();
        }

        let mut promoted = Vec::new();
        match self.waiter_queue.front().unwrap().1 {
            LockMode::Read => {
                // The maximal prefix of read waiters acquires together.
                while matches!(self.waiter_queue.front(), Some((_, LockMode::Read))) {
                    let (next, _) = self.waiter_queue.pop_front().unwrap();
                    self.waiters.remove(&next);
                    self.holders.insert(next);
                    promoted.push(next);
                }
                self.mode = LockMode::Read;
            }
            LockMode::Write => {
                let (next, _) = self.waiter_queue.pop_front().unwrap();
                self.waiters.remove(&next);
                self.holders.insert(next);
                promoted.push(next);
                self.mode = LockMode::Write;
            }
            LockMode::Unlocked => unreachable!("unlocked requests are never queued"),
        }
        promoted
    }

    fn mode(&self) -> LockMode {
        self.mode
    }
}

pub struct LockManager {
    config: Arc<Configuration>,
    lock_table: HashMap<Key, LockState>,
    /// Outstanding keys per transaction. Goes negative when lock-only
    /// sub-transactions acquire before their parent registers.
    num_locks_waited: HashMap<TxnId, i64>,
}

impl LockManager {
    pub fn new(config: Arc<Configuration>) -> Self {
        Self {
            config,
            lock_table: HashMap::new(),
            num_locks_waited: HashMap::new(),
        }
    }

    /// Record how many locks the transaction needs in this partition.
    /// Returns true only when the count lands on zero, which happens when
    /// all of the transaction's lock-onlys already acquired their locks.
    pub fn register_txn(&mut self, txn: &Transaction) -> bool {
        let keys = self.extract_keys(txn);
        if keys.is_empty() {
            return false;
        }
        let entry = self.num_locks_waited.entry(txn.id).or_insert(0);
        *entry += keys.len() as i64;
        if *entry == 0 {
            self.num_locks_waited.remove(&txn.id);
            return true;
        }
        false
    }

    /// Request every lock of the transaction that is not already queued.
    /// Returns true when the transaction holds all locks it has asked for.
    pub fn acquire_locks(&mut self, txn: &Transaction) -> bool {
        let keys = self.extract_keys(txn);
        if keys.is_empty() {
            return false;
        }
        for (key, mode) in keys {
            let state = self.lock_table.entry(key).or_default();
            if state.is_queued(txn.id) {
                continue;
            }
            let acquired = match mode {
                LockMode::Read => state.acquire_read(txn.id),
                LockMode::Write => state.acquire_write(txn.id),
                LockMode::Unlocked => unreachable!("extraction never yields unlocked"),
            };
            if acquired {
                *self.num_locks_waited.entry(txn.id).or_insert(0) -= 1;
            }
        }
        if self.num_locks_waited.get(&txn.id).copied().unwrap_or(0) == 0 {
            self.num_locks_waited.remove(&txn.id);
            return true;
        }
        false
    }

    /// Registration and acquisition in one step. Safe to interleave with
    /// per-record calls for the same transaction in any order.
    pub fn register_txn_and_acquire_locks(&mut self, txn: &Transaction) -> bool {
        self.register_txn(txn);
        self.acquire_locks(txn)
    }

    /// True when the transaction currently waits on no lock.
    pub fn all_locks_held(&self, txn_id: TxnId) -> bool {
        self.num_locks_waited.get(&txn_id).copied().unwrap_or(0) == 0
    }

    /// Release every lock the transaction holds or waits for. Returns the
    /// transactions that became ready thanks to this release, in promotion
    /// order.
    pub fn release_locks(&mut self, txn: &Transaction) -> Vec<TxnId> {
        let mut ready = Vec::new();
        let mut seen = HashSet::new();
        for (key, _) in self.extract_keys(txn) {
            let Some(state) = self.lock_table.get_mut(&key) else {
                continue;
            };
            for holder in state.release(txn.id) {
                let count = self.num_locks_waited.entry(holder).or_insert(0);
                *count -= 1;
                if *count == 0 {
                    self.num_locks_waited.remove(&holder);
                    if seen.insert(holder) {
                        ready.push(holder);
                    }
                }
            }
            // Keep the table from growing without bound.
            if state.mode() == LockMode::Unlocked && self.lock_table.len() > LOCK_TABLE_SIZE_LIMIT
            {
                self.lock_table.remove(&key);
            }
        }
        self.num_locks_waited.remove(&txn.id);
        ready
    }

    /// Keys of the transaction that lock in this partition, with their lock
    /// mode. A key in both read and write set locks as WRITE. Lock-only
    /// sub-transactions are scoped to their home region's keys, except the
    /// new-master lock-only of a remaster which locks its write key
    /// regardless of current mastership.
    fn extract_keys(&self, txn: &Transaction) -> Vec<(Key, LockMode)> {
        let mut keys = Vec::new();
        if txn.txn_type == TransactionType::LockOnly && txn.new_master_lock_only {
            for key in txn.write_set.keys() {
                if self.config.key_is_in_local_partition(key) {
                    keys.push((key.clone(), LockMode::Write));
                }
            }
            return keys;
        }
        let home_filter = |txn: &Transaction, key: &Key| -> bool {
            if txn.txn_type != TransactionType::LockOnly {
                return true;
            }
            match (txn.home, txn.master_metadata.get(key)) {
                (Some(home), Some(meta)) => meta.master == home,
                _ => true,
            }
        };
        for key in txn.read_set.keys() {
            if self.config.key_is_in_local_partition(key)
                && !txn.write_set.contains_key(key)
                && home_filter(txn, key)
            {
                keys.push((key.clone(), LockMode::Read));
            }
        }
        for key in txn.write_set.keys() {
            if self.config.key_is_in_local_partition(key) && home_filter(txn, key) {
                keys.push((key.clone(), LockMode::Write));
            }
        }
        keys
    }

    pub fn stats(&self, level: u32) -> serde_json::Value {
        let num_locked_keys = self
            .lock_table
            .values()
            .filter(|state| state.mode() != LockMode::Unlocked)
            .count();
        let mut stats = serde_json::json!({
            "num_locked_keys": num_locked_keys,
            "num_txns_waiting_for_lock": self.num_locks_waited.len(),
        });
        if level >= 1 {
            stats["num_locks_waited_per_txn"] = self
                .num_locks_waited
                .iter()
                .map(|(txn_id, count)| serde_json::json!([txn_id, count]))
                .collect();
            stats["lock_table"] = self
                .lock_table
                .iter()
                .filter(|(_, state)| state.mode() != LockMode::Unlocked)
                .map(|(key, state)| {
                    serde_json::json!({
                        "key": key,
                        "mode": format!("{:?}", state.mode()),
                        "holders": state.holders.iter().copied().collect::<Vec<_>>(),
                        "waiters": state
                            .waiter_queue
                            .iter()
                            .map(|(id, mode)| serde_json::json!([id, format!("{mode:?}")]))
                            .collect::<Vec<_>>(),
                    })
                })
                .collect();
        }
        stats
    }
}
