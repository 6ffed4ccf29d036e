//! Scheduler: consumes the interleaved transaction stream, resolves
//! remaster consistency and lock conflicts deterministically, and drives a
//! pool of workers.
//!
//! Because every replica's scheduler sees the same interleaved sequence and
//! both the remaster manager and the lock manager are order-driven, every
//! replica reaches identical commit and abort decisions.

pub mod commands;
pub mod lock_manager;
pub mod remaster;
pub mod worker;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::broker::MessageSender;
use crate::config::Configuration;
use crate::message::{Channel, Envelope, Message};
use crate::storage::MemStorage;
use crate::transaction::{Procedure, Transaction, TransactionStatus, TransactionType};
use crate::types::{Key, PartitionId, RegionId, TxnId, Value};

use lock_manager::LockManager;
use remaster::{RemasterManager, VerifyMasterResult};
use worker::{Worker, WorkerCompletion, WorkerRequest};

const ABORT_REASON_STALE_COUNTER: &str = "stale master counter";

/// Per-transaction assembly state. A multi-home transaction is complete
/// once its parent record and one lock-only per involved region have all
/// arrived; a single-home transaction is complete on arrival.
#[derive(Default)]
struct TxnHolder {
    txn: Option<Box<Transaction>>,
    expectations_known: bool,
    expected_lock_onlys: usize,
    arrived_lock_onlys: usize,
    parent_expected: bool,
    parent_arrived: bool,
    /// Records that must pass through the lock manager before dispatch.
    lock_records_expected: usize,
    lock_records_submitted: usize,
    /// Records parked in the remaster manager, by home region.
    parked: HashMap<RegionId, Transaction>,
    aborting: bool,
    abort_reason: Option<String>,
    enqueued: bool,
    dispatched: bool,
    done: bool,
    worker: Option<usize>,
    early_remote_reads: Vec<(PartitionId, BTreeMap<Key, Value>, bool)>,
}

impl TxnHolder {
    fn join_complete(&self) -> bool {
        self.expectations_known
            && self.arrived_lock_onlys >= self.expected_lock_onlys
            && (!self.parent_expected || self.parent_arrived)
    }

    fn removable(&self) -> bool {
        self.done && self.join_complete()
    }
}

pub struct Scheduler {
    config: Arc<Configuration>,
    storage: Arc<MemStorage>,
    sender: MessageSender,
    rx: mpsc::UnboundedReceiver<Envelope>,
    lock_manager: LockManager,
    remaster_manager: RemasterManager,
    txns: HashMap<TxnId, TxnHolder>,
    ready_txns: VecDeque<TxnId>,
    ready_workers: VecDeque<usize>,
    worker_txs: Vec<mpsc::UnboundedSender<WorkerRequest>>,
    completion_rx: mpsc::UnboundedReceiver<WorkerCompletion>,
}

impl Scheduler {
    pub fn new(
        config: Arc<Configuration>,
        storage: Arc<MemStorage>,
        sender: MessageSender,
        rx: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let mut worker_txs = Vec::new();
        let mut ready_workers = VecDeque::new();
        for id in 0..config.num_workers() {
            let (tx, worker_rx) = mpsc::unbounded_channel();
            worker_txs.push(tx);
            ready_workers.push_back(id);
            tokio::spawn(
                Worker::new(
                    id,
                    config.clone(),
                    storage.clone(),
                    sender.clone(),
                    worker_rx,
                    completion_tx.clone(),
                )
                .run(),
            );
        }
        Self {
            lock_manager: LockManager::new(config.clone()),
            remaster_manager: RemasterManager::new(config.clone(), storage.clone()),
            config,
            storage,
            sender,
            rx,
            txns: HashMap::new(),
            ready_txns: VecDeque::new(),
            ready_workers,
            worker_txs,
            completion_rx,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                envelope = self.rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    if let Err(err) = self.handle_envelope(envelope) {
                        tracing::error!(error = %err, "scheduler integrity violation");
                        std::process::abort();
                    }
                }
                completion = self.completion_rx.recv() => {
                    let Some(completion) = completion else { break };
                    if let Err(err) = self.handle_completion(completion) {
                        tracing::error!(error = %err, "scheduler integrity violation");
                        std::process::abort();
                    }
                }
            }
        }
    }

    fn handle_envelope(&mut self, envelope: Envelope) -> anyhow::Result<()> {
        match envelope.message {
            Message::ForwardTxn { txn } => self.handle_transaction(txn)?,
            Message::RemoteReadResult {
                txn_id,
                partition,
                reads,
                will_abort,
            } => self.handle_remote_read(txn_id, partition, reads, will_abort),
            Message::StatsRequest { id, level } => self.handle_stats(id, level),
            other => {
                tracing::warn!(message = ?other, "unexpected message in scheduler");
            }
        }
        Ok(())
    }

    /// One record from the interleaved stream: a single-home transaction, a
    /// multi-home parent record, or a lock-only sub-transaction.
    fn handle_transaction(&mut self, txn: Transaction) -> anyhow::Result<()> {
        if !self.partition_involved(&txn) {
            return Ok(());
        }
        match txn.txn_type {
            TransactionType::SingleHome => self.handle_single_home(txn),
            TransactionType::MultiHome => self.handle_multi_home(txn),
            TransactionType::LockOnly => self.handle_lock_only(txn),
        }
    }

    /// The metadata key set names every key of the parent transaction, so
    /// involvement is decidable from any record.
    fn partition_involved(&self, txn: &Transaction) -> bool {
        let keys_from_metadata = !txn.master_metadata.is_empty();
        if keys_from_metadata {
            txn.master_metadata
                .keys()
                .any(|key| self.config.key_is_in_local_partition(key))
        } else {
            txn.keys()
                .any(|key| self.config.key_is_in_local_partition(key))
        }
    }

    fn handle_single_home(&mut self, txn: Transaction) -> anyhow::Result<()> {
        let txn_id = txn.id;
        let holder = self.txns.entry(txn_id).or_default();
        if holder.done {
            tracing::warn!(txn_id, "single-home record for a finished transaction");
            return Ok(());
        }
        holder.expectations_known = true;
        holder.parent_expected = true;
        holder.parent_arrived = true;
        holder.expected_lock_onlys = 0;
        holder.lock_records_expected = 1;
        holder.txn = Some(Box::new(txn.clone()));

        self.verify_and_submit(txn_id, txn)?;
        self.maybe_ready(txn_id);
        self.maybe_dispatch_next();
        Ok(())
    }

    fn handle_multi_home(&mut self, txn: Transaction) -> anyhow::Result<()> {
        let txn_id = txn.id;
        let expected = txn.involved_regions().len();
        let parent_expected = !self.config.bypass_mh_orderer();
        let holder = self.txns.entry(txn_id).or_default();
        if holder.done {
            holder.parent_arrived = true;
            self.maybe_remove(txn_id);
            return Ok(());
        }
        if !holder.expectations_known {
            holder.expectations_known = true;
            holder.expected_lock_onlys = expected;
            holder.parent_expected = parent_expected;
            holder.lock_records_expected = expected + usize::from(parent_expected);
        }
        holder.parent_arrived = true;
        holder.txn = Some(Box::new(txn.clone()));

        // The parent registers the full local key set; its lock-onlys
        // perform the acquisitions.
        self.lock_manager.register_txn(&txn);
        let holder = self.txns.get_mut(&txn_id).expect("holder exists");
        holder.lock_records_submitted += 1;

        self.maybe_ready(txn_id);
        self.maybe_dispatch_next();
        Ok(())
    }

    fn handle_lock_only(&mut self, txn: Transaction) -> anyhow::Result<()> {
        let txn_id = txn.id;
        let expected = txn.involved_regions().len();
        let parent_expected = !self.config.bypass_mh_orderer();
        let holder = self.txns.entry(txn_id).or_default();
        holder.arrived_lock_onlys += 1;
        if holder.done {
            self.maybe_remove(txn_id);
            return Ok(());
        }
        if !holder.expectations_known {
            holder.expectations_known = true;
            holder.expected_lock_onlys = expected;
            holder.parent_expected = parent_expected;
            holder.lock_records_expected = expected + usize::from(parent_expected);
        }
        // Without the global orderer there is no parent record; the parent
        // content is assembled from the union of the lock-only slices.
        if !holder.parent_expected {
            match holder.txn.as_mut() {
                Some(parent) => {
                    for (key, value) in &txn.read_set {
                        parent.read_set.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                    for (key, value) in &txn.write_set {
                        parent.write_set.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                    for (key, meta) in &txn.master_metadata {
                        parent.master_metadata.entry(key.clone()).or_insert(*meta);
                    }
                }
                None => {
                    let mut parent = txn.clone();
                    parent.txn_type = TransactionType::MultiHome;
                    parent.home = None;
                    parent.new_master_lock_only = false;
                    holder.txn = Some(Box::new(parent));
                }
            }
        }

        self.verify_and_submit(txn_id, txn)?;
        self.maybe_ready(txn_id);
        self.maybe_dispatch_next();
        Ok(())
    }

    /// Run a record through remaster verification and, unless it has to
    /// wait, through the lock manager.
    fn verify_and_submit(&mut self, txn_id: TxnId, record: Transaction) -> anyhow::Result<()> {
        // The verdict is already abort: further verification could park the
        // record forever, so it goes straight to the lock manager and the
        // worker path reports the abort.
        if self.txns.get(&txn_id).is_some_and(|h| h.aborting) {
            self.submit_lock_record(txn_id, &record);
            return Ok(());
        }
        match self.remaster_manager.verify_master(&record)? {
            VerifyMasterResult::Valid => {
                self.submit_lock_record(txn_id, &record);
            }
            VerifyMasterResult::Waiting => {
                let home = record.home.or_else(|| {
                    record.master_metadata.values().next().map(|m| m.master)
                });
                if let Some(home) = home {
                    let holder = self.txns.entry(txn_id).or_default();
                    holder.parked.insert(home, record);
                }
            }
            VerifyMasterResult::Abort => {
                self.start_abort(txn_id, Some(record), ABORT_REASON_STALE_COUNTER)?;
            }
        }
        Ok(())
    }

    /// Present a record to the lock manager. Which call is made depends on
    /// the record's role: parents only register, lock-onlys acquire (and
    /// also register when no parent record will come), single-home
    /// transactions do both.
    fn submit_lock_record(&mut self, txn_id: TxnId, record: &Transaction) {
        match record.txn_type {
            TransactionType::SingleHome => {
                self.lock_manager.register_txn_and_acquire_locks(record);
            }
            TransactionType::LockOnly => {
                let parent_expected = self
                    .txns
                    .get(&txn_id)
                    .map(|h| h.parent_expected)
                    .unwrap_or(true);
                // The new-master lock-only shares its key with the old
                // master's lock-only, which already registered it; letting
                // both register would leave the count permanently positive.
                if parent_expected || record.new_master_lock_only {
                    self.lock_manager.acquire_locks(record);
                } else {
                    self.lock_manager.register_txn_and_acquire_locks(record);
                }
            }
            TransactionType::MultiHome => {
                self.lock_manager.register_txn(record);
            }
        }
        if let Some(holder) = self.txns.get_mut(&txn_id) {
            holder.lock_records_submitted += 1;
        }
    }

    /// Deterministic abort decided before execution (remaster check). For a
    /// transaction confined to this partition the completion is produced
    /// immediately; otherwise the record still flows through locks and a
    /// worker so the other partitions learn the verdict via the remote-read
    /// exchange.
    fn start_abort(
        &mut self,
        txn_id: TxnId,
        record: Option<Transaction>,
        reason: &str,
    ) -> anyhow::Result<()> {
        let holder = self.txns.entry(txn_id).or_default();
        holder.aborting = true;
        if holder.abort_reason.is_none() {
            holder.abort_reason = Some(reason.to_string());
        }

        // Only a single-home transaction confined to this partition can be
        // answered without the worker path: nothing else will ever arrive
        // for it. Multi-home transactions always take the worker path so
        // their remaining records find a live holder.
        let single_partition = record
            .as_ref()
            .map(|txn| {
                if txn.txn_type != TransactionType::SingleHome {
                    return false;
                }
                let partitions: BTreeSet<PartitionId> = if txn.master_metadata.is_empty() {
                    txn.involved_partitions(&self.config)
                } else {
                    txn.master_metadata
                        .keys()
                        .map(|k| self.config.partition_of_key(k))
                        .collect()
                };
                partitions.len() == 1
            })
            .unwrap_or(false);

        if single_partition && !holder.dispatched {
            // No peer partition to notify: answer the coordinating server
            // directly without acquiring locks.
            let mut txn = record
                .map(Box::new)
                .or_else(|| holder.txn.clone())
                .expect("abort path has a record");
            txn.status = TransactionStatus::Aborted;
            txn.abort_reason = Some(reason.to_string());
            let involved: Vec<PartitionId> =
                vec![self.config.local_partition()];
            let coordinator = txn.coordinating_server;
            self.sender.send(
                coordinator,
                Channel::Server,
                Message::CompletedSubtransaction {
                    txn,
                    partition: self.config.local_partition(),
                    involved_partitions: involved,
                },
            );
            // Drop every trace of the transaction.
            let holder = self.txns.remove(&txn_id).expect("holder exists");
            if let Some(full) = holder.txn.as_deref() {
                self.lock_manager.release_locks(full);
            }
            let released = self.remaster_manager.release_transaction(txn_id)?;
            self.apply_remaster_result(released)?;
            return Ok(());
        }

        // Locks are still acquired and released normally; the worker skips
        // execution and broadcasts the abort to peer partitions.
        if let Some(record) = record {
            self.submit_lock_record(txn_id, &record);
        }
        // Records parked behind a pending remaster would never progress now;
        // move them into the lock manager so the transaction can dispatch
        // and finish as an abort.
        let parked: Vec<Transaction> = self
            .txns
            .get_mut(&txn_id)
            .map(|holder| holder.parked.drain().map(|(_, r)| r).collect())
            .unwrap_or_default();
        for parked_record in parked {
            self.submit_lock_record(txn_id, &parked_record);
        }
        let released = self.remaster_manager.release_transaction(txn_id)?;
        self.apply_remaster_result(released)?;
        Ok(())
    }

    fn handle_remote_read(
        &mut self,
        txn_id: TxnId,
        partition: PartitionId,
        reads: BTreeMap<Key, Value>,
        will_abort: bool,
    ) {
        let holder = self.txns.entry(txn_id).or_default();
        if holder.done {
            return;
        }
        match holder.worker {
            Some(worker) if holder.dispatched => {
                let _ = self.worker_txs[worker].send(WorkerRequest::RemoteRead {
                    txn_id,
                    partition,
                    reads,
                    will_abort,
                });
            }
            _ => {
                // Remote reads may outrun the transaction record; replay
                // them once the transaction is dispatched.
                tracing::trace!(txn_id, partition, "buffering early remote read");
                holder.early_remote_reads.push((partition, reads, will_abort));
            }
        }
    }

    fn maybe_ready(&mut self, txn_id: TxnId) {
        let Some(holder) = self.txns.get_mut(&txn_id) else {
            return;
        };
        if holder.enqueued || holder.dispatched || holder.done {
            return;
        }
        if !holder.join_complete() || !holder.parked.is_empty() {
            return;
        }
        if holder.lock_records_submitted < holder.lock_records_expected {
            return;
        }
        if !self.lock_manager.all_locks_held(txn_id) {
            return;
        }
        holder.enqueued = true;
        tracing::trace!(txn_id, "transaction ready for dispatch");
        self.ready_txns.push_back(txn_id);
    }

    fn maybe_dispatch_next(&mut self) {
        while !self.ready_txns.is_empty() && !self.ready_workers.is_empty() {
            let txn_id = self.ready_txns.pop_front().unwrap();
            let Some(holder) = self.txns.get_mut(&txn_id) else {
                continue;
            };
            let worker = self.ready_workers.pop_front().unwrap();
            holder.dispatched = true;
            holder.worker = Some(worker);

            let mut txn = holder.txn.clone().expect("dispatchable txn has content");
            if holder.aborting {
                txn.status = TransactionStatus::Aborted;
                if txn.abort_reason.is_none() {
                    txn.abort_reason = holder.abort_reason.clone();
                }
            }
            tracing::trace!(txn_id, worker, "dispatching transaction");
            let _ = self.worker_txs[worker].send(WorkerRequest::Process(txn));
            for (partition, reads, will_abort) in holder.early_remote_reads.drain(..) {
                let _ = self.worker_txs[worker].send(WorkerRequest::RemoteRead {
                    txn_id,
                    partition,
                    reads,
                    will_abort,
                });
            }
        }
    }

    fn handle_completion(&mut self, completion: WorkerCompletion) -> anyhow::Result<()> {
        self.ready_workers.push_back(completion.worker);
        let txn_id = completion.txn.id;

        let release_txn = self
            .txns
            .get(&txn_id)
            .and_then(|holder| holder.txn.clone())
            .expect("completed transaction has a holder");
        let newly_ready = self.lock_manager.release_locks(&release_txn);
        for ready_id in newly_ready {
            self.maybe_ready(ready_id);
        }

        if let Some(holder) = self.txns.get_mut(&txn_id) {
            holder.done = true;
            holder.worker = None;
        }

        // A committed remaster moves the key's counter forward; transactions
        // parked on that counter can now be re-evaluated.
        if completion.txn.status == TransactionStatus::Committed {
            if let Procedure::Remaster { .. } = completion.txn.procedure {
                if let Some(key) = completion.txn.write_set.keys().next().cloned() {
                    if self.config.key_is_in_local_partition(&key) {
                        let new_counter = self
                            .storage
                            .master_metadata(&key)
                            .map(|meta| meta.counter)
                            .unwrap_or_default();
                        let result = self.remaster_manager.remaster_occurred(&key, new_counter)?;
                        self.apply_remaster_result(result)?;
                    }
                }
            }
        }

        // Answer the coordinating server with this partition's slice.
        if completion
            .involved_partitions
            .contains(&self.config.local_partition())
        {
            let coordinator = completion.txn.coordinating_server;
            self.sender.send(
                coordinator,
                Channel::Server,
                Message::CompletedSubtransaction {
                    txn: completion.txn,
                    partition: self.config.local_partition(),
                    involved_partitions: completion.involved_partitions,
                },
            );
        }

        self.maybe_remove(txn_id);
        self.maybe_dispatch_next();
        Ok(())
    }

    fn apply_remaster_result(
        &mut self,
        result: remaster::RemasterOccurredResult,
    ) -> anyhow::Result<()> {
        for (txn_id, region) in result.unblocked {
            let record = self
                .txns
                .get_mut(&txn_id)
                .and_then(|holder| holder.parked.remove(&region));
            if let Some(record) = record {
                self.submit_lock_record(txn_id, &record);
                self.maybe_ready(txn_id);
            }
        }
        for (txn_id, region) in result.should_abort {
            let record = self
                .txns
                .get_mut(&txn_id)
                .and_then(|holder| holder.parked.remove(&region));
            self.start_abort(txn_id, record, ABORT_REASON_STALE_COUNTER)?;
            self.maybe_ready(txn_id);
        }
        self.maybe_dispatch_next();
        Ok(())
    }

    fn maybe_remove(&mut self, txn_id: TxnId) {
        if self
            .txns
            .get(&txn_id)
            .is_some_and(TxnHolder::removable)
        {
            self.txns.remove(&txn_id);
        }
    }

    fn handle_stats(&mut self, id: u64, level: u32) {
        let mut stats = serde_json::json!({
            "num_ready_workers": self.ready_workers.len(),
            "num_ready_txns": self.ready_txns.len(),
            "num_all_txns": self.txns.len(),
            "num_remaster_blocked_txns": self.remaster_manager.num_blocked(),
        });
        if level >= 1 {
            stats["all_txns"] = self.txns.keys().copied().collect::<Vec<_>>().into();
        }
        if let Some(lock_stats) = stats.as_object_mut() {
            lock_stats.insert("lock_manager".to_string(), self.lock_manager.stats(level));
        }
        self.sender.send_local(
            Channel::Server,
            Message::StatsResponse {
                id,
                json: serde_json::json!({ "scheduler": stats }).to_string(),
            },
        );
    }
}
