//! Worker: drives a dispatched transaction through its execution phases and
//! exchanges remote reads with the workers of peer partitions.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::broker::MessageSender;
use crate::config::{Configuration, ExecutionType};
use crate::message::{Channel, Message};
use crate::scheduler::commands::execute_key_value;
use crate::storage::MemStorage;
use crate::transaction::{Procedure, Transaction, TransactionStatus};
use crate::types::{Key, MasterMetadata, PartitionId, Record, TxnId, Value};

/// Messages the scheduler routes to a worker.
#[derive(Debug)]
pub enum WorkerRequest {
    Process(Box<Transaction>),
    RemoteRead {
        txn_id: TxnId,
        partition: PartitionId,
        reads: BTreeMap<Key, Value>,
        will_abort: bool,
    },
}

/// Result of a finished transaction, handed back to the scheduler.
#[derive(Debug)]
pub struct WorkerCompletion {
    pub worker: usize,
    pub txn: Box<Transaction>,
    pub involved_partitions: Vec<PartitionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ReadLocalStorage,
    WaitRemoteRead,
    Execute,
    Commit,
    Finish,
}

struct TxnState {
    txn: Box<Transaction>,
    phase: Phase,
    remote_reads_waiting_on: usize,
    involved_partitions: BTreeSet<PartitionId>,
    active_partitions: BTreeSet<PartitionId>,
}

pub struct Worker {
    id: usize,
    config: Arc<Configuration>,
    storage: Arc<MemStorage>,
    sender: MessageSender,
    rx: mpsc::UnboundedReceiver<WorkerRequest>,
    completions: mpsc::UnboundedSender<WorkerCompletion>,
    states: HashMap<TxnId, TxnState>,
}

impl Worker {
    pub fn new(
        id: usize,
        config: Arc<Configuration>,
        storage: Arc<MemStorage>,
        sender: MessageSender,
        rx: mpsc::UnboundedReceiver<WorkerRequest>,
        completions: mpsc::UnboundedSender<WorkerCompletion>,
    ) -> Self {
        Self {
            id,
            config,
            storage,
            sender,
            rx,
            completions,
            states: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        while let Some(request) = self.rx.recv().await {
            let txn_id = match request {
                WorkerRequest::Process(txn) => self.init_transaction(txn),
                WorkerRequest::RemoteRead {
                    txn_id,
                    partition,
                    reads,
                    will_abort,
                } => self.apply_remote_read(txn_id, partition, reads, will_abort),
            };
            if let Some(txn_id) = txn_id {
                self.advance(txn_id);
            }
        }
    }

    fn init_transaction(&mut self, mut txn: Box<Transaction>) -> Option<TxnId> {
        let txn_id = txn.id;
        let involved_partitions = txn.involved_partitions(&self.config);
        let active_partitions = txn.active_partitions(&self.config);

        // Drop the keys other partitions will fill in, so the read phase
        // only touches local storage.
        let local = self.config.local_partition();
        txn.read_set
            .retain(|key, _| self.config.partition_of_key(key) == local);
        txn.write_set
            .retain(|key, _| self.config.partition_of_key(key) == local);

        if self
            .states
            .insert(
                txn_id,
                TxnState {
                    txn,
                    phase: Phase::ReadLocalStorage,
                    remote_reads_waiting_on: 0,
                    involved_partitions,
                    active_partitions,
                },
            )
            .is_some()
        {
            tracing::error!(txn_id, "transaction dispatched to this worker twice");
            std::process::abort();
        }
        tracing::trace!(worker = self.id, txn_id, "initialized transaction state");
        Some(txn_id)
    }

    fn apply_remote_read(
        &mut self,
        txn_id: TxnId,
        partition: PartitionId,
        reads: BTreeMap<Key, Value>,
        will_abort: bool,
    ) -> Option<TxnId> {
        let Some(state) = self.states.get_mut(&txn_id) else {
            tracing::warn!(txn_id, partition, "remote read for unknown transaction");
            return None;
        };
        if will_abort {
            state.txn.status = TransactionStatus::Aborted;
            if state.txn.abort_reason.is_none() {
                state.txn.abort_reason = Some("aborted by a remote partition".to_string());
            }
        } else {
            for (key, value) in reads {
                state.txn.read_set.insert(key, value);
            }
        }
        state.remote_reads_waiting_on = state.remote_reads_waiting_on.saturating_sub(1);
        if state.remote_reads_waiting_on == 0 && state.phase == Phase::WaitRemoteRead {
            state.phase = Phase::Execute;
            tracing::trace!(txn_id, "all remote reads arrived");
        }
        Some(txn_id)
    }

    fn advance(&mut self, txn_id: TxnId) {
        if self.states.get(&txn_id).map(|s| s.phase) == Some(Phase::ReadLocalStorage) {
            self.read_local_storage(txn_id);
        }
        if self.states.get(&txn_id).map(|s| s.phase) == Some(Phase::Execute) {
            self.execute(txn_id);
        }
        if self.states.get(&txn_id).map(|s| s.phase) == Some(Phase::Commit) {
            self.commit(txn_id);
        }
        if self.states.get(&txn_id).map(|s| s.phase) == Some(Phase::Finish) {
            self.finish(txn_id);
        }
    }

    fn read_local_storage(&mut self, txn_id: TxnId) {
        let state = self.states.get_mut(&txn_id).expect("state exists");
        let will_abort = state.txn.status == TransactionStatus::Aborted;

        if !will_abort {
            for (key, value) in state.txn.read_set.iter_mut() {
                if let Some(record) = self.storage.read(key) {
                    *value = record.value;
                }
            }
            for (key, value) in state.txn.write_set.iter_mut() {
                if let Some(record) = self.storage.read(key) {
                    *value = record.value;
                }
            }
        }

        // Ship local reads (or the abort verdict) to the other partitions
        // that apply writes; they are the ones waiting on a full read set.
        let local = self.config.local_partition();
        let local_region = self.config.local_region();
        let reads: BTreeMap<Key, Value> = if will_abort {
            BTreeMap::new()
        } else {
            state.txn.read_set.clone()
        };
        for partition in &state.active_partitions {
            if *partition == local {
                continue;
            }
            self.sender.send(
                crate::types::MachineId::new(local_region, *partition),
                Channel::Scheduler,
                Message::RemoteReadResult {
                    txn_id,
                    partition: local,
                    reads: reads.clone(),
                    will_abort,
                },
            );
        }

        // Only a partition that applies writes waits for the others.
        state.remote_reads_waiting_on = if state.active_partitions.contains(&local) {
            state.involved_partitions.len().saturating_sub(1)
        } else {
            0
        };
        if state.remote_reads_waiting_on == 0 {
            state.phase = Phase::Execute;
        } else {
            tracing::trace!(
                txn_id,
                waiting = state.remote_reads_waiting_on,
                "deferring execution until remote reads arrive"
            );
            state.phase = Phase::WaitRemoteRead;
        }
    }

    fn execute(&mut self, txn_id: TxnId) {
        let state = self.states.get_mut(&txn_id).expect("state exists");
        if state.txn.status == TransactionStatus::Aborted {
            state.phase = Phase::Commit;
            return;
        }
        match (&state.txn.procedure, self.config.execution_type()) {
            (Procedure::Remaster { .. }, _) => {
                state.txn.status = TransactionStatus::Committed;
            }
            (Procedure::KeyValue { .. }, ExecutionType::KeyValue) => {
                execute_key_value(&mut state.txn);
            }
            (Procedure::KeyValue { .. }, ExecutionType::Noop) => {
                state.txn.status = TransactionStatus::Committed;
            }
            (Procedure::KeyValue { .. }, ExecutionType::TpcC) => {
                unreachable!("rejected at configuration load")
            }
        }
        state.phase = Phase::Commit;
    }

    fn commit(&mut self, txn_id: TxnId) {
        let state = self.states.get_mut(&txn_id).expect("state exists");
        if state.txn.status == TransactionStatus::Committed {
            match state.txn.procedure.clone() {
                Procedure::KeyValue { .. } => {
                    for (key, value) in &state.txn.write_set {
                        if !self.config.key_is_in_local_partition(key) {
                            continue;
                        }
                        let metadata = match self.storage.master_metadata(key) {
                            Some(metadata) => metadata,
                            None => state
                                .txn
                                .master_metadata
                                .get(key)
                                .copied()
                                .unwrap_or_default(),
                        };
                        self.storage
                            .write(key.clone(), Record::new(value.clone(), metadata));
                    }
                    for key in &state.txn.delete_set {
                        if self.config.key_is_in_local_partition(key) {
                            self.storage.delete(key);
                        }
                    }
                }
                Procedure::Remaster { new_master } => {
                    let Some(key) = state.txn.write_set.keys().next().cloned() else {
                        tracing::error!(txn_id, "remaster transaction without a write key");
                        return;
                    };
                    if self.config.key_is_in_local_partition(&key) {
                        let declared = state
                            .txn
                            .master_metadata
                            .get(&key)
                            .copied()
                            .unwrap_or_default();
                        let value = self
                            .storage
                            .read(&key)
                            .map(|record| record.value)
                            .unwrap_or_default();
                        self.storage.write(
                            key,
                            Record::new(
                                value,
                                MasterMetadata::new(new_master, declared.counter + 1),
                            ),
                        );
                    }
                }
            }
        }
        state.phase = Phase::Finish;
    }

    fn finish(&mut self, txn_id: TxnId) {
        let state = self.states.remove(&txn_id).expect("state exists");
        tracing::trace!(worker = self.id, txn_id, "finished transaction");
        let _ = self.completions.send(WorkerCompletion {
            worker: self.id,
            txn: state.txn,
            involved_partitions: state.involved_partitions.into_iter().collect(),
        });
    }
}
