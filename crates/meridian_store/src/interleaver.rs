//! Interleaver: merges the ordered batch streams of every region into one
//! deterministic transaction stream for the local scheduler.
//!
//! Three kinds of input meet here: batches replicated by sequencers, batch
//! order announcements, and local Paxos decisions. Output is emitted at the
//! configured `remote:local` ratio, round-robin across remote regions, so
//! the merge is a pure function of the log contents and the ratio.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::broker::MessageSender;
use crate::config::Configuration;
use crate::logs::{BatchLog, LocalLog};
use crate::message::{Channel, Envelope, ForwardBatch, Message};
use crate::transaction::{Batch, Transaction, TransactionType};
use crate::types::{MachineId, RegionId};

pub struct Interleaver {
    config: Arc<Configuration>,
    sender: MessageSender,
    rx: mpsc::UnboundedReceiver<Envelope>,
    /// Order of local batches as decided by the region's Paxos group.
    local_log: LocalLog,
    /// One ordered batch stream per region (the local one included).
    single_home_logs: HashMap<RegionId, BatchLog>,
    /// Multi-home batches, already ordered by the global Paxos group.
    multi_home_log: BatchLog,
    /// Transaction-granular emission buffers, one per region.
    buffers: HashMap<RegionId, VecDeque<Transaction>>,
}

impl Interleaver {
    pub fn new(
        config: Arc<Configuration>,
        sender: MessageSender,
        rx: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        Self {
            config,
            sender,
            rx,
            local_log: LocalLog::new(),
            single_home_logs: HashMap::new(),
            multi_home_log: BatchLog::new(),
            buffers: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        while let Some(envelope) = self.rx.recv().await {
            self.handle_envelope(envelope);
            self.advance_logs();
        }
    }

    fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope.message {
            Message::ForwardBatch(ForwardBatch::Data {
                batch,
                same_origin_position,
            }) => self.handle_batch_data(batch, same_origin_position, envelope.from),
            Message::ForwardBatch(ForwardBatch::Order { batch_id, slot }) => {
                tracing::debug!(batch_id, slot, from = %envelope.from, "batch order received");
                self.single_home_logs
                    .entry(envelope.from.region)
                    .or_default()
                    .add_slot(slot, batch_id);
            }
            Message::LocalQueueOrder { slot, queue_id } => {
                tracing::debug!(slot, queue_id, "local queue order received");
                self.local_log.add_slot(slot, queue_id);
            }
            other => {
                tracing::warn!(message = ?other, "unexpected message in interleaver");
            }
        }
    }

    fn handle_batch_data(&mut self, batch: Batch, same_origin_position: u64, from: MachineId) {
        match batch.transaction_type {
            TransactionType::SingleHome => {
                tracing::debug!(
                    batch_id = batch.id,
                    from = %from,
                    txns = batch.transactions.len(),
                    "single-home batch data received"
                );
                // Batches from the local region feed the local log, which
                // pairs them with the region's Paxos decisions.
                if from.region == self.config.local_region() {
                    self.local_log
                        .add_batch_id(from.partition, same_origin_position, batch.id);
                }
                self.single_home_logs
                    .entry(from.region)
                    .or_default()
                    .add_batch(batch);
            }
            TransactionType::MultiHome => {
                tracing::debug!(
                    batch_id = batch.id,
                    txns = batch.transactions.len(),
                    "multi-home batch data received"
                );
                // Multi-home batch ids were rewritten to their global slot
                // by the orderer, so id and slot coincide.
                self.multi_home_log.add_slot(batch.id, batch.id);
                self.multi_home_log.add_batch(batch);
            }
            TransactionType::LockOnly => {
                tracing::error!(batch_id = batch.id, "batch of lock-only type is invalid");
            }
        }
    }

    fn advance_logs(&mut self) {
        // Local batches whose slot was decided: announce the decision to the
        // same partition everywhere so every region sequences this region's
        // stream identically.
        while let Some((slot, batch_id)) = self.local_log.next() {
            let local_partition = self.config.local_partition();
            for region in 0..self.config.num_regions() {
                self.sender.send(
                    MachineId::new(region, local_partition),
                    Channel::Interleaver,
                    Message::ForwardBatch(ForwardBatch::Order { batch_id, slot }),
                );
            }
        }

        // Move ready batches into the per-region emission buffers.
        let regions: Vec<RegionId> = self.single_home_logs.keys().copied().collect();
        for region in regions {
            let log = self.single_home_logs.get_mut(&region).expect("log exists");
            while let Some((_, batch)) = log.next() {
                let buffer = self.buffers.entry(region).or_default();
                for mut txn in batch.transactions {
                    // Every emitted item carries its home region tag.
                    if txn.home.is_none() {
                        txn.home = Some(region);
                    }
                    buffer.push_back(txn);
                }
            }
        }

        // Multi-home parent records only join sub-transactions in the
        // scheduler; they acquire no locks, so they are emitted as soon as
        // their global order is known.
        while let Some((_, batch)) = self.multi_home_log.next() {
            for txn in batch.transactions {
                self.emit(txn);
            }
        }

        self.emit_at_ratio();
    }

    /// Emit buffered transactions at the configured remote:local ratio.
    /// Remote regions are drained round-robin in region order. A region
    /// with nothing ready forfeits its turn; the ratio shapes the schedule,
    /// it does not block it.
    fn emit_at_ratio(&mut self) {
        let (remote_quota, local_quota) = self.config.remote_to_local_ratio();
        let local_region = self.config.local_region();
        let remote_regions: Vec<RegionId> = (0..self.config.num_regions())
            .filter(|r| *r != local_region)
            .collect();

        loop {
            let mut emitted = false;
            let mut taken = 0;
            'remote: loop {
                let mut any = false;
                for region in &remote_regions {
                    if taken >= remote_quota {
                        break 'remote;
                    }
                    if let Some(txn) = self
                        .buffers
                        .get_mut(region)
                        .and_then(VecDeque::pop_front)
                    {
                        self.emit(txn);
                        emitted = true;
                        any = true;
                        taken += 1;
                    }
                }
                if !any {
                    break;
                }
            }
            for _ in 0..local_quota {
                let Some(txn) = self
                    .buffers
                    .get_mut(&local_region)
                    .and_then(VecDeque::pop_front)
                else {
                    break;
                };
                self.emit(txn);
                emitted = true;
            }
            if !emitted {
                break;
            }
        }
    }

    fn emit(&self, txn: Transaction) {
        tracing::trace!(txn_id = txn.id, txn_type = ?txn.txn_type, "emitting transaction");
        self.sender
            .send_local(Channel::Scheduler, Message::ForwardTxn { txn });
    }
}
