//! Multi-home orderer: batches multi-home transactions, totally orders the
//! batches through the global Paxos group, and hands ordered batches to the
//! local sequencer. Runs on the leader partition of every region.

use std::sync::Arc;

use tokio::sync::mpsc;

use meridian_paxos::PaxosMessage;

use crate::broker::MessageSender;
use crate::config::Configuration;
use crate::logs::BatchLog;
use crate::message::{Channel, Envelope, ForwardBatch, Message};
use crate::transaction::{Batch, Transaction, TransactionType};
use crate::types::{BatchId, MachineId, MAX_NUM_MACHINES};

pub struct MultiHomeOrderer {
    config: Arc<Configuration>,
    sender: MessageSender,
    rx: mpsc::UnboundedReceiver<Envelope>,
    batch: Batch,
    batch_id_counter: u64,
    /// Batches from every region, ordered by the global Paxos group.
    multi_home_batch_log: BatchLog,
}

impl MultiHomeOrderer {
    pub fn new(
        config: Arc<Configuration>,
        sender: MessageSender,
        rx: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        Self {
            config,
            sender,
            rx,
            batch: Batch::new(TransactionType::MultiHome),
            batch_id_counter: 0,
            multi_home_batch_log: BatchLog::new(),
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.sequencer_batch_duration());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                envelope = self.rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    self.handle_envelope(envelope);
                    self.advance_log();
                }
                _ = tick.tick() => {
                    self.seal_batch();
                }
            }
        }
    }

    fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope.message {
            Message::ForwardTxn { txn } => self.add_transaction(txn),
            Message::ForwardBatch(ForwardBatch::Data { batch, .. }) => {
                tracing::debug!(batch_id = batch.id, "multi-home batch data received");
                self.multi_home_batch_log.add_batch(batch);
            }
            Message::ForwardBatch(ForwardBatch::Order { batch_id, slot }) => {
                tracing::debug!(batch_id, slot, "multi-home batch order committed");
                self.multi_home_batch_log.add_slot(slot, batch_id);
            }
            other => {
                tracing::warn!(message = ?other, "unexpected message in multi-home orderer");
            }
        }
    }

    fn add_transaction(&mut self, txn: Transaction) {
        if txn.txn_type != TransactionType::MultiHome {
            tracing::error!(
                txn_id = txn.id,
                txn_type = ?txn.txn_type,
                "orderer only accepts multi-home transactions"
            );
            return;
        }
        self.batch.transactions.push(txn);
    }

    /// Seal the accumulated batch: propose its id for global ordering and
    /// replicate the payload to the orderer of every region.
    fn seal_batch(&mut self) {
        if self.batch.transactions.is_empty() {
            return;
        }
        let batch_id = self.next_batch_id();
        let mut batch = std::mem::replace(&mut self.batch, Batch::new(TransactionType::MultiHome));
        batch.id = batch_id;

        tracing::debug!(
            batch_id,
            txns = batch.transactions.len(),
            "sealed multi-home batch; proposing global order"
        );

        self.sender.send_local(
            Channel::GlobalPaxos,
            Message::Paxos(PaxosMessage::Propose { value: batch_id }),
        );

        let leader_partition = self.config.leader_partition_for_multi_home_ordering();
        for region in 0..self.config.num_regions() {
            self.sender.send(
                MachineId::new(region, leader_partition),
                Channel::MultiHomeOrderer,
                Message::ForwardBatch(ForwardBatch::Data {
                    batch: batch.clone(),
                    same_origin_position: 0,
                }),
            );
        }
    }

    /// Forward globally ordered batches to the local sequencer, rewriting
    /// each batch id to its slot so downstream order checks are trivial.
    fn advance_log(&mut self) {
        while let Some((slot, mut batch)) = self.multi_home_batch_log.next() {
            batch.id = slot;
            self.sender.send_local(
                Channel::Sequencer,
                Message::ForwardBatch(ForwardBatch::Data {
                    batch,
                    same_origin_position: slot,
                }),
            );
        }
    }

    fn next_batch_id(&mut self) -> BatchId {
        self.batch_id_counter += 1;
        self.batch_id_counter * MAX_NUM_MACHINES + self.config.local_machine_number()
    }
}
