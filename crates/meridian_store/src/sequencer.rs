//! Sequencer: accumulates forwarded transactions into a batch, seals the
//! batch every tick, proposes its partition id to the region's Paxos group
//! and replicates the batch bytes everywhere.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use meridian_paxos::PaxosMessage;

use crate::broker::MessageSender;
use crate::config::Configuration;
use crate::message::{Channel, Envelope, ForwardBatch, Message};
use crate::transaction::{Batch, Transaction, TransactionType};
use crate::types::{BatchId, MAX_NUM_MACHINES};

/// A sealed batch whose cross-region replication was deferred by the
/// replication-delay experiment knob.
struct DelayedBatch {
    batch: Batch,
    same_origin_position: u64,
}

pub struct Sequencer {
    config: Arc<Configuration>,
    sender: MessageSender,
    rx: mpsc::UnboundedReceiver<Envelope>,
    batch: Batch,
    batch_id_counter: u64,
    delayed: Vec<DelayedBatch>,
    rng: SmallRng,
}

impl Sequencer {
    pub fn new(
        config: Arc<Configuration>,
        sender: MessageSender,
        rx: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        Self {
            config,
            sender,
            rx,
            batch: Batch::new(TransactionType::SingleHome),
            batch_id_counter: 0,
            delayed: Vec::new(),
            rng: SmallRng::from_entropy(),
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
                }
                _ = tick.tick() => {
                    self.release_delayed_batches();
                    self.seal_batch();
                }
            }
        }
    }

    fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope.message {
            Message::ForwardTxn { txn } => self.put_transaction_into_batch(txn),
            Message::ForwardBatch(ForwardBatch::Data { batch, .. }) => {
                self.process_multi_home_batch(batch);
            }
            other => {
                tracing::warn!(message = ?other, "unexpected message in sequencer");
            }
        }
    }

    fn put_transaction_into_batch(&mut self, txn: Transaction) {
        if !matches!(
            txn.txn_type,
            TransactionType::SingleHome | TransactionType::LockOnly
        ) {
            tracing::error!(
                txn_id = txn.id,
                txn_type = ?txn.txn_type,
                "sequencer batch only accepts single-home and lock-only transactions"
            );
            return;
        }
        self.batch.transactions.push(txn);
    }

    /// Seal and ship the accumulated batch, if any. The batch id is
    /// globally unique by construction; local Paxos orders the partition
    /// id, not the batch id.
    fn seal_batch(&mut self) {
        if self.batch.transactions.is_empty() {
            return;
        }
        let batch_id = self.next_batch_id();
        let same_origin_position = self.batch_id_counter - 1;
        let mut batch = std::mem::replace(&mut self.batch, Batch::new(TransactionType::SingleHome));
        batch.id = batch_id;

        tracing::debug!(
            batch_id,
            txns = batch.transactions.len(),
            "sealed batch; proposing order and replicating"
        );

        self.sender.send_local(
            Channel::LocalPaxos,
            Message::Paxos(PaxosMessage::Propose {
                value: u64::from(self.config.local_partition()),
            }),
        );

        // Cross-region replication may be artificially delayed for
        // experiments; the local region always receives the batch now.
        let delay = self.config.replication_delay();
        let delayed = delay
            .map(|d| d.delay_pct > 0 && self.rng.gen_range(0..100) < d.delay_pct)
            .unwrap_or(false);
        if delayed {
            self.replicate(&batch, same_origin_position, true);
            self.delayed.push(DelayedBatch {
                batch,
                same_origin_position,
            });
        } else {
            self.replicate(&batch, same_origin_position, false);
        }
    }

    /// Ship the batch to every machine, or only to the local region when
    /// the cross-region part is being held back.
    fn replicate(&self, batch: &Batch, same_origin_position: u64, local_region_only: bool) {
        for machine in self.config.all_machines() {
            if local_region_only && machine.region != self.config.local_region() {
                continue;
            }
            self.sender.send(
                machine,
                Channel::Interleaver,
                Message::ForwardBatch(ForwardBatch::Data {
                    batch: batch.clone(),
                    same_origin_position,
                }),
            );
        }
    }

    fn release_delayed_batches(&mut self) {
        let Some(delay) = self.config.replication_delay() else {
            return;
        };
        let tick_ms = self.config.sequencer_batch_duration().as_millis().max(1) as f64;
        let release_probability = (tick_ms / delay.delay_amount_ms.max(1) as f64).min(1.0);
        let mut kept = Vec::new();
        let released: Vec<bool> = (0..self.delayed.len())
            .map(|_| self.rng.gen_bool(release_probability))
            .collect();
        for (delayed, release) in self.delayed.drain(..).zip(released) {
            if release {
                for machine in self.config.all_machines() {
                    if machine.region == self.config.local_region() {
                        continue;
                    }
                    self.sender.send(
                        machine,
                        Channel::Interleaver,
                        Message::ForwardBatch(ForwardBatch::Data {
                            batch: delayed.batch.clone(),
                            same_origin_position: delayed.same_origin_position,
                        }),
                    );
                }
            } else {
                kept.push(delayed);
            }
        }
        self.delayed = kept;
    }

    /// Each multi-home transaction contributes a lock-only sub-transaction
    /// to this region's log; the batch itself is replicated to every
    /// partition of the region so schedulers can join the records.
    fn process_multi_home_batch(&mut self, batch: Batch) {
        if batch.transaction_type != TransactionType::MultiHome {
            tracing::error!(batch_id = batch.id, "expected a multi-home batch");
            return;
        }
        let local_region = self.config.local_region();
        for txn in &batch.transactions {
            if let Some(lock_only) = txn.lock_only(local_region) {
                self.put_transaction_into_batch(lock_only);
            }
        }
        for machine in self.config.machines_in_region(local_region) {
            self.sender.send(
                machine,
                Channel::Interleaver,
                Message::ForwardBatch(ForwardBatch::Data {
                    batch: batch.clone(),
                    same_origin_position: batch.id,
                }),
            );
        }
    }

    fn next_batch_id(&mut self) -> BatchId {
        self.batch_id_counter += 1;
        self.batch_id_counter * MAX_NUM_MACHINES + self.config.local_machine_number()
    }
}
