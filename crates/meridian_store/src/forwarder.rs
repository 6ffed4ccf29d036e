//! Forwarder: looks up master metadata for each transaction's keys,
//! classifies the transaction as single-home or multi-home, and routes it
//! to the right sequencer or to the multi-home orderer.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use crate::broker::MessageSender;
use crate::config::Configuration;
use crate::message::{Channel, Envelope, Message};
use crate::transaction::{Transaction, TransactionType};
use crate::types::{MachineId, MasterMetadata, TxnId};

pub struct Forwarder {
    config: Arc<Configuration>,
    sender: MessageSender,
    rx: mpsc::UnboundedReceiver<Envelope>,
    /// Transactions whose master metadata is still being collected.
    pending: HashMap<TxnId, Transaction>,
    rng: SmallRng,
}

impl Forwarder {
    pub fn new(
        config: Arc<Configuration>,
        sender: MessageSender,
        rx: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        Self {
            config,
            sender,
            rx,
            pending: HashMap::new(),
            rng: SmallRng::from_entropy(),
        }
    }

    pub async fn run(mut self) {
        while let Some(envelope) = self.rx.recv().await {
            match envelope.message {
                Message::ForwardTxn { txn } => self.handle_new_transaction(txn),
                Message::LookupMasterResult {
                    txn_id,
                    metadata,
                    new_keys,
                } => self.handle_lookup_result(txn_id, metadata, new_keys),
                other => {
                    tracing::warn!(message = ?other, "unexpected message in forwarder");
                }
            }
        }
    }

    fn handle_new_transaction(&mut self, txn: Transaction) {
        // Metadata already attached (by the client or a test) lets the
        // transaction skip the lookup round.
        if txn.keys().all(|key| txn.master_metadata.contains_key(key)) {
            self.forward(txn);
            return;
        }

        let missing: Vec<_> = txn
            .keys()
            .filter(|key| !txn.master_metadata.contains_key(*key))
            .cloned()
            .collect();
        let txn_id = txn.id;
        self.pending.insert(txn_id, txn);

        // Each partition of the local region answers for the keys it owns.
        let local_region = self.config.local_region();
        for machine in self.config.machines_in_region(local_region) {
            self.sender.send(
                machine,
                Channel::Server,
                Message::LookupMaster {
                    txn_id,
                    keys: missing.clone(),
                },
            );
        }
    }

    fn handle_lookup_result(
        &mut self,
        txn_id: TxnId,
        metadata: std::collections::BTreeMap<String, MasterMetadata>,
        new_keys: Vec<String>,
    ) {
        let Some(txn) = self.pending.get_mut(&txn_id) else {
            return;
        };
        for (key, meta) in metadata {
            if txn.read_set.contains_key(&key) || txn.write_set.contains_key(&key) {
                txn.master_metadata.insert(key, meta);
            }
        }
        // Keys nobody has stored yet belong to the default region.
        for key in new_keys {
            if txn.read_set.contains_key(&key) || txn.write_set.contains_key(&key) {
                txn.master_metadata.entry(key).or_default();
            }
        }

        let complete = txn.keys().all(|key| txn.master_metadata.contains_key(key));
        if complete {
            let txn = self.pending.remove(&txn_id).expect("pending txn exists");
            self.forward(txn);
        }
    }

    /// Classify and route. All keys mastered by one region makes the
    /// transaction single-home there; otherwise it is multi-home and goes
    /// through global ordering (or straight to the regions' sequencers when
    /// the orderer is bypassed).
    fn forward(&mut self, mut txn: Transaction) {
        let regions = txn.involved_regions();
        if regions.len() <= 1 {
            txn.txn_type = TransactionType::SingleHome;
            let home = regions.into_iter().next().unwrap_or_default();
            if home == self.config.local_region() {
                tracing::debug!(txn_id = txn.id, home, "forwarding to the local sequencer");
                self.sender
                    .send_local(Channel::Sequencer, Message::ForwardTxn { txn });
            } else {
                let partition = self.rng.gen_range(0..self.config.num_partitions());
                tracing::debug!(
                    txn_id = txn.id,
                    home,
                    partition,
                    "forwarding to the home region's sequencer"
                );
                self.sender.send(
                    MachineId::new(home, partition),
                    Channel::Sequencer,
                    Message::ForwardTxn { txn },
                );
            }
            return;
        }

        txn.txn_type = TransactionType::MultiHome;
        if self.config.bypass_mh_orderer() {
            // Hand each region its lock-only sub-transaction directly; the
            // schedulers reassemble the parent from the slices.
            let leader_partition = self.config.leader_partition_for_multi_home_ordering();
            for region in regions {
                if let Some(lock_only) = txn.lock_only(region) {
                    self.sender.send(
                        MachineId::new(region, leader_partition),
                        Channel::Sequencer,
                        Message::ForwardTxn { txn: lock_only },
                    );
                }
            }
        } else {
            let orderer = MachineId::new(
                self.config.local_region(),
                self.config.leader_partition_for_multi_home_ordering(),
            );
            tracing::debug!(txn_id = txn.id, %orderer, "forwarding to the multi-home orderer");
            self.sender
                .send(orderer, Channel::MultiHomeOrderer, Message::ForwardTxn { txn });
        }
    }
}
