//! Consensus modules: thin wrappers binding a Paxos group to the broker.
//!
//! The local group (one per region, every machine of the region a member)
//! orders the partition ids of single-home batches and feeds the
//! interleaver. The global group (the leader partition machine of every
//! region) orders multi-home batches and feeds the orderer.

use std::sync::Arc;

use tokio::sync::mpsc;

use meridian_paxos::{PaxosGroup, PaxosMessage, PaxosSender};

use crate::broker::MessageSender;
use crate::config::Configuration;
use crate::message::{Channel, Envelope, ForwardBatch, Message};
use crate::types::{MachineId, PartitionId};

/// Outbound adapter: Paxos messages travel on the group's own channel.
#[derive(Clone)]
struct BrokerPaxosSender {
    sender: MessageSender,
    channel: Channel,
}

impl PaxosSender for BrokerPaxosSender {
    fn send(&self, to: u64, msg: PaxosMessage) {
        self.sender
            .send(MachineId::from_code(to), self.channel, Message::Paxos(msg));
    }
}

/// Shared driver for both groups.
struct PaxosModule {
    group: PaxosGroup<BrokerPaxosSender>,
    rx: mpsc::UnboundedReceiver<Envelope>,
    name: &'static str,
}

impl PaxosModule {
    async fn run(mut self) {
        while let Some(envelope) = self.rx.recv().await {
            let Message::Paxos(msg) = envelope.message else {
                tracing::warn!(name = self.name, "non-paxos message on a paxos channel");
                continue;
            };
            if let Err(err) = self.group.handle_message(msg, envelope.from.code()) {
                tracing::error!(name = self.name, error = %err, "consensus integrity violation");
                std::process::abort();
            }
        }
    }
}

/// Build and spawn the local Paxos module for this machine.
pub fn spawn_local_paxos(
    config: Arc<Configuration>,
    sender: MessageSender,
    rx: mpsc::UnboundedReceiver<Envelope>,
) -> tokio::task::JoinHandle<()> {
    let members: Vec<u64> = config
        .local_paxos_members(config.local_region())
        .into_iter()
        .map(|m| m.code())
        .collect();
    let me = config.local_machine().code();
    let commit_sender = sender.clone();
    let group = PaxosGroup::new(
        members,
        me,
        BrokerPaxosSender {
            sender,
            channel: Channel::LocalPaxos,
        },
        Box::new(move |slot, value| {
            commit_sender.send_local(
                Channel::Interleaver,
                Message::LocalQueueOrder {
                    slot,
                    queue_id: value as PartitionId,
                },
            );
        }),
    );
    tokio::spawn(
        PaxosModule {
            group,
            rx,
            name: "local-paxos",
        }
        .run(),
    )
}

/// Build and spawn the global Paxos module; only meaningful on the leader
/// partition of a region.
pub fn spawn_global_paxos(
    config: Arc<Configuration>,
    sender: MessageSender,
    rx: mpsc::UnboundedReceiver<Envelope>,
) -> tokio::task::JoinHandle<()> {
    let members: Vec<u64> = config
        .global_paxos_members()
        .into_iter()
        .map(|m| m.code())
        .collect();
    let me = config.local_machine().code();
    let commit_sender = sender.clone();
    let group = PaxosGroup::new(
        members,
        me,
        BrokerPaxosSender {
            sender,
            channel: Channel::GlobalPaxos,
        },
        Box::new(move |slot, value| {
            commit_sender.send_local(
                Channel::MultiHomeOrderer,
                Message::ForwardBatch(ForwardBatch::Order {
                    batch_id: value,
                    slot,
                }),
            );
        }),
    );
    tokio::spawn(
        PaxosModule {
            group,
            rx,
            name: "global-paxos",
        }
        .run(),
    )
}
