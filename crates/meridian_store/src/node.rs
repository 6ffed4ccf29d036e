//! Node assembly: builds the broker, wires every module, and exposes a
//! client handle. Used by the `meridian-node` binary and by tests that run
//! whole clusters inside one process.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, oneshot};

use crate::api::{ApiRequest, ApiResponse, StatsModule};
use crate::broker::{unregister_local_endpoint, Broker, MessageSender};
use crate::config::Configuration;
use crate::consensus;
use crate::forwarder::Forwarder;
use crate::interleaver::Interleaver;
use crate::message::Channel;
use crate::orderer::MultiHomeOrderer;
use crate::scheduler::Scheduler;
use crate::sequencer::Sequencer;
use crate::server::{serve_clients, ClientCommand, Server};
use crate::storage::MemStorage;
use crate::transaction::Transaction;

/// Handle for submitting client requests to a node in-process.
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<ClientCommand>,
    stream_ids: Arc<std::sync::atomic::AtomicU64>,
}

impl ClientHandle {
    /// Submit a transaction and wait for its completion.
    pub async fn submit(&self, txn: Transaction) -> anyhow::Result<Transaction> {
        let stream_id = self
            .stream_ids
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ClientCommand {
                request: ApiRequest::Txn { stream_id, txn },
                reply: reply_tx,
            })
            .ok()
            .context("node server is gone")?;
        match reply_rx.await.context("node server dropped the request")? {
            ApiResponse::Txn { txn, .. } => Ok(*txn),
            ApiResponse::Stats { .. } => anyhow::bail!("unexpected stats response"),
        }
    }

    /// Fetch a stats snapshot from the server or the scheduler.
    pub async fn stats(&self, module: StatsModule, level: u32) -> anyhow::Result<String> {
        let stream_id = self
            .stream_ids
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ClientCommand {
                request: ApiRequest::Stats {
                    stream_id,
                    module,
                    level,
                },
                reply: reply_tx,
            })
            .ok()
            .context("node server is gone")?;
        match reply_rx.await.context("node server dropped the request")? {
            ApiResponse::Stats { json, .. } => Ok(json),
            ApiResponse::Txn { .. } => anyhow::bail!("unexpected txn response"),
        }
    }
}

/// One running machine of the cluster.
pub struct Node {
    config: Arc<Configuration>,
    storage: Arc<MemStorage>,
    client: ClientHandle,
    sender: MessageSender,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Node {
    /// Bring up every module of this machine and synchronize with the rest
    /// of the cluster. Returns once the broker handshake completed.
    pub async fn start(config: Arc<Configuration>) -> anyhow::Result<Node> {
        Self::start_with_storage(config, Arc::new(MemStorage::new())).await
    }

    /// Like [`start`](Self::start) but with pre-seeded storage, which tests
    /// use to install keys with chosen mastership.
    pub async fn start_with_storage(
        config: Arc<Configuration>,
        storage: Arc<MemStorage>,
    ) -> anyhow::Result<Node> {
        let mut broker = Broker::new(config.clone());
        let server_rx = broker.add_channel(Channel::Server);
        let forwarder_rx = broker.add_channel(Channel::Forwarder);
        let sequencer_rx = broker.add_channel(Channel::Sequencer);
        let interleaver_rx = broker.add_channel(Channel::Interleaver);
        let scheduler_rx = broker.add_channel(Channel::Scheduler);
        let local_paxos_rx = broker.add_channel(Channel::LocalPaxos);

        let runs_global_ordering = config.local_partition()
            == config.leader_partition_for_multi_home_ordering();
        let global_rx_pair = if runs_global_ordering {
            Some((
                broker.add_channel(Channel::MultiHomeOrderer),
                broker.add_channel(Channel::GlobalPaxos),
            ))
        } else {
            None
        };

        let sender = broker.start().await.context("starting broker")?;
        tracing::info!(machine = %config.local_machine(), "broker synchronized; starting modules");

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(
            Server::new(
                config.clone(),
                storage.clone(),
                sender.clone(),
                server_rx,
                client_rx,
            )
            .run(),
        ));
        tasks.push(tokio::spawn(
            Forwarder::new(config.clone(), sender.clone(), forwarder_rx).run(),
        ));
        tasks.push(tokio::spawn(
            Sequencer::new(config.clone(), sender.clone(), sequencer_rx).run(),
        ));
        tasks.push(tokio::spawn(
            Interleaver::new(config.clone(), sender.clone(), interleaver_rx).run(),
        ));
        tasks.push(tokio::spawn(
            Scheduler::new(
                config.clone(),
                storage.clone(),
                sender.clone(),
                scheduler_rx,
            )
            .run(),
        ));
        tasks.push(consensus::spawn_local_paxos(
            config.clone(),
            sender.clone(),
            local_paxos_rx,
        ));

        if let Some((orderer_rx, global_paxos_rx)) = global_rx_pair {
            tasks.push(tokio::spawn(
                MultiHomeOrderer::new(config.clone(), sender.clone(), orderer_rx).run(),
            ));
            tasks.push(consensus::spawn_global_paxos(
                config.clone(),
                sender.clone(),
                global_paxos_rx,
            ));
        }

        if config.protocol() == "tcp" && config.server_port() != 0 {
            let tcp_config = config.clone();
            let tcp_client_tx = client_tx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = serve_clients(tcp_config, tcp_client_tx).await {
                    tracing::error!(error = %err, "client API listener failed");
                }
            }));
        }

        Ok(Node {
            config,
            storage,
            client: ClientHandle {
                tx: client_tx,
                stream_ids: Arc::new(std::sync::atomic::AtomicU64::new(1)),
            },
            sender,
            tasks,
        })
    }

    pub fn client(&self) -> ClientHandle {
        self.client.clone()
    }

    pub fn storage(&self) -> Arc<MemStorage> {
        self.storage.clone()
    }

    pub fn config(&self) -> Arc<Configuration> {
        self.config.clone()
    }

    pub fn sender(&self) -> MessageSender {
        self.sender.clone()
    }

    /// Stop all module tasks and release the machine's endpoint.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if matches!(self.config.protocol(), "local" | "icp") {
            unregister_local_endpoint(self.config.address_of(self.config.local_machine()));
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}
