//! Server: the client-facing module. Assigns transaction ids, validates
//! requests, answers master lookups for the forwarders, and assembles
//! completed sub-transactions into full client responses.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::api::{ApiRequest, ApiResponse, StatsModule};
use crate::broker::MessageSender;
use crate::config::Configuration;
use crate::message::{Channel, Envelope, Message};
use crate::storage::MemStorage;
use crate::transaction::{merge_transaction, Procedure, Transaction, TransactionStatus};
use crate::types::{Key, MachineId, PartitionId, TxnId, MAX_NUM_MACHINES};

/// A client request paired with its reply path. Both the TCP front-end and
/// embedded clients (tests, tools) submit through this type.
pub struct ClientCommand {
    pub request: ApiRequest,
    pub reply: oneshot::Sender<ApiResponse>,
}

struct PendingResponse {
    stream_id: u64,
    reply: oneshot::Sender<ApiResponse>,
}

/// Partial result of a transaction, merged as partitions report in.
struct FinishedTxn {
    txn: Box<Transaction>,
    awaited_partitions: HashSet<PartitionId>,
}

pub struct Server {
    config: Arc<Configuration>,
    storage: Arc<MemStorage>,
    sender: MessageSender,
    rx: mpsc::UnboundedReceiver<Envelope>,
    client_rx: mpsc::UnboundedReceiver<ClientCommand>,
    txn_id_counter: u64,
    pending_responses: HashMap<TxnId, PendingResponse>,
    completed_txns: HashMap<TxnId, FinishedTxn>,
}

impl Server {
    pub fn new(
        config: Arc<Configuration>,
        storage: Arc<MemStorage>,
        sender: MessageSender,
        rx: mpsc::UnboundedReceiver<Envelope>,
        client_rx: mpsc::UnboundedReceiver<ClientCommand>,
    ) -> Self {
        Self {
            config,
            storage,
            sender,
            rx,
            client_rx,
            txn_id_counter: 0,
            pending_responses: HashMap::new(),
            completed_txns: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                envelope = self.rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    self.handle_envelope(envelope);
                }
                command = self.client_rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle_client_command(command);
                }
            }
        }
    }

    fn handle_client_command(&mut self, command: ClientCommand) {
        match command.request {
            ApiRequest::Txn { stream_id, txn } => {
                self.handle_txn_request(stream_id, txn, command.reply)
            }
            ApiRequest::Stats {
                stream_id,
                module,
                level,
            } => self.handle_stats_request(stream_id, module, level, command.reply),
        }
    }

    fn handle_txn_request(
        &mut self,
        stream_id: u64,
        mut txn: Transaction,
        reply: oneshot::Sender<ApiResponse>,
    ) {
        if let Some(reason) = validate_transaction(&txn) {
            txn.status = TransactionStatus::Aborted;
            txn.abort_reason = Some(reason.to_string());
            let _ = reply.send(ApiResponse::Txn {
                stream_id,
                txn: Box::new(txn),
            });
            return;
        }

        let txn_id = self.next_txn_id();
        if self.pending_responses.contains_key(&txn_id) {
            tracing::error!(txn_id, "duplicate transaction id issued by this server");
            std::process::abort();
        }
        txn.id = txn_id;
        txn.coordinating_server = self.config.local_machine();
        self.pending_responses
            .insert(txn_id, PendingResponse { stream_id, reply });

        tracing::debug!(txn_id, "accepted transaction from client");
        self.sender
            .send_local(Channel::Forwarder, Message::ForwardTxn { txn });
    }

    fn handle_stats_request(
        &mut self,
        stream_id: u64,
        module: StatsModule,
        level: u32,
        reply: oneshot::Sender<ApiResponse>,
    ) {
        match module {
            StatsModule::Server => {
                let json = self.server_stats(level).to_string();
                let _ = reply.send(ApiResponse::Stats { stream_id, json });
            }
            StatsModule::Scheduler => {
                let id = self.next_txn_id();
                self.pending_responses
                    .insert(id, PendingResponse { stream_id, reply });
                self.sender
                    .send_local(Channel::Scheduler, Message::StatsRequest { id, level });
            }
        }
    }

    fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope.message {
            Message::LookupMaster { txn_id, keys } => {
                self.handle_lookup_master(txn_id, keys, envelope.from)
            }
            Message::CompletedSubtransaction {
                txn,
                partition,
                involved_partitions,
            } => self.handle_completed_subtxn(txn, partition, involved_partitions),
            Message::StatsResponse { id, json } => {
                if let Some(pending) = self.pending_responses.remove(&id) {
                    let _ = pending.reply.send(ApiResponse::Stats {
                        stream_id: pending.stream_id,
                        json,
                    });
                }
            }
            other => {
                tracing::warn!(message = ?other, "unexpected message in server");
            }
        }
    }

    /// Answer for the keys this partition owns: metadata for known keys,
    /// a new-key marker for the rest.
    fn handle_lookup_master(&mut self, txn_id: TxnId, keys: Vec<Key>, from: MachineId) {
        let mut metadata = BTreeMap::new();
        let mut new_keys = Vec::new();
        for key in keys {
            if !self.config.key_is_in_local_partition(&key) {
                continue;
            }
            match self.storage.master_metadata(&key) {
                Some(meta) => {
                    metadata.insert(key, meta);
                }
                None => new_keys.push(key),
            }
        }
        self.sender.send(
            from,
            Channel::Forwarder,
            Message::LookupMasterResult {
                txn_id,
                metadata,
                new_keys,
            },
        );
    }

    fn handle_completed_subtxn(
        &mut self,
        txn: Box<Transaction>,
        partition: PartitionId,
        involved_partitions: Vec<PartitionId>,
    ) {
        let txn_id = txn.id;
        if !self.pending_responses.contains_key(&txn_id) {
            return;
        }
        match self.completed_txns.get_mut(&txn_id) {
            None => {
                // First sub-transaction: it seeds the merged result and the
                // set of partitions still owing theirs.
                let awaited_partitions = involved_partitions
                    .iter()
                    .copied()
                    .filter(|p| *p != partition)
                    .collect();
                self.completed_txns.insert(
                    txn_id,
                    FinishedTxn {
                        txn,
                        awaited_partitions,
                    },
                );
            }
            Some(finished) => {
                // Replicas of the same partition report too; only the first
                // report per partition is merged.
                if finished.awaited_partitions.remove(&partition) {
                    merge_transaction(&mut finished.txn, &txn);
                }
            }
        }

        let done = self
            .completed_txns
            .get(&txn_id)
            .is_some_and(|finished| finished.awaited_partitions.is_empty());
        if done {
            let finished = self.completed_txns.remove(&txn_id).expect("entry exists");
            let pending = self
                .pending_responses
                .remove(&txn_id)
                .expect("pending response exists");
            let txn = if self.config.return_dummy_txn() {
                let mut dummy = Transaction::new(
                    txn_id,
                    Procedure::KeyValue { code: String::new() },
                    self.config.local_machine(),
                );
                dummy.status = finished.txn.status;
                dummy.abort_reason = finished.txn.abort_reason.clone();
                Box::new(dummy)
            } else {
                finished.txn
            };
            tracing::debug!(txn_id, status = ?txn.status, "responding to client");
            let _ = pending.reply.send(ApiResponse::Txn {
                stream_id: pending.stream_id,
                txn,
            });
        }
    }

    fn server_stats(&self, level: u32) -> serde_json::Value {
        let mut stats = serde_json::json!({
            "txn_id_counter": self.txn_id_counter,
            "num_pending_responses": self.pending_responses.len(),
            "num_partially_completed_txns": self.completed_txns.len(),
        });
        if level >= 1 {
            stats["pending_responses"] = self
                .pending_responses
                .iter()
                .map(|(id, pending)| serde_json::json!([id, pending.stream_id]))
                .collect();
            stats["partially_completed_txns"] = self
                .completed_txns
                .keys()
                .copied()
                .collect::<Vec<_>>()
                .into();
        }
        serde_json::json!({ "server": stats })
    }

    fn next_txn_id(&mut self) -> TxnId {
        self.txn_id_counter += 1;
        self.txn_id_counter * MAX_NUM_MACHINES + self.config.local_machine_number()
    }
}

/// Client-visible validation; failures abort before the transaction enters
/// the data plane.
fn validate_transaction(txn: &Transaction) -> Option<&'static str> {
    if txn.accesses_no_key() {
        return Some("Txn accesses no key");
    }
    if txn.is_remaster() {
        if !txn.read_set.is_empty() {
            return Some("Remaster txns should not read anything");
        }
        if txn.write_set.len() != 1 {
            return Some("Remaster txns should write to 1 key");
        }
    }
    None
}

/// Serve the client API over TCP with length-delimited JSON frames.
pub async fn serve_clients(
    config: Arc<Configuration>,
    client_tx: mpsc::UnboundedSender<ClientCommand>,
) -> anyhow::Result<()> {
    let port = config.server_port();
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "client API listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::debug!(%peer, "client connected");
        let client_tx = client_tx.clone();
        tokio::spawn(async move {
            let (read_half, write_half) = stream.into_split();
            let mut frames_in = FramedRead::new(read_half, LengthDelimitedCodec::new());
            let frames_out = FramedWrite::new(write_half, LengthDelimitedCodec::new());
            let (response_tx, mut response_rx) = mpsc::unbounded_channel::<ApiResponse>();

            let writer = tokio::spawn(async move {
                let mut frames_out = frames_out;
                while let Some(response) = response_rx.recv().await {
                    let Ok(bytes) = serde_json::to_vec(&response) else {
                        continue;
                    };
                    if frames_out.send(bytes.into()).await.is_err() {
                        break;
                    }
                }
            });

            while let Some(Ok(frame)) = frames_in.next().await {
                let request: ApiRequest = match serde_json::from_slice(&frame) {
                    Ok(request) => request,
                    Err(err) => {
                        tracing::warn!(error = %err, "undecodable client request");
                        break;
                    }
                };
                let (reply_tx, reply_rx) = oneshot::channel();
                if client_tx
                    .send(ClientCommand {
                        request,
                        reply: reply_tx,
                    })
                    .is_err()
                {
                    break;
                }
                let response_tx = response_tx.clone();
                tokio::spawn(async move {
                    if let Ok(response) = reply_rx.await {
                        let _ = response_tx.send(response);
                    }
                });
            }
            drop(response_tx);
            let _ = writer.await;
        });
    }
}
