//! Tag-routed message delivery between modules, on one machine and across
//! machines.
//!
//! Modules register a channel before the broker starts; after the READY
//! handshake completes the channel table is immutable. Two transports are
//! supported: `tcp` frames envelopes onto sockets with a length-delimited
//! codec, `local` connects brokers of the same process through a global
//! endpoint registry (used by tests and embedded clusters).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::config::Configuration;
use crate::message::{Channel, Envelope, Message};
use crate::types::MachineId;

/// Process-wide endpoint registry for the `local` transport. Addresses are
/// arbitrary strings, so concurrent in-process clusters stay isolated by
/// using distinct address names.
static LOCAL_ENDPOINTS: OnceLock<Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>> =
    OnceLock::new();

fn local_endpoints() -> &'static Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>> {
    LOCAL_ENDPOINTS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Remove a `local`-transport endpoint, typically at node shutdown.
pub fn unregister_local_endpoint(address: &str) {
    if let Ok(mut endpoints) = local_endpoints().lock() {
        endpoints.remove(address);
    }
}

/// Cloneable handle every module uses for outbound messages.
#[derive(Clone)]
pub struct MessageSender {
    local: MachineId,
    channels: Arc<HashMap<Channel, mpsc::UnboundedSender<Envelope>>>,
    outbound: mpsc::UnboundedSender<(MachineId, Envelope)>,
}

impl MessageSender {
    pub fn local_machine(&self) -> MachineId {
        self.local
    }

    /// Deliver `message` to `channel` on `to`. Intra-machine sends skip the
    /// transport entirely.
    pub fn send(&self, to: MachineId, channel: Channel, message: Message) {
        let envelope = Envelope {
            from: self.local,
            channel,
            message,
        };
        if to == self.local {
            self.deliver(envelope);
        } else if self.outbound.send((to, envelope)).is_err() {
            tracing::warn!(%to, "broker outbound router is gone; dropping message");
        }
    }

    /// Deliver `message` to a channel on this machine.
    pub fn send_local(&self, channel: Channel, message: Message) {
        self.send(self.local, channel, message);
    }

    fn deliver(&self, envelope: Envelope) {
        match self.channels.get(&envelope.channel) {
            Some(tx) => {
                // Module receivers live as long as the node; a send failure
                // only happens during shutdown.
                let _ = tx.send(envelope);
            }
            None => {
                tracing::warn!(channel = ?envelope.channel, "message for unregistered channel")
            }
        }
    }
}

/// Builds the channel table, then starts the transport and performs the
/// READY handshake.
pub struct Broker {
    config: Arc<Configuration>,
    channels: HashMap<Channel, mpsc::UnboundedSender<Envelope>>,
}

impl Broker {
    pub fn new(config: Arc<Configuration>) -> Self {
        Self {
            config,
            channels: HashMap::new(),
        }
    }

    /// Register a channel. Must happen before [`start`](Self::start); the
    /// returned receiver is the module's inbox.
    pub fn add_channel(&mut self, channel: Channel) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.channels.insert(channel, tx).is_some() {
            panic!("channel {channel:?} registered twice");
        }
        rx
    }

    /// Start the transport, wait for every peer to come up, and return the
    /// sender handle. Envelopes that arrive before all peers are ready sit
    /// in the (unbounded) module inboxes, so nothing is lost during warm-up.
    pub async fn start(self) -> anyhow::Result<MessageSender> {
        let channels = Arc::new(self.channels);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let sender = MessageSender {
            local: self.config.local_machine(),
            channels: channels.clone(),
            outbound: outbound_tx,
        };

        match self.config.protocol() {
            // `icp` is the in-process transport's historical name; both run
            // through the process-wide endpoint registry.
            "local" | "icp" => start_local(self.config, outbound_rx, sender.clone()).await?,
            "tcp" => start_tcp(self.config, outbound_rx, sender.clone()).await?,
            other => bail!("unsupported transport protocol {other:?}"),
        }
        Ok(sender)
    }
}

async fn start_local(
    config: Arc<Configuration>,
    mut outbound_rx: mpsc::UnboundedReceiver<(MachineId, Envelope)>,
    sender: MessageSender,
) -> anyhow::Result<()> {
    let local_addr = config.address_of(config.local_machine()).to_string();

    // Inbound: a routing task owning the registered endpoint.
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Envelope>();
    {
        let mut endpoints = local_endpoints().lock().unwrap();
        if endpoints.insert(local_addr.clone(), inbound_tx).is_some() {
            bail!("local endpoint {local_addr:?} registered twice");
        }
    }
    tokio::spawn(async move {
        while let Some(envelope) = inbound_rx.recv().await {
            if matches!(envelope.message, Message::Ready) {
                continue;
            }
            sender.deliver(envelope);
        }
    });

    // Handshake: wait until every peer endpoint is registered.
    let peers: Vec<MachineId> = config
        .all_machines()
        .filter(|m| *m != config.local_machine())
        .collect();
    let mut retries = config.recv_retries();
    loop {
        let missing = {
            let endpoints = local_endpoints().lock().unwrap();
            peers
                .iter()
                .any(|peer| !endpoints.contains_key(config.address_of(*peer)))
        };
        if !missing {
            break;
        }
        if retries == 0 {
            bail!("timed out waiting for peers to register local endpoints");
        }
        retries -= 1;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tracing::debug!(machine = %config.local_machine(), "local broker synchronized");

    // Outbound: look peers up in the registry per message.
    tokio::spawn(async move {
        while let Some((to, envelope)) = outbound_rx.recv().await {
            let target = {
                let endpoints = local_endpoints().lock().unwrap();
                endpoints.get(config.address_of(to)).cloned()
            };
            match target {
                Some(tx) => {
                    let _ = tx.send(envelope);
                }
                None => tracing::warn!(%to, "no local endpoint for peer; dropping message"),
            }
        }
    });
    Ok(())
}

async fn start_tcp(
    config: Arc<Configuration>,
    mut outbound_rx: mpsc::UnboundedReceiver<(MachineId, Envelope)>,
    sender: MessageSender,
) -> anyhow::Result<()> {
    let port = config.broker_port();
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding broker listener on port {port}"))?;
    tracing::info!(machine = %config.local_machine(), port, "broker listening");

    // Count READY announcements from distinct peers.
    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<MachineId>();

    // Accept loop: every peer connects once and streams envelopes.
    {
        let sender = sender.clone();
        let ready_tx = ready_tx.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let sender = sender.clone();
                let ready_tx = ready_tx.clone();
                tokio::spawn(async move {
                    let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
                    while let Some(frame) = frames.next().await {
                        let frame = match frame {
                            Ok(frame) => frame,
                            Err(err) => {
                                tracing::warn!(error = %err, "broker read error; closing peer");
                                break;
                            }
                        };
                        match serde_json::from_slice::<Envelope>(&frame) {
                            Ok(envelope) => {
                                if matches!(envelope.message, Message::Ready) {
                                    let _ = ready_tx.send(envelope.from);
                                } else {
                                    sender.deliver(envelope);
                                }
                            }
                            Err(err) => {
                                tracing::error!(error = %err, "undecodable envelope; closing peer");
                                break;
                            }
                        }
                    }
                });
            }
        });
    }

    // One writer task per peer, fed by per-peer queues.
    let peers: Vec<MachineId> = config
        .all_machines()
        .filter(|m| *m != config.local_machine())
        .collect();
    let mut writers: HashMap<MachineId, mpsc::UnboundedSender<Envelope>> = HashMap::new();
    for peer in &peers {
        let (tx, rx) = mpsc::unbounded_channel();
        writers.insert(*peer, tx);
        let addr = peer_address(&config, *peer);
        let local = config.local_machine();
        tokio::spawn(run_peer_writer(addr, local, *peer, rx));
    }

    tokio::spawn(async move {
        while let Some((to, envelope)) = outbound_rx.recv().await {
            match writers.get(&to) {
                Some(tx) => {
                    let _ = tx.send(envelope);
                }
                None => tracing::warn!(%to, "message for unknown machine dropped"),
            }
        }
    });

    // Block start-up until every peer has announced READY.
    let mut ready = std::collections::HashSet::new();
    let deadline = config.poll_timeout() * config.recv_retries();
    while ready.len() < peers.len() {
        match tokio::time::timeout(deadline, ready_rx.recv()).await {
            Ok(Some(machine)) => {
                if ready.insert(machine) {
                    tracing::debug!(%machine, "peer ready");
                }
            }
            Ok(None) => bail!("broker ready stream closed during handshake"),
            Err(_) => bail!("timed out waiting for READY from all peers"),
        }
    }
    tracing::info!(machine = %config.local_machine(), "broker synchronized with all peers");
    Ok(())
}

/// Resolve a peer's socket address: a configured `host:port` is used as-is,
/// a bare host gets the shared broker port appended.
fn peer_address(config: &Configuration, machine: MachineId) -> String {
    let address = config.address_of(machine);
    if address.contains(':') {
        address.to_string()
    } else {
        format!("{}:{}", address, config.broker_port())
    }
}

async fn run_peer_writer(
    addr: String,
    local: MachineId,
    peer: MachineId,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) {
    // Connect with retry; peers come up in arbitrary order.
    let stream = loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => break stream,
            Err(err) => {
                tracing::debug!(%peer, error = %err, "peer not reachable yet; retrying");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    };
    let mut frames = FramedWrite::new(stream, LengthDelimitedCodec::new());

    let ready = Envelope {
        from: local,
        channel: Channel::Server,
        message: Message::Ready,
    };
    if write_envelope(&mut frames, &ready).await.is_err() {
        tracing::error!(%peer, "failed to announce READY");
        return;
    }

    while let Some(envelope) = rx.recv().await {
        if let Err(err) = write_envelope(&mut frames, &envelope).await {
            tracing::error!(%peer, error = %err, "broker write failed; dropping connection");
            return;
        }
    }
}

async fn write_envelope(
    frames: &mut FramedWrite<TcpStream, LengthDelimitedCodec>,
    envelope: &Envelope,
) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec(envelope).context("encoding envelope")?;
    frames.send(Bytes::from(bytes)).await.context("writing envelope")?;
    Ok(())
}
