//! Workload generator for exercising a Meridian cluster over the client
//! API.
//!
//! Each client task opens one connection, issues GET/SET transactions over
//! a configurable hot key set, and records latency and abort counts. The
//! summary is printed as JSON so runs can be diffed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use meridian_store::api::{ApiRequest, ApiResponse};
use meridian_store::transaction::{Procedure, Transaction, TransactionStatus};
use meridian_store::types::MachineId;

#[derive(Parser, Debug, Clone)]
#[command(name = "meridian-bench", about = "Meridian workload generator")]
struct Args {
    /// Comma-separated client API endpoints, e.g. `127.0.0.1:2023,127.0.0.1:2024`.
    #[arg(long)]
    nodes: String,

    /// Number of concurrent clients (one connection each).
    #[arg(long, default_value_t = 8)]
    clients: usize,

    /// Number of hot keys used by the workload.
    #[arg(long, default_value_t = 100)]
    keys: usize,

    /// Key prefix; keys are generated as `{prefix}{index}`.
    #[arg(long, default_value = "mrd")]
    key_prefix: String,

    /// Percent of transactions that write (the rest only read).
    #[arg(long, default_value_t = 50)]
    write_pct: u8,

    /// Keys touched per transaction.
    #[arg(long, default_value_t = 2)]
    keys_per_txn: usize,

    /// Total runtime of the workload.
    #[arg(long, default_value = "30s")]
    duration: humantime::Duration,

    /// Per-transaction timeout.
    #[arg(long, default_value = "10s")]
    op_timeout: humantime::Duration,

    /// Random seed (0 picks one from entropy).
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[derive(Default)]
struct Totals {
    committed: AtomicU64,
    aborted: AtomicU64,
    errors: AtomicU64,
    latency_us_total: AtomicU64,
    latency_us_max: AtomicU64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let nodes: Vec<SocketAddr> = args
        .nodes
        .split(',')
        .map(|addr| addr.trim().parse().context("parsing node address"))
        .collect::<anyhow::Result<_>>()?;
    anyhow::ensure!(!nodes.is_empty(), "at least one node address is required");

    let seed = if args.seed == 0 {
        rand::random()
    } else {
        args.seed
    };
    tracing::info!(seed, clients = args.clients, "starting workload");

    let totals = Arc::new(Totals::default());
    let deadline = Instant::now() + *args.duration;

    let mut handles = Vec::new();
    for client_id in 0..args.clients {
        let args = args.clone();
        let nodes = nodes.clone();
        let totals = totals.clone();
        handles.push(tokio::spawn(async move {
            let rng = SmallRng::seed_from_u64(seed.wrapping_add(client_id as u64));
            if let Err(err) = run_client(client_id, args, nodes, totals, rng, deadline).await {
                tracing::warn!(client_id, error = %err, "client stopped early");
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }

    let committed = totals.committed.load(Ordering::Relaxed);
    let aborted = totals.aborted.load(Ordering::Relaxed);
    let errors = totals.errors.load(Ordering::Relaxed);
    let total = committed + aborted;
    let avg_latency_us = if total == 0 {
        0
    } else {
        totals.latency_us_total.load(Ordering::Relaxed) / total
    };
    let summary = serde_json::json!({
        "seed": seed,
        "committed": committed,
        "aborted": aborted,
        "errors": errors,
        "throughput_per_sec": total as f64 / args.duration.as_secs_f64(),
        "avg_latency_us": avg_latency_us,
        "max_latency_us": totals.latency_us_max.load(Ordering::Relaxed),
    });
    println!("{summary}");
    Ok(())
}

async fn run_client(
    client_id: usize,
    args: Args,
    nodes: Vec<SocketAddr>,
    totals: Arc<Totals>,
    mut rng: SmallRng,
    deadline: Instant,
) -> anyhow::Result<()> {
    let addr = nodes[client_id % nodes.len()];
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    let (read_half, write_half) = stream.into_split();
    let mut frames_in = FramedRead::new(read_half, LengthDelimitedCodec::new());
    let mut frames_out = FramedWrite::new(write_half, LengthDelimitedCodec::new());

    let mut stream_id = 0u64;
    while Instant::now() < deadline {
        stream_id += 1;
        let txn = build_txn(&args, &mut rng);
        let request = ApiRequest::Txn { stream_id, txn };
        let bytes = serde_json::to_vec(&request)?;

        let started = Instant::now();
        frames_out.send(Bytes::from(bytes)).await?;
        let response = match time::timeout(*args.op_timeout, frames_in.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(err))) => {
                totals.errors.fetch_add(1, Ordering::Relaxed);
                return Err(err).context("reading response");
            }
            Ok(None) => {
                totals.errors.fetch_add(1, Ordering::Relaxed);
                anyhow::bail!("server closed the connection");
            }
            Err(_) => {
                totals.errors.fetch_add(1, Ordering::Relaxed);
                anyhow::bail!("transaction timed out");
            }
        };
        let latency_us = started.elapsed().as_micros().min(u128::from(u64::MAX)) as u64;
        totals.latency_us_total.fetch_add(latency_us, Ordering::Relaxed);
        totals.latency_us_max.fetch_max(latency_us, Ordering::Relaxed);

        match serde_json::from_slice::<ApiResponse>(&response)? {
            ApiResponse::Txn { txn, .. } => {
                if txn.status == TransactionStatus::Committed {
                    totals.committed.fetch_add(1, Ordering::Relaxed);
                } else {
                    totals.aborted.fetch_add(1, Ordering::Relaxed);
                }
            }
            ApiResponse::Stats { .. } => {
                totals.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    Ok(())
}

/// Build one GET- or SET-heavy transaction over random hot keys.
fn build_txn(args: &Args, rng: &mut SmallRng) -> Transaction {
    let mut txn = Transaction::new(
        0,
        Procedure::KeyValue { code: String::new() },
        MachineId::new(0, 0),
    );
    let is_write = rng.gen_range(0..100) < args.write_pct;
    let mut code = String::new();
    for _ in 0..args.keys_per_txn.max(1) {
        let key = format!("{}{}", args.key_prefix, rng.gen_range(0..args.keys.max(1)));
        if is_write {
            let value = format!("v{}", rng.gen::<u32>());
            code.push_str(&format!("SET {key} {value} "));
            txn.write_set.insert(key, String::new());
        } else {
            code.push_str(&format!("GET {key} "));
            txn.read_set.insert(key, String::new());
        }
    }
    txn.procedure = Procedure::KeyValue {
        code: code.trim_end().to_string(),
    };
    txn
}
