//! Shared helpers for integration tests: an in-process cluster harness
//! built on the `local` transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meridian_store::config::{
    ClusterConfig, Configuration, ExecutionType, Partitioning, ReplicaConfig,
};
use meridian_store::node::{ClientHandle, Node};
use meridian_store::storage::MemStorage;
use meridian_store::transaction::{Procedure, Transaction, TransactionStatus};
use meridian_store::types::{MachineId, MasterMetadata, Record, RegionId};

/// How long a test waits for one transaction round trip.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(20);

static CLUSTER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A key seeded into every replica of its partition before startup.
pub struct SeedKey {
    pub key: &'static str,
    pub value: &'static str,
    pub master: RegionId,
    pub counter: u32,
}

pub fn seed(key: &'static str, value: &'static str, master: RegionId, counter: u32) -> SeedKey {
    SeedKey {
        key,
        value,
        master,
        counter,
    }
}

/// An in-process cluster of `regions x partitions` nodes.
pub struct TestCluster {
    nodes: Vec<Node>,
    num_partitions: u32,
}

impl TestCluster {
    pub async fn start(name: &str, regions: u32, partitions: u32, seeds: &[SeedKey]) -> Self {
        Self::start_with(name, regions, partitions, seeds, |_| {}).await
    }

    /// Start a cluster, letting the caller tweak the configuration (e.g.
    /// enable `bypass_mh_orderer`).
    pub async fn start_with(
        name: &str,
        regions: u32,
        partitions: u32,
        seeds: &[SeedKey],
        customize: impl Fn(&mut ClusterConfig),
    ) -> Self {
        let cluster_id = CLUSTER_COUNTER.fetch_add(1, Ordering::Relaxed);
        let replicas = (0..regions)
            .map(|r| ReplicaConfig {
                addresses: (0..partitions)
                    .map(|p| format!("{name}-{cluster_id}-{r}-{p}"))
                    .collect(),
            })
            .collect();
        let mut cluster = ClusterConfig {
            protocol: "local".to_string(),
            replicas,
            num_partitions: partitions,
            broker_ports: Vec::new(),
            server_port: 0,
            forwarder_port: 0,
            sequencer_port: 0,
            num_workers: 2,
            forwarder_batch_duration: 2,
            sequencer_batch_duration: 2,
            replication_factor: regions,
            replication_order: Vec::new(),
            partitioning: Partitioning::SimplePartitioning,
            bypass_mh_orderer: false,
            cpu_pinnings: Vec::new(),
            return_dummy_txn: false,
            execution_type: ExecutionType::KeyValue,
            synchronized_batching: false,
            sample_rate: 0,
            interleaver_remote_to_local_ratio: "1:1".to_string(),
            replication_delay: None,
            poll_timeout_ms: 10,
            recv_retries: 500,
        };
        customize(&mut cluster);

        let mut starting = Vec::new();
        for region in 0..regions {
            for partition in 0..partitions {
                let config = Arc::new(
                    Configuration::new(cluster.clone(), MachineId::new(region, partition))
                        .expect("test cluster configuration is valid"),
                );
                let storage = Arc::new(MemStorage::new());
                for seed in seeds {
                    let key = seed.key.to_string();
                    if config.partition_of_key(&key) == partition {
                        storage.write(
                            key,
                            Record::new(
                                seed.value,
                                MasterMetadata::new(seed.master, seed.counter),
                            ),
                        );
                    }
                }
                starting.push(tokio::spawn(Node::start_with_storage(config, storage)));
            }
        }

        let mut nodes = Vec::new();
        for handle in starting {
            nodes.push(
                handle
                    .await
                    .expect("node start task panicked")
                    .expect("node failed to start"),
            );
        }
        Self {
            nodes,
            num_partitions: partitions,
        }
    }

    pub fn node(&self, region: u32, partition: u32) -> &Node {
        &self.nodes[(region * self.num_partitions + partition) as usize]
    }

    pub fn client(&self, region: u32, partition: u32) -> ClientHandle {
        self.node(region, partition).client()
    }

    /// Submit a transaction through the given machine and wait for the
    /// response, failing the test on timeout.
    pub async fn submit(&self, region: u32, partition: u32, txn: Transaction) -> Transaction {
        tokio::time::timeout(SUBMIT_TIMEOUT, self.client(region, partition).submit(txn))
            .await
            .expect("transaction timed out")
            .expect("transaction failed")
    }

    /// Poll a key's record at one machine until the predicate holds.
    pub async fn wait_for_record(
        &self,
        region: u32,
        partition: u32,
        key: &str,
        predicate: impl Fn(&Record) -> bool,
    ) {
        let storage = self.node(region, partition).storage();
        let key = key.to_string();
        let deadline = tokio::time::Instant::now() + SUBMIT_TIMEOUT;
        loop {
            if let Some(record) = storage.read(&key) {
                if predicate(&record) {
                    return;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("record {key:?} at {region}:{partition} never reached expected state");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Build a key-value transaction over the given key sets.
pub fn make_txn(reads: &[&str], writes: &[&str], code: &str) -> Transaction {
    let mut txn = Transaction::new(
        0,
        Procedure::KeyValue {
            code: code.to_string(),
        },
        MachineId::new(0, 0),
    );
    for key in reads {
        txn.read_set.insert((*key).to_string(), String::new());
    }
    for key in writes {
        txn.write_set.insert((*key).to_string(), String::new());
    }
    txn
}

/// Build a remaster transaction moving `key` to `new_master`.
pub fn make_remaster_txn(key: &str, new_master: RegionId) -> Transaction {
    let mut txn = Transaction::new(
        0,
        Procedure::Remaster { new_master },
        MachineId::new(0, 0),
    );
    txn.write_set.insert(key.to_string(), String::new());
    txn
}

pub fn assert_committed(txn: &Transaction) {
    assert_eq!(
        txn.status,
        TransactionStatus::Committed,
        "expected commit, got abort: {:?}",
        txn.abort_reason
    );
}
