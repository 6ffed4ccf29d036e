//! Cluster configuration and the local machine's view of it.
//!
//! The cluster file is JSON, loaded once at startup and immutable after
//! that. Every module receives the same `Arc<Configuration>`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::types::{Key, MachineId, PartitionId, RegionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Partitioning {
    HashPartitioning,
    SimplePartitioning,
    TPCCPartitioning,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionType {
    #[serde(rename = "KEY_VALUE")]
    KeyValue,
    #[serde(rename = "NOOP")]
    Noop,
    #[serde(rename = "TPC_C")]
    TpcC,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ReplicationDelay {
    /// Percentage of sealed batches whose cross-region replication is
    /// deferred.
    pub delay_pct: u32,
    /// Average delay in milliseconds; a deferred batch is released each
    /// tick with probability `100 / delay_amount_ms`.
    pub delay_amount_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// One endpoint per partition; length must equal `num_partitions`.
    pub addresses: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CpuPinning {
    pub module: String,
    pub cpu: u32,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_ratio() -> String {
    "1:1".to_string()
}

fn default_num_workers() -> usize {
    3
}

fn default_batch_duration_ms() -> u64 {
    5
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_recv_retries() -> u32 {
    100
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Transport scheme: `tcp` for production, `local` for in-process
    /// clusters in tests.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// One entry per region.
    pub replicas: Vec<ReplicaConfig>,
    pub num_partitions: u32,
    /// Broker listening ports; the first entry is used by the machine's
    /// broker thread.
    #[serde(default)]
    pub broker_ports: Vec<u16>,
    #[serde(default)]
    pub server_port: u16,
    #[serde(default)]
    pub forwarder_port: u16,
    #[serde(default)]
    pub sequencer_port: u16,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_batch_duration_ms")]
    pub forwarder_batch_duration: u64,
    #[serde(default = "default_batch_duration_ms")]
    pub sequencer_batch_duration: u64,
    #[serde(default)]
    pub replication_factor: u32,
    #[serde(default)]
    pub replication_order: Vec<String>,
    pub partitioning: Partitioning,
    #[serde(default)]
    pub bypass_mh_orderer: bool,
    #[serde(default)]
    pub cpu_pinnings: Vec<CpuPinning>,
    #[serde(default)]
    pub return_dummy_txn: bool,
    pub execution_type: ExecutionType,
    #[serde(default)]
    pub synchronized_batching: bool,
    #[serde(default)]
    pub sample_rate: u32,
    #[serde(default = "default_ratio")]
    pub interleaver_remote_to_local_ratio: String,
    #[serde(default)]
    pub replication_delay: Option<ReplicationDelay>,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_recv_retries")]
    pub recv_retries: u32,
}

/// The immutable configuration handle shared by all modules of one machine.
#[derive(Debug)]
pub struct Configuration {
    cluster: ClusterConfig,
    local: MachineId,
    remote_to_local_ratio: (u32, u32),
}

impl Configuration {
    pub fn from_file(
        path: impl AsRef<Path>,
        region: RegionId,
        partition: PartitionId,
    ) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config file {}", path.as_ref().display()))?;
        let cluster: ClusterConfig =
            serde_json::from_str(&raw).context("parsing cluster configuration")?;
        Self::new(cluster, MachineId::new(region, partition))
    }

    pub fn new(cluster: ClusterConfig, local: MachineId) -> anyhow::Result<Self> {
        if cluster.replicas.is_empty() {
            bail!("configuration lists no replicas");
        }
        for (idx, replica) in cluster.replicas.iter().enumerate() {
            if replica.addresses.len() != cluster.num_partitions as usize {
                bail!(
                    "replica {idx} lists {} addresses but num_partitions is {}",
                    replica.addresses.len(),
                    cluster.num_partitions
                );
            }
        }
        if local.region as usize >= cluster.replicas.len()
            || local.partition >= cluster.num_partitions
        {
            bail!("local machine {local} is outside the configured cluster");
        }
        match cluster.protocol.as_str() {
            "tcp" | "local" | "icp" => {}
            other => bail!("unsupported transport protocol {other:?}"),
        }
        if cluster.partitioning == Partitioning::TPCCPartitioning {
            bail!("TPCCPartitioning is not supported by this build");
        }
        if cluster.execution_type == ExecutionType::TpcC {
            bail!("TPC_C execution is not supported by this build");
        }
        let remote_to_local_ratio = parse_ratio(&cluster.interleaver_remote_to_local_ratio)?;
        Ok(Self {
            cluster,
            local,
            remote_to_local_ratio,
        })
    }

    pub fn raw(&self) -> &ClusterConfig {
        &self.cluster
    }

    pub fn local_machine(&self) -> MachineId {
        self.local
    }

    pub fn local_region(&self) -> RegionId {
        self.local.region
    }

    pub fn local_partition(&self) -> PartitionId {
        self.local.partition
    }

    pub fn num_regions(&self) -> u32 {
        self.cluster.replicas.len() as u32
    }

    pub fn num_partitions(&self) -> u32 {
        self.cluster.num_partitions
    }

    pub fn num_workers(&self) -> usize {
        self.cluster.num_workers.max(1)
    }

    /// Dense machine number used in txn and batch id arithmetic.
    pub fn local_machine_number(&self) -> u64 {
        u64::from(self.local.region) * u64::from(self.num_partitions())
            + u64::from(self.local.partition)
    }

    pub fn all_machines(&self) -> impl Iterator<Item = MachineId> + '_ {
        let partitions = self.num_partitions();
        (0..self.num_regions())
            .flat_map(move |r| (0..partitions).map(move |p| MachineId::new(r, p)))
    }

    pub fn machines_in_region(&self, region: RegionId) -> impl Iterator<Item = MachineId> + '_ {
        (0..self.num_partitions()).map(move |p| MachineId::new(region, p))
    }

    pub fn address_of(&self, machine: MachineId) -> &str {
        &self.cluster.replicas[machine.region as usize].addresses[machine.partition as usize]
    }

    pub fn broker_port(&self) -> u16 {
        self.cluster.broker_ports.first().copied().unwrap_or(0)
    }

    pub fn server_port(&self) -> u16 {
        self.cluster.server_port
    }

    pub fn protocol(&self) -> &str {
        &self.cluster.protocol
    }

    pub fn partition_of_key(&self, key: &Key) -> PartitionId {
        match self.cluster.partitioning {
            Partitioning::HashPartitioning => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % u64::from(self.num_partitions())) as PartitionId
            }
            Partitioning::SimplePartitioning => {
                simple_partition(key) % self.num_partitions()
            }
            Partitioning::TPCCPartitioning => unreachable!("rejected at configuration load"),
        }
    }

    pub fn key_is_in_local_partition(&self, key: &Key) -> bool {
        self.partition_of_key(key) == self.local.partition
    }

    /// The partition of each region that participates in global ordering.
    pub fn leader_partition_for_multi_home_ordering(&self) -> PartitionId {
        0
    }

    /// Members of the region's local Paxos group: every machine of the
    /// region.
    pub fn local_paxos_members(&self, region: RegionId) -> Vec<MachineId> {
        self.machines_in_region(region).collect()
    }

    /// Members of the global Paxos group: the leader partition machine of
    /// every region.
    pub fn global_paxos_members(&self) -> Vec<MachineId> {
        let part = self.leader_partition_for_multi_home_ordering();
        (0..self.num_regions())
            .map(|r| MachineId::new(r, part))
            .collect()
    }

    pub fn sequencer_batch_duration(&self) -> Duration {
        Duration::from_millis(self.cluster.sequencer_batch_duration.max(1))
    }

    pub fn forwarder_batch_duration(&self) -> Duration {
        Duration::from_millis(self.cluster.forwarder_batch_duration.max(1))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.poll_timeout_ms.max(1))
    }

    pub fn recv_retries(&self) -> u32 {
        self.cluster.recv_retries.max(1)
    }

    pub fn bypass_mh_orderer(&self) -> bool {
        self.cluster.bypass_mh_orderer
    }

    pub fn return_dummy_txn(&self) -> bool {
        self.cluster.return_dummy_txn
    }

    pub fn execution_type(&self) -> ExecutionType {
        self.cluster.execution_type
    }

    pub fn replication_delay(&self) -> Option<ReplicationDelay> {
        self.cluster.replication_delay
    }

    /// `(remote, local)` item counts for one round of the interleaver merge.
    pub fn remote_to_local_ratio(&self) -> (u32, u32) {
        self.remote_to_local_ratio
    }
}

/// `SimplePartitioning` reads the key's trailing decimal digits as its
/// partition number; keys without digits land on partition 0.
fn simple_partition(key: &Key) -> PartitionId {
    let digits: String = key
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse::<PartitionId>().unwrap_or(0)
}

fn parse_ratio(raw: &str) -> anyhow::Result<(u32, u32)> {
    let Some((remote, local)) = raw.split_once(':') else {
        bail!("interleaver_remote_to_local_ratio must look like \"R:L\", got {raw:?}");
    };
    let remote: u32 = remote
        .trim()
        .parse()
        .with_context(|| format!("remote side of ratio {raw:?}"))?;
    let local: u32 = local
        .trim()
        .parse()
        .with_context(|| format!("local side of ratio {raw:?}"))?;
    if remote == 0 || local == 0 {
        bail!("interleaver_remote_to_local_ratio sides must be positive, got {raw:?}");
    }
    Ok((remote, local))
}

/// Minimal in-process cluster shape for unit tests.
#[cfg(test)]
pub(crate) fn test_configuration(
    num_regions: u32,
    num_partitions: u32,
    local: MachineId,
) -> Configuration {
    let replicas = (0..num_regions)
        .map(|r| ReplicaConfig {
            addresses: (0..num_partitions)
                .map(|p| format!("unit-{r}-{p}"))
                .collect(),
        })
        .collect();
    let cluster = ClusterConfig {
        protocol: "local".to_string(),
        replicas,
        num_partitions,
        broker_ports: Vec::new(),
        server_port: 0,
        forwarder_port: 0,
        sequencer_port: 0,
        num_workers: 2,
        forwarder_batch_duration: 1,
        sequencer_batch_duration: 1,
        replication_factor: num_regions,
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
        recv_retries: 100,
    };
    Configuration::new(cluster, local).expect("test configuration is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_partitioning_uses_trailing_digits() {
        let config = test_configuration(1, 3, MachineId::new(0, 0));
        assert_eq!(config.partition_of_key(&"alpha0".to_string()), 0);
        assert_eq!(config.partition_of_key(&"alpha1".to_string()), 1);
        assert_eq!(config.partition_of_key(&"alpha5".to_string()), 2);
        assert_eq!(config.partition_of_key(&"alpha".to_string()), 0);
    }

    #[test]
    fn ratio_parsing_rejects_malformed_values() {
        assert!(parse_ratio("2:1").is_ok());
        assert!(parse_ratio("2").is_err());
        assert!(parse_ratio("0:1").is_err());
        assert!(parse_ratio("a:b").is_err());
    }

    #[test]
    fn mismatched_address_counts_are_a_configuration_error() {
        let mut config = test_configuration(2, 2, MachineId::new(0, 0));
        config.cluster.replicas[1].addresses.pop();
        let err = Configuration::new(config.cluster, MachineId::new(0, 0)).unwrap_err();
        assert!(err.to_string().contains("num_partitions"));
    }

    #[test]
    fn global_paxos_members_are_one_machine_per_region() {
        let config = test_configuration(3, 2, MachineId::new(1, 1));
        let members = config.global_paxos_members();
        assert_eq!(members.len(), 3);
        assert!(members.iter().all(|m| m.partition == 0));
    }
}
