use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StevedoreError};
use crate::model::Resources;

/// Configuration for Docker-based task execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Image used when a task names none
    pub image: String,
    /// Disable network access in container
    pub network_disabled: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "alpine:latest".to_string(),
            network_disabled: true,
        }
    }
}

/// Settings for the node-local side: what this node offers to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Run allocations on this node.
    pub enabled: bool,
    pub node_class: Option<String>,
    /// Free-form attributes matched by `attr.<key>` constraints.
    pub attributes: BTreeMap<String, String>,
    /// Capacity advertised to the scheduler.
    pub resources: Resources,
    pub sandbox: SandboxConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            node_class: None,
            attributes: BTreeMap::new(),
            resources: Resources::new(4000, 4096, 10_000, 1000),
            sandbox: SandboxConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// How often every node reports its registration to the leader.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Missed intervals before an alive node becomes suspect.
    pub suspect_multiplier: u32,
    /// Missed intervals before a node is declared dead.
    pub dead_multiplier: u32,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            suspect_multiplier: 3,
            dead_multiplier: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutopilotConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// How long a voter must be dead before it is removed.
    #[serde(with = "humantime_serde")]
    pub dead_server_threshold: Duration,
    /// Voter count autopilot never shrinks below.
    pub min_quorum: usize,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            dead_server_threshold: Duration::from_secs(60),
            min_quorum: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclPolicy {
    Allow,
    #[default]
    Deny,
}

/// Token gate in front of the control API. Disabled unless configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AclConfig {
    pub enabled: bool,
    /// Token accepted for every operation.
    pub management_token: Option<String>,
    /// What anonymous reads get when ACLs are enabled.
    pub default_policy: AclPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: u64,
    pub addr: String, // host:port format, supports both IP and hostnames
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: u64,
    /// Defaults to `node-<id>`.
    pub node_name: String,
    pub datacenter: String,
    /// gRPC listen address for node-to-node traffic.
    pub listen_addr: SocketAddr,
    /// RPC address advertised to peers when it differs from `listen_addr`.
    pub advertise_addr: Option<String>,
    /// Control API listen address.
    pub http_addr: SocketAddr,
    /// Voters known ahead of time.
    pub peers: Vec<PeerConfig>,
    /// RPC addresses probed with `Join` while discovering the cluster.
    pub retry_join: Vec<String>,
    /// Voters required before the first election.
    pub bootstrap_expect: usize,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Log entries kept in memory before a snapshot is taken.
    pub snapshot_threshold: usize,
    /// Persist consensus state here; in-memory only when unset.
    pub data_dir: Option<PathBuf>,
    pub membership: MembershipConfig,
    pub autopilot: AutopilotConfig,
    pub client: ClientConfig,
    pub acl: AclConfig,
    /// Default proposal timeout for writes.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Follower contact age beyond which health reports degraded.
    #[serde(with = "humantime_serde")]
    pub max_stale: Duration,
    /// Blocking query wait when `?index` is given without `?wait`.
    #[serde(with = "humantime_serde")]
    pub default_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            node_name: String::new(),
            datacenter: "dc1".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            advertise_addr: None,
            http_addr: SocketAddr::from(([127, 0, 0, 1], 4646)),
            peers: Vec::new(),
            retry_join: Vec::new(),
            bootstrap_expect: 1,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            snapshot_threshold: 1000,
            data_dir: None,
            membership: MembershipConfig::default(),
            autopilot: AutopilotConfig::default(),
            client: ClientConfig::default(),
            acl: AclConfig::default(),
            request_timeout: Duration::from_secs(10),
            max_stale: Duration::from_secs(10),
            default_wait: Duration::from_secs(5 * 60),
            max_wait: Duration::from_secs(10 * 60),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u64, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: u64, addr: String) -> Self {
        self.peers.push(PeerConfig { node_id, addr });
        self
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(raw)
            .map_err(|e| StevedoreError::Internal(format!("invalid config: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// Reject settings that cannot work together.
    pub fn check(&self) -> Result<()> {
        if self.election_timeout_min_ms == 0
            || self.election_timeout_min_ms > self.election_timeout_max_ms
        {
            return Err(StevedoreError::Internal(
                "election_timeout_min_ms must be positive and not above election_timeout_max_ms"
                    .into(),
            ));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(StevedoreError::Internal(
                "heartbeat_interval_ms must be below election_timeout_min_ms".into(),
            ));
        }
        if self.peers.iter().any(|p| p.node_id == self.node_id) {
            return Err(StevedoreError::Internal(
                "peers must not include this node".into(),
            ));
        }
        Ok(())
    }

    pub fn node_name(&self) -> String {
        if self.node_name.is_empty() {
            format!("node-{}", self.node_id)
        } else {
            self.node_name.clone()
        }
    }

    /// Address peers use to reach this node's RPC server.
    pub fn rpc_advertise_addr(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.listen_addr.to_string())
    }

    /// Voters needed before the first election; static peers always count.
    pub fn effective_bootstrap_expect(&self) -> usize {
        self.bootstrap_expect.max(self.peers.len() + 1)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
