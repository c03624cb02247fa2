use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::autopilot::Autopilot;
use crate::config::NodeConfig;
use crate::error::Result;
use crate::grpc::{GrpcServer, Proposer};
use crate::membership::{heartbeat_channel, MembershipMonitor};
use crate::model::{NodeRegistration, NodeStatus, Resources};
use crate::raft::{RaftMessage, RaftNode, RaftStorage};
use crate::scheduler::Planner;
use crate::state::{now_ms, ClusterState, Command, StateStore};
use crate::worker::{DriverRegistry, HeartbeatSender, Worker};

/// Main node that orchestrates all components
pub struct Node {
    pub config: NodeConfig,
    pub raft_node: Arc<RaftNode>,
    pub store: StateStore,
    pub proposer: Arc<Proposer>,
    raft_rx: mpsc::Receiver<RaftMessage>,
    heartbeat_rx: mpsc::Receiver<NodeRegistration>,
    heartbeat_tx: mpsc::Sender<NodeRegistration>,
}

impl Node {
    /// Build a node, recovering persisted consensus state from `data_dir`.
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.check()?;
        let storage = match &config.data_dir {
            Some(dir) => Some(Arc::new(RaftStorage::open(
                dir,
                config.node_id,
                &config.node_name(),
            )?)),
            None => None,
        };
        let (raft_node, raft_rx) = RaftNode::new(config.clone(), storage)?;
        let raft_node = Arc::new(raft_node);
        let (heartbeat_tx, heartbeat_rx) = heartbeat_channel();
        let proposer = Arc::new(Proposer::new(raft_node.clone(), heartbeat_tx.clone()));

        Ok(Self {
            config,
            raft_node,
            store: StateStore::new(),
            proposer,
            raft_rx,
            heartbeat_rx,
            heartbeat_tx,
        })
    }

    /// What this node advertises to the cluster.
    pub fn registration(&self) -> NodeRegistration {
        let rpc_addr = self.config.rpc_advertise_addr();
        let address = rpc_addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| rpc_addr.clone());
        let client = &self.config.client;
        NodeRegistration {
            id: self.config.node_id,
            name: self.config.node_name(),
            datacenter: self.config.datacenter.clone(),
            class: client.node_class.clone(),
            attributes: client.attributes.clone(),
            address,
            rpc_addr,
            http_addr: self.config.http_addr.to_string(),
            resources: if client.enabled {
                client.resources
            } else {
                Resources::default()
            },
        }
    }

    /// Bind both listeners and spawn every loop.
    ///
    /// Leader-only loops run everywhere and idle while this node follows.
    pub async fn start(self) -> Result<NodeHandle> {
        let http_listener = TcpListener::bind(self.config.http_addr).await?;
        let registration = self.registration();
        let address = registration.address.clone();
        let Node {
            config,
            raft_node,
            store,
            proposer,
            raft_rx,
            heartbeat_rx,
            heartbeat_tx,
        } = self;

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let server = GrpcServer::new(
            config.listen_addr,
            raft_node.clone(),
            heartbeat_tx,
            config.request_timeout * 2,
        );
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run(token).await {
                tracing::error!(error = %e, "gRPC server failed");
            }
        }));

        let raft = raft_node.clone();
        let token = cancel.clone();
        tasks.push(tokio::spawn(raft.run(raft_rx, token)));

        tasks.push(tokio::spawn(apply_loop(
            raft_node.clone(),
            store.clone(),
            config.snapshot_threshold,
            cancel.clone(),
        )));

        let monitor = MembershipMonitor::new(
            proposer.clone(),
            store.clone(),
            &config.membership,
            heartbeat_rx,
            config.request_timeout,
        );
        tasks.push(tokio::spawn(monitor.run(cancel.clone())));

        let heartbeat = HeartbeatSender::new(
            registration,
            proposer.clone(),
            config.membership.heartbeat_interval,
        );
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move { heartbeat.run(token).await }));

        let planner = Planner::new(proposer.clone(), store.clone(), config.request_timeout);
        tasks.push(tokio::spawn(planner.run(cancel.clone())));

        if config.autopilot.enabled {
            let autopilot = Autopilot::new(
                proposer.clone(),
                store.clone(),
                config.autopilot.clone(),
                config.request_timeout,
            );
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move { autopilot.run(token).await }));
        }

        if config.client.enabled {
            let worker = Worker::new(
                config.node_id,
                address,
                proposer.clone(),
                store.clone(),
                DriverRegistry::with_defaults(config.client.sandbox.clone()),
                config.request_timeout,
            );
            tasks.push(tokio::spawn(worker.run(cancel.clone())));
        }

        let api_state = ApiState::new(proposer.clone(), store.clone(), &config);
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = api::serve(http_listener, api_state, token).await {
                tracing::error!(error = %e, "Control API failed");
            }
        }));

        tracing::info!(
            node_id = config.node_id,
            rpc_addr = %config.rpc_advertise_addr(),
            http_addr = %config.http_addr,
            "Node started"
        );

        Ok(NodeHandle {
            config,
            raft_node,
            store,
            proposer,
            cancel,
            tasks,
        })
    }
}

/// Apply committed entries in order, restore installed snapshots and
/// compact the log once it grows past `snapshot_threshold`.
async fn apply_loop(
    raft: Arc<RaftNode>,
    store: StateStore,
    snapshot_threshold: usize,
    cancel: CancellationToken,
) {
    let mut commits = raft.subscribe_commits();
    loop {
        let batch = raft.take_committed().await;
        let mut voters_changed = false;

        if let Some(snapshot) = batch.snapshot {
            match ClusterState::from_bytes(&snapshot.data) {
                Ok(state) => {
                    tracing::info!(
                        node_id = raft.id,
                        index = snapshot.last_included_index,
                        "Restored state from snapshot"
                    );
                    store.restore(state).await;
                    voters_changed = true;
                }
                Err(e) => {
                    tracing::error!(node_id = raft.id, error = %e, "Failed to decode snapshot");
                }
            }
        }
        if !batch.entries.is_empty() {
            voters_changed |= batch.entries.iter().any(|e| e.command.changes_voters());
            store.apply_entries(&batch.entries).await;
        }
        if voters_changed {
            raft.set_voters(store.snapshot().await.voters.clone()).await;
        }

        if raft.should_compact(snapshot_threshold).await {
            let state = store.snapshot().await;
            match state.to_bytes() {
                Ok(data) => {
                    if let Err(e) = raft.compact(state.last_applied, data).await {
                        tracing::error!(node_id = raft.id, error = %e, "Compaction failed");
                    }
                }
                Err(e) => tracing::error!(error = %e, "Failed to encode snapshot"),
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = commits.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

/// A running node. Dropping it aborts every task.
pub struct NodeHandle {
    pub config: NodeConfig,
    pub raft_node: Arc<RaftNode>,
    pub store: StateStore,
    pub proposer: Arc<Proposer>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn node_id(&self) -> u64 {
        self.config.node_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Record this node as `left` so autopilot can drop it right away.
    pub async fn leave(&self) -> Result<()> {
        let command = Command::UpdateNodeStatus {
            node_id: self.config.node_id,
            status: NodeStatus::Left,
            at_ms: now_ms(),
        };
        self.proposer
            .propose_with_retry(None, command, self.config.request_timeout)
            .await?;
        tracing::info!(node_id = self.config.node_id, "Left the cluster");
        Ok(())
    }

    /// Stop every loop and wait for them, up to `grace`.
    pub async fn shutdown(mut self, grace: Duration) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut self.tasks);
        let drained = tokio::time::timeout(grace, async {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(node_id = self.config.node_id, "Shutdown grace period elapsed");
        }
    }

    /// Simulate a crash: abort every task without any goodbye.
    pub fn kill(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.kill();
    }
}
