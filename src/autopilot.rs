//! Leader-only pruning of dead voters.
//!
//! A voter that left, or stayed dead past the configured threshold, still
//! counts toward the quorum size. Autopilot removes such voters one per
//! pass so a shrinking cluster keeps committing. A node whose voter entry is
//! already gone but whose registration survived is deregistered on its own.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AutopilotConfig;
use crate::grpc::Proposer;
use crate::model::{Node, NodeStatus};
use crate::state::{now_ms, ClusterState, Command, StateStore};

/// The next voter to remove, if any.
///
/// Never picks `self_id` and never shrinks the voter set below
/// `max(min_quorum, 1)`. Candidates are considered in id order.
pub fn dead_server(
    state: &ClusterState,
    self_id: u64,
    now_ms: i64,
    threshold: Duration,
    min_quorum: usize,
) -> Option<u64> {
    if state.voters.len() <= min_quorum.max(1) {
        return None;
    }
    state
        .voters
        .keys()
        .copied()
        .filter(|id| *id != self_id)
        .find(|id| {
            state
                .nodes
                .get(id)
                .map(|node| is_gone(node, now_ms, threshold))
                .unwrap_or(false)
        })
}

/// A registered node that is gone but no longer a voter.
///
/// Left behind when `RemoveVoter` committed and the following
/// `DeregisterNode` did not.
pub fn orphaned_node(
    state: &ClusterState,
    self_id: u64,
    now_ms: i64,
    threshold: Duration,
) -> Option<u64> {
    state
        .nodes
        .values()
        .filter(|node| node.registration.id != self_id)
        .filter(|node| !state.voters.contains_key(&node.registration.id))
        .find(|node| is_gone(node, now_ms, threshold))
        .map(|node| node.registration.id)
}

fn is_gone(node: &Node, now_ms: i64, threshold: Duration) -> bool {
    match node.status {
        NodeStatus::Left => true,
        NodeStatus::Dead => now_ms - node.status_updated_at_ms >= threshold.as_millis() as i64,
        _ => false,
    }
}

pub struct Autopilot {
    proposer: Arc<Proposer>,
    store: StateStore,
    config: AutopilotConfig,
    request_timeout: Duration,
}

impl Autopilot {
    pub fn new(
        proposer: Arc<Proposer>,
        store: StateStore,
        config: AutopilotConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            proposer,
            store,
            config,
            request_timeout,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if !self.proposer.raft().is_leader().await {
                continue;
            }
            if let Err(e) = self.prune_once().await {
                tracing::warn!(error = %e, "Autopilot pass failed");
            }
        }
    }

    /// Remove at most one dead voter, or else deregister one orphaned node.
    /// Returns the pruned node id.
    pub async fn prune_once(&self) -> crate::error::Result<Option<u64>> {
        let raft = self.proposer.raft();
        let state = self.store.snapshot().await;
        let now = now_ms();
        let threshold = self.config.dead_server_threshold;

        if let Some(node_id) = dead_server(&state, raft.id, now, threshold, self.config.min_quorum) {
            tracing::info!(
                node_id,
                voters = state.voters.len(),
                "Removing dead server from voters"
            );
            self.proposer
                .propose(None, Command::RemoveVoter { node_id }, self.request_timeout)
                .await?;
            self.deregister(node_id).await?;
            return Ok(Some(node_id));
        }

        if let Some(node_id) = orphaned_node(&state, raft.id, now, threshold) {
            tracing::info!(node_id, "Deregistering node that is no longer a voter");
            self.deregister(node_id).await?;
            return Ok(Some(node_id));
        }
        Ok(None)
    }

    async fn deregister(&self, node_id: u64) -> crate::error::Result<()> {
        self.proposer
            .propose(
                None,
                Command::DeregisterNode {
                    node_id,
                    at_ms: now_ms(),
                },
                self.request_timeout,
            )
            .await?;
        Ok(())
    }
}
