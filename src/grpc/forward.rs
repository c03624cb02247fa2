use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint};

use crate::error::{Result, StevedoreError};
use crate::model::NodeRegistration;
use crate::proto::internal_service_client::InternalServiceClient;
use crate::proto::{ForwardRequest, HeartbeatRequest};
use crate::raft::RaftNode;
use crate::state::Command;

/// Slack added on top of the proposal timeout for the forwarding hop.
const FORWARD_GRACE: Duration = Duration::from_millis(500);

/// Entry point for every write on a node.
///
/// Commands proposed on the leader go straight into its log; on a follower
/// they are forwarded over `InternalService.Forward`.
pub struct Proposer {
    raft: Arc<RaftNode>,
    clients: Mutex<HashMap<String, InternalServiceClient<Channel>>>,
    /// Registrations reported by this node while it leads.
    local_heartbeats: mpsc::Sender<NodeRegistration>,
}

impl Proposer {
    pub fn new(raft: Arc<RaftNode>, local_heartbeats: mpsc::Sender<NodeRegistration>) -> Self {
        Self {
            raft,
            clients: Mutex::new(HashMap::new()),
            local_heartbeats,
        }
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    async fn client_for(&self, addr: &str) -> Result<InternalServiceClient<Channel>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(addr) {
            return Ok(client.clone());
        }
        let channel = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| StevedoreError::Internal(format!("invalid leader address {}: {}", addr, e)))?
            .connect_timeout(Duration::from_secs(1))
            .connect_lazy();
        let client = InternalServiceClient::new(channel);
        clients.insert(addr.to_string(), client.clone());
        Ok(client)
    }

    /// RPC address of the current leader, as seen from this node.
    async fn leader_addr(&self) -> Result<(u64, String)> {
        let leader = self.raft.get_leader_id().await.ok_or(StevedoreError::NoLeader)?;
        if self.raft.is_disconnected(leader).await {
            return Err(StevedoreError::NoLeader);
        }
        let addr = self
            .raft
            .peer_addr(leader)
            .await
            .ok_or(StevedoreError::NoLeader)?;
        Ok((leader, addr))
    }

    /// Propose once, on the leader or through it, and wait for the commit.
    pub async fn propose(
        &self,
        request_id: Option<String>,
        command: Command,
        timeout: Duration,
    ) -> Result<u64> {
        if self.raft.is_leader().await {
            return self.raft.propose(request_id, command, timeout).await;
        }

        let (leader, addr) = self.leader_addr().await?;
        let mut client = self.client_for(&addr).await?;
        let req = ForwardRequest {
            request_id: request_id.unwrap_or_default(),
            command: serde_json::to_vec(&command)?,
            timeout_ms: timeout.as_millis() as u64,
        };
        tracing::debug!(leader, command = command.name(), "Forwarding proposal to leader");

        match tokio::time::timeout(timeout + FORWARD_GRACE, client.forward(req)).await {
            Ok(Ok(resp)) => Ok(resp.into_inner().index),
            Ok(Err(status)) => Err(StevedoreError::from_status(status, timeout)),
            Err(_) => Err(StevedoreError::ProposalTimeout(timeout)),
        }
    }

    /// Propose, retrying transient failures with the same request id until
    /// `timeout` runs out. Deduplication at apply makes the retries safe.
    pub async fn propose_with_retry(
        &self,
        request_id: Option<String>,
        command: Command,
        timeout: Duration,
    ) -> Result<u64> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Duration::from_millis(50);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let err = match self
                .propose(request_id.clone(), command.clone(), remaining)
                .await
            {
                Ok(index) => return Ok(index),
                Err(e) => e,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining <= backoff {
                return Err(err);
            }
            tracing::debug!(
                command = command.name(),
                error = %err,
                retry_in_ms = backoff.as_millis() as u64,
                "Retrying proposal"
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(1));
        }
    }

    /// Report this node's registration to the leader's failure detector.
    pub async fn send_heartbeat(&self, registration: NodeRegistration) -> Result<()> {
        if self.raft.is_leader().await {
            if let Err(e) = self.local_heartbeats.try_send(registration) {
                tracing::debug!(error = %e, "Dropped local heartbeat");
            }
            return Ok(());
        }

        let (_, addr) = self.leader_addr().await?;
        let mut client = self.client_for(&addr).await?;
        let req = HeartbeatRequest {
            registration: serde_json::to_vec(&registration)?,
        };
        let rpc_timeout = Duration::from_secs(2);
        match tokio::time::timeout(rpc_timeout, client.heartbeat(req)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(status)) => Err(StevedoreError::from_status(status, rpc_timeout)),
            Err(_) => Err(StevedoreError::NoLeader),
        }
    }
}
