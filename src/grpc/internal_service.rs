use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tonic::{Request, Response, Status};

use crate::error::StevedoreError;
use crate::model::NodeRegistration;
use crate::proto::internal_service_server::InternalService;
use crate::proto::{ForwardRequest, ForwardResponse, HeartbeatRequest, HeartbeatResponse};
use crate::raft::RaftNode;
use crate::state::Command;

/// Node-to-leader service: proposals forwarded by followers and liveness
/// heartbeats feeding the leader's failure detector.
pub struct InternalServiceImpl {
    raft_node: Arc<RaftNode>,
    heartbeats: mpsc::Sender<NodeRegistration>,
    max_timeout: Duration,
}

impl InternalServiceImpl {
    pub fn new(
        raft_node: Arc<RaftNode>,
        heartbeats: mpsc::Sender<NodeRegistration>,
        max_timeout: Duration,
    ) -> Self {
        Self {
            raft_node,
            heartbeats,
            max_timeout,
        }
    }
}

#[tonic::async_trait]
impl InternalService for InternalServiceImpl {
    async fn forward(
        &self,
        request: Request<ForwardRequest>,
    ) -> Result<Response<ForwardResponse>, Status> {
        let req = request.into_inner();
        let command: Command = serde_json::from_slice(&req.command)
            .map_err(|e| Status::invalid_argument(format!("Invalid command: {}", e)))?;
        let timeout = Duration::from_millis(req.timeout_ms).min(self.max_timeout);
        let request_id = if req.request_id.is_empty() {
            None
        } else {
            Some(req.request_id)
        };

        tracing::debug!(
            command = command.name(),
            request_id = request_id.as_deref().unwrap_or_default(),
            "Received forwarded proposal"
        );

        let index = self.raft_node.propose(request_id, command, timeout).await?;
        Ok(Response::new(ForwardResponse { index }))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        if !self.raft_node.is_leader().await {
            let leader = self.raft_node.get_leader_id().await;
            return Err(StevedoreError::NotLeader(leader).into());
        }

        let registration: NodeRegistration = serde_json::from_slice(&request.into_inner().registration)
            .map_err(|e| Status::invalid_argument(format!("Invalid registration: {}", e)))?;
        tracing::trace!(peer_id = registration.id, "Received node heartbeat");

        if let Err(e) = self.heartbeats.try_send(registration) {
            // The detector is behind; the next heartbeat carries the same information.
            tracing::debug!(error = %e, "Dropped node heartbeat");
        }

        Ok(Response::new(HeartbeatResponse {
            leader_id: self.raft_node.id,
        }))
    }
}
