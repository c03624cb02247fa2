use std::sync::Arc;
use tonic::{Request, Response, Status};

use crate::proto::raft_service_server::RaftService;
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    JoinRequest, JoinResponse, VoteRequest, VoteResponse,
};
use crate::raft::RaftNode;

/// Server half of the consensus protocol: votes, replication, snapshot
/// transfer and pre-bootstrap discovery between voters.
pub struct ConsensusService {
    raft_node: Arc<RaftNode>,
}

impl ConsensusService {
    pub fn new(raft_node: Arc<RaftNode>) -> Self {
        Self { raft_node }
    }
}

#[tonic::async_trait]
impl RaftService for ConsensusService {
    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(
            node_id = self.raft_node.id,
            candidate = req.candidate_id,
            term = req.term,
            last_log_index = req.last_log_index,
            "Vote requested"
        );

        let response = self.raft_node.handle_vote_request(req).await;
        Ok(Response::new(response))
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let req = request.into_inner();
        if !req.entries.is_empty() {
            tracing::trace!(
                node_id = self.raft_node.id,
                leader = req.leader_id,
                term = req.term,
                prev_log_index = req.prev_log_index,
                entries = req.entries.len(),
                "Replicating entries"
            );
        }

        let response = self.raft_node.handle_append_entries(req).await?;
        Ok(Response::new(response))
    }

    async fn install_snapshot(
        &self,
        request: Request<InstallSnapshotRequest>,
    ) -> Result<Response<InstallSnapshotResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(
            leader = req.leader_id,
            term = req.term,
            last_included_index = req.last_included_index,
            bytes = req.data.len(),
            "Installing snapshot from leader"
        );

        let response = self.raft_node.handle_install_snapshot(req).await?;
        Ok(Response::new(response))
    }

    async fn join(&self, request: Request<JoinRequest>) -> Result<Response<JoinResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(peer_id = req.node_id, addr = %req.rpc_addr, "Peer asked to join");

        let response = self.raft_node.handle_join(req).await;
        Ok(Response::new(response))
    }
}
