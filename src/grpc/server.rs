use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::consensus_service::ConsensusService;
use crate::grpc::internal_service::InternalServiceImpl;
use crate::model::NodeRegistration;
use crate::proto::internal_service_server::InternalServiceServer;
use crate::proto::raft_service_server::RaftServiceServer;
use crate::raft::RaftNode;

pub struct GrpcServer {
    addr: SocketAddr,
    raft_node: Arc<RaftNode>,
    heartbeats: mpsc::Sender<NodeRegistration>,
    max_timeout: Duration,
}

impl GrpcServer {
    pub fn new(
        addr: SocketAddr,
        raft_node: Arc<RaftNode>,
        heartbeats: mpsc::Sender<NodeRegistration>,
        max_timeout: Duration,
    ) -> Self {
        Self {
            addr,
            raft_node,
            heartbeats,
            max_timeout,
        }
    }

    /// Serve until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), tonic::transport::Error> {
        let consensus_service = ConsensusService::new(self.raft_node.clone());
        let internal_service =
            InternalServiceImpl::new(self.raft_node.clone(), self.heartbeats, self.max_timeout);

        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(RaftServiceServer::new(consensus_service))
            .add_service(InternalServiceServer::new(internal_service))
            .serve_with_shutdown(self.addr, cancel.cancelled_owned())
            .await
    }
}
