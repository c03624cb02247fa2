use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::grpc::Proposer;
use crate::model::NodeRegistration;

/// Periodically reports this node's registration to the leader.
pub struct HeartbeatSender {
    registration: NodeRegistration,
    proposer: Arc<Proposer>,
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(registration: NodeRegistration, proposer: Arc<Proposer>, interval: Duration) -> Self {
        Self {
            registration,
            proposer,
            interval,
        }
    }

    /// Run the heartbeat sender until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.proposer.send_heartbeat(self.registration.clone()).await {
                tracing::trace!(node_id = self.registration.id, error = %e, "Heartbeat not delivered");
            }
        }
    }
}
