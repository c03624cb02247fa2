//! Node liveness and service health.
//!
//! Every node reports its registration to the leader; the leader's
//! [`MembershipMonitor`] turns those reports, and their absence, into
//! proposed commands.

pub mod detector;
pub mod health;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::MembershipConfig;
use crate::grpc::Proposer;
use crate::model::NodeRegistration;
use crate::state::{now_ms, StateStore};

pub use detector::FailureDetector;
pub use health::{CheckTracker, ProbeResult};

/// Bounded queue between heartbeat receivers and the monitor.
pub const HEARTBEAT_QUEUE: usize = 1024;

pub fn heartbeat_channel() -> (mpsc::Sender<NodeRegistration>, mpsc::Receiver<NodeRegistration>) {
    mpsc::channel(HEARTBEAT_QUEUE)
}

/// Leader-only loop feeding the failure detector.
pub struct MembershipMonitor {
    proposer: Arc<Proposer>,
    store: StateStore,
    detector: FailureDetector,
    heartbeats: mpsc::Receiver<NodeRegistration>,
    interval: Duration,
    request_timeout: Duration,
}

impl MembershipMonitor {
    pub fn new(
        proposer: Arc<Proposer>,
        store: StateStore,
        config: &MembershipConfig,
        heartbeats: mpsc::Receiver<NodeRegistration>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            proposer,
            store,
            detector: FailureDetector::new(config),
            heartbeats,
            interval: config.heartbeat_interval,
            request_timeout,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        let mut leading_term: Option<u64> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                Some(registration) = self.heartbeats.recv() => {
                    if leading_term.is_some() {
                        self.detector.observe(registration, Instant::now());
                    }
                }
                _ = ticker.tick() => {
                    let raft = self.proposer.raft();
                    if !raft.is_leader().await {
                        if leading_term.take().is_some() {
                            self.detector.reset();
                        }
                        continue;
                    }
                    let term = raft.current_term().await;
                    if leading_term != Some(term) {
                        tracing::info!(term, "Membership monitor active");
                        self.detector.reset();
                        leading_term = Some(term);
                    }
                    self.evaluate().await;
                }
            }
        }
    }

    async fn evaluate(&mut self) {
        let state = self.store.snapshot().await;
        let commands = self.detector.evaluate(&state, Instant::now(), now_ms());
        let mut last_index = 0;
        for command in commands {
            let name = command.name();
            match self.proposer.propose(None, command, self.request_timeout).await {
                Ok(index) => last_index = index,
                Err(e) => {
                    tracing::warn!(command = name, error = %e, "Membership proposal failed");
                    return;
                }
            }
        }
        if last_index > 0 {
            // Evaluate the next tick against a state that includes these changes.
            self.store.wait_for_index(last_index, self.request_timeout).await;
        }
    }
}
