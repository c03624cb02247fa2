//! Node-local execution of allocations.
//!
//! - [`executor`]: the task driver interface and the `exec`/`docker` drivers
//! - [`runner`]: one [`AllocRunner`] per allocation placed on this node
//! - [`heartbeat`]: liveness reports to the leader
//!
//! The [`Worker`] watches the applied state and starts or stops runners so
//! that what runs here matches what the scheduler decided.

pub mod executor;
pub mod heartbeat;
pub mod runner;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::grpc::Proposer;
use crate::model::{AllocStatus, DesiredStatus};
use crate::state::{now_ms, Command, StateStore};

pub use executor::{DockerDriver, DriverRegistry, ExecDriver, TaskDriver, TaskExit, TaskHandle};
pub use heartbeat::HeartbeatSender;
pub use runner::AllocRunner;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

struct RunningAlloc {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Worker {
    node_id: u64,
    address: String,
    proposer: Arc<Proposer>,
    store: StateStore,
    drivers: DriverRegistry,
    request_timeout: Duration,
    running: HashMap<Uuid, RunningAlloc>,
    /// Allocations whose runner already finished in this process.
    finished: HashSet<Uuid>,
}

impl Worker {
    pub fn new(
        node_id: u64,
        address: String,
        proposer: Arc<Proposer>,
        store: StateStore,
        drivers: DriverRegistry,
        request_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            address,
            proposer,
            store,
            drivers,
            request_timeout,
            running: HashMap::new(),
            finished: HashSet::new(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut applied = self.store.subscribe();
        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                changed = applied.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            self.reconcile(&cancel).await;
        }

        for (_, running) in self.running.drain() {
            let _ = running.task.await;
        }
    }

    async fn reconcile(&mut self, shutdown: &CancellationToken) {
        let done: Vec<Uuid> = self
            .running
            .iter()
            .filter(|(_, r)| r.task.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in done {
            self.running.remove(&id);
            self.finished.insert(id);
        }

        let state = self.store.snapshot().await;
        for alloc in state.allocations_for_node(self.node_id) {
            if alloc.status.is_terminal() {
                self.finished.remove(&alloc.id);
                continue;
            }
            match alloc.desired {
                DesiredStatus::Stop => {
                    if let Some(running) = self.running.get(&alloc.id) {
                        if !running.stop.is_cancelled() {
                            tracing::info!(alloc_id = %alloc.id, "Stopping allocation");
                            running.stop.cancel();
                        }
                    } else if !self.finished.contains(&alloc.id) {
                        // Never started here; just record that it is done.
                        self.mark_stopped(alloc.id).await;
                        self.finished.insert(alloc.id);
                    }
                }
                DesiredStatus::Run => {
                    if self.running.contains_key(&alloc.id) || self.finished.contains(&alloc.id) {
                        continue;
                    }
                    let driver = match self.drivers.get(&alloc.task.driver) {
                        Ok(driver) => driver,
                        Err(e) => {
                            tracing::warn!(alloc_id = %alloc.id, error = %e, "Cannot run allocation");
                            self.finished.insert(alloc.id);
                            self.report_failed(alloc.id, e.to_string()).await;
                            continue;
                        }
                    };
                    tracing::info!(
                        alloc_id = %alloc.id,
                        job_id = %alloc.job_id,
                        slot = alloc.slot,
                        "Starting allocation"
                    );
                    let runner = AllocRunner::new(
                        alloc.clone(),
                        driver,
                        self.proposer.clone(),
                        self.address.clone(),
                        self.request_timeout,
                    );
                    let stop = CancellationToken::new();
                    let task = tokio::spawn(runner.run(stop.clone(), shutdown.clone()));
                    self.running.insert(alloc.id, RunningAlloc { stop, task });
                }
            }
        }
    }

    async fn mark_stopped(&self, alloc_id: Uuid) {
        self.send_status(alloc_id, AllocStatus::Complete, "stopped before start".into())
            .await;
    }

    async fn report_failed(&self, alloc_id: Uuid, message: String) {
        self.send_status(alloc_id, AllocStatus::Failed, message).await;
    }

    async fn send_status(&self, alloc_id: Uuid, status: AllocStatus, message: String) {
        let command = Command::UpdateAllocationStatus {
            alloc_id,
            status,
            message: Some(message),
            restarts: 0,
            at_ms: now_ms(),
        };
        if let Err(e) = self
            .proposer
            .propose_with_retry(None, command, self.request_timeout)
            .await
        {
            tracing::warn!(alloc_id = %alloc_id, error = %e, "Failed to report allocation status");
        }
    }
}
