use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::grpc::Proposer;
use crate::membership::health::run_check;
use crate::model::{
    AllocStatus, Allocation, CheckSpec, HealthCheckResult, ServiceRegistration,
};
use crate::scheduler::{RestartDecision, RestartTracker};
use crate::state::{now_ms, Command};
use crate::worker::executor::{TaskDriver, TaskExit};

enum Outcome {
    Exited(TaskExit),
    Stopped,
    Shutdown,
}

/// Drives one allocation on the node that hosts it: start the task, keep
/// its services and checks registered, restart it under its policy and
/// report every status change.
pub struct AllocRunner {
    alloc: Allocation,
    driver: Arc<dyn TaskDriver>,
    proposer: Arc<Proposer>,
    /// Address services of this node are reachable on.
    address: String,
    request_timeout: Duration,
    tracker: RestartTracker,
}

impl AllocRunner {
    pub fn new(
        alloc: Allocation,
        driver: Arc<dyn TaskDriver>,
        proposer: Arc<Proposer>,
        address: String,
        request_timeout: Duration,
    ) -> Self {
        let tracker = RestartTracker::new(alloc.restart.clone());
        Self {
            alloc,
            driver,
            proposer,
            address,
            request_timeout,
            tracker,
        }
    }

    /// Run until the task finishes for good, `stop` fires (the scheduler
    /// wants it gone) or `shutdown` fires (this node is going away).
    pub async fn run(mut self, stop: CancellationToken, shutdown: CancellationToken) {
        let alloc_id = self.alloc.id;
        let checks = shutdown.child_token();
        let mut services_registered = false;

        loop {
            let mut handle = match self.driver.start(alloc_id, &self.alloc.task).await {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!(alloc_id = %alloc_id, error = %e, "Task failed to start");
                    if self.after_failure(format!("start failed: {}", e), &stop, &shutdown).await {
                        continue;
                    }
                    break;
                }
            };

            self.report(AllocStatus::Running, None).await;
            if !services_registered {
                self.register_services(&checks).await;
                services_registered = true;
            }

            let outcome = tokio::select! {
                exit = handle.wait() => Outcome::Exited(exit),
                _ = stop.cancelled() => Outcome::Stopped,
                _ = shutdown.cancelled() => Outcome::Shutdown,
            };
            match outcome {
                Outcome::Exited(exit) if exit.success() => {
                    tracing::info!(alloc_id = %alloc_id, "Task completed");
                    self.report(AllocStatus::Complete, Some(exit.message)).await;
                    break;
                }
                Outcome::Exited(exit) => {
                    tracing::warn!(alloc_id = %alloc_id, exit = %exit.message, "Task failed");
                    if self.after_failure(exit.message, &stop, &shutdown).await {
                        continue;
                    }
                    break;
                }
                Outcome::Stopped => {
                    handle.kill().await;
                    tracing::info!(alloc_id = %alloc_id, "Task stopped");
                    self.report(AllocStatus::Complete, Some("stopped by scheduler".into())).await;
                    break;
                }
                Outcome::Shutdown => {
                    handle.kill().await;
                    break;
                }
            }
        }
        checks.cancel();
    }

    /// Apply the restart policy; returns whether to start the task again.
    async fn after_failure(
        &mut self,
        message: String,
        stop: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> bool {
        match self.tracker.on_failure(Instant::now()) {
            RestartDecision::Exhausted => {
                tracing::warn!(
                    alloc_id = %self.alloc.id,
                    restarts = self.tracker.restarts(),
                    "Restart attempts exhausted"
                );
                self.report(AllocStatus::Failed, Some(message)).await;
                false
            }
            RestartDecision::Restart { after } => {
                tracing::info!(
                    alloc_id = %self.alloc.id,
                    restart = self.tracker.restarts(),
                    delay_ms = after.as_millis() as u64,
                    "Restarting task"
                );
                tokio::select! {
                    _ = tokio::time::sleep(after) => true,
                    _ = stop.cancelled() => {
                        self.report(AllocStatus::Complete, Some("stopped by scheduler".into())).await;
                        false
                    }
                    _ = shutdown.cancelled() => false,
                }
            }
        }
    }

    async fn report(&self, status: AllocStatus, message: Option<String>) {
        let restarts = self.tracker.restarts();
        let command = Command::UpdateAllocationStatus {
            alloc_id: self.alloc.id,
            status,
            message,
            restarts,
            at_ms: now_ms(),
        };
        let request_id = format!("alloc-{}-{}-{}", self.alloc.id, status, restarts);
        if let Err(e) = self
            .proposer
            .propose_with_retry(Some(request_id), command, self.request_timeout)
            .await
        {
            tracing::warn!(alloc_id = %self.alloc.id, %status, error = %e, "Failed to report allocation status");
        }
    }

    async fn register_services(&self, checks_cancel: &CancellationToken) {
        for service in &self.alloc.task.services {
            let service_id = ServiceRegistration::service_id(self.alloc.id, &service.name);
            let checks: Vec<(String, &CheckSpec)> = service
                .checks
                .iter()
                .map(|c| (ServiceRegistration::check_id(&service_id, &c.name), c))
                .collect();
            let at_ms = now_ms();
            let command = Command::RegisterService {
                service: ServiceRegistration {
                    id: service_id.clone(),
                    name: service.name.clone(),
                    alloc_id: self.alloc.id,
                    node_id: self.alloc.node_id,
                    address: self.address.clone(),
                    port: service.port,
                    tags: service.tags.clone(),
                    check_ids: checks.iter().map(|(id, _)| id.clone()).collect(),
                },
                checks: checks
                    .iter()
                    .map(|(id, spec)| HealthCheckResult {
                        check_id: id.clone(),
                        service_id: service_id.clone(),
                        name: spec.name.clone(),
                        status: spec.initial_status,
                        output: String::new(),
                        updated_at_ms: at_ms,
                    })
                    .collect(),
                at_ms,
            };

            if let Err(e) = self
                .proposer
                .propose_with_retry(Some(format!("service-{}", service_id)), command, self.request_timeout)
                .await
            {
                tracing::warn!(service_id = %service_id, error = %e, "Failed to register service");
                continue;
            }
            tracing::info!(service_id = %service_id, name = %service.name, "Registered service");

            for (check_id, spec) in checks {
                tokio::spawn(run_check(
                    check_id,
                    spec.clone(),
                    self.address.clone(),
                    service.port,
                    self.proposer.clone(),
                    self.request_timeout,
                    checks_cancel.clone(),
                ));
            }
        }
    }
}
