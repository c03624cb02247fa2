use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::grpc::Proposer;
use crate::model::{
    AllocStatus, Allocation, DesiredStatus, JobType, Placement, PlacementFailure, RestartMode,
};
use crate::scheduler::placement::{select_node, Reservations};
use crate::scheduler::update::next_batch;
use crate::state::{now_ms, ClusterState, Command, StateStore};

/// Re-plan at least this often, so restart delays and staggers expire.
const PLAN_TICK: Duration = Duration::from_millis(250);

/// What a slot needs from the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotAction {
    Keep,
    Place { previous: Option<Uuid> },
}

fn slot_action(head: Option<&Allocation>, job_type: JobType, version: u64, now_ms: i64) -> SlotAction {
    let Some(alloc) = head else {
        return SlotAction::Place { previous: None };
    };
    let replace = SlotAction::Place {
        previous: Some(alloc.id),
    };
    if alloc.desired == DesiredStatus::Stop {
        return replace;
    }
    match alloc.status {
        AllocStatus::Pending | AllocStatus::Running => SlotAction::Keep,
        AllocStatus::Lost => replace,
        AllocStatus::Complete if job_type == JobType::Service || alloc.job_version != version => {
            replace
        }
        AllocStatus::Complete => SlotAction::Keep,
        AllocStatus::Failed if alloc.job_version != version => replace,
        AllocStatus::Failed => match alloc.restart.mode {
            RestartMode::Fail => SlotAction::Keep,
            RestartMode::Delay => {
                let due = alloc.modified_at_ms + alloc.restart.delay.as_millis() as i64;
                if now_ms >= due {
                    replace
                } else {
                    SlotAction::Keep
                }
            }
        },
    }
}

/// Commands that move the cluster towards every job's desired shape.
///
/// Pure: the caller supplies the time, and fresh allocation ids are the only
/// source of variation.
pub fn plan(state: &ClusterState, now_ms: i64) -> Vec<Command> {
    let mut commands = Vec::new();
    let mut reservations = Reservations::new();

    for (job_id, record) in &state.jobs {
        let Some(job) = record.job.as_concrete() else {
            continue;
        };
        let spec = &job.spec;

        // Allocations beyond the current count are stopped even when the job is done.
        for alloc in state.allocations_for_job(job_id) {
            if alloc.slot >= spec.count && alloc.desired == DesiredStatus::Run {
                commands.push(Command::StopAllocation {
                    alloc_id: alloc.id,
                    at_ms: now_ms,
                });
            }
        }
        if record.status.is_terminal() {
            continue;
        }

        let mut failure: Option<PlacementFailure> = None;
        let mut placed = false;
        let mut place = |previous: Option<Uuid>, slot: u32, commands: &mut Vec<Command>| {
            if failure.is_some() {
                return;
            }
            match select_node(state, spec, &reservations) {
                Ok(node_id) => {
                    reservations.reserve(node_id, &spec.task.resources);
                    placed = true;
                    commands.push(Command::PlaceAllocation {
                        placement: Placement {
                            alloc_id: Uuid::new_v4(),
                            job_id: job_id.clone(),
                            job_version: record.version,
                            slot,
                            node_id,
                            previous_allocation: previous,
                        },
                        at_ms: now_ms,
                    });
                }
                Err(reason) => failure = Some(reason),
            }
        };

        for slot in 0..spec.count {
            let head = state.slot_head(job_id, slot);
            if let SlotAction::Place { previous } =
                slot_action(head, spec.job_type, record.version, now_ms)
            {
                place(previous, slot, &mut commands);
            }
        }

        for old in next_batch(
            state,
            job_id,
            record.version,
            spec.count,
            spec.update.as_ref(),
            now_ms,
        ) {
            commands.push(Command::StopAllocation {
                alloc_id: old.id,
                at_ms: now_ms,
            });
            place(Some(old.id), old.slot, &mut commands);
        }

        if failure != record.blocked && (failure.is_some() || !placed) {
            commands.push(Command::UpdateJobPlacement {
                job_id: job_id.clone(),
                failure: failure.clone(),
                at_ms: now_ms,
            });
        }
        if let Some(reason) = failure {
            if record.blocked.as_ref() != Some(&reason) {
                tracing::info!(job_id = %job_id, reason = %reason, "Job blocked on placement");
            }
        }
    }
    commands
}

/// Leader-only loop turning [`plan`] output into proposals.
pub struct Planner {
    proposer: Arc<Proposer>,
    store: StateStore,
    request_timeout: Duration,
}

impl Planner {
    pub fn new(proposer: Arc<Proposer>, store: StateStore, request_timeout: Duration) -> Self {
        Self {
            proposer,
            store,
            request_timeout,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut applied = self.store.subscribe();
        let mut ticker = tokio::time::interval(PLAN_TICK);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
                changed = applied.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            if !self.proposer.raft().is_leader().await {
                continue;
            }
            self.plan_once().await;
        }
    }

    /// Plan against the current state and propose the result; returns the
    /// number of commands committed.
    pub async fn plan_once(&self) -> usize {
        let state = self.store.snapshot().await;
        let commands = plan(&state, now_ms());
        if commands.is_empty() {
            return 0;
        }

        let mut last_index = 0;
        let mut committed = 0;
        for command in commands {
            if let Command::PlaceAllocation { placement, .. } = &command {
                tracing::info!(
                    job_id = %placement.job_id,
                    alloc_id = %placement.alloc_id,
                    node_id = placement.node_id,
                    slot = placement.slot,
                    "Placing allocation"
                );
            }
            let name = command.name();
            match self.proposer.propose(None, command, self.request_timeout).await {
                Ok(index) => {
                    last_index = index;
                    committed += 1;
                }
                Err(e) => {
                    tracing::warn!(command = name, error = %e, "Scheduler proposal failed");
                    break;
                }
            }
        }
        if last_index > 0 {
            // Never plan twice against a state that misses our own decisions.
            self.store
                .wait_for_index(last_index, self.request_timeout)
                .await;
        }
        committed
    }
}
