//! Deterministic cluster state machine.
//!
//! Every node applies the same committed commands in the same order and
//! therefore holds identical tables. Nothing in here reads the clock, draws
//! random numbers or iterates over hash-ordered collections.

pub mod command;
pub mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, ValidationError};
use crate::model::{
    AllocStatus, Allocation, DesiredStatus, Job, JobRecord, JobSpec, JobStatus, JobType, Node,
    NodeStatus, Placement, Resources, RestartMode, ServiceRegistration,
};
use crate::model::{CheckStatus, HealthCheckResult};

pub use command::{now_ms, Command};
pub use store::StateStore;

/// Request ids remembered for deduplication.
pub const MAX_TRACKED_REQUESTS: usize = 10_000;

/// Why a committed command had no effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    UnknownNode(u64),
    UnknownJob(String),
    UnknownAllocation(Uuid),
    UnknownCheck(String),
    NotConcrete(String),
    NotTemplate(String),
    InvalidDispatch(ValidationError),
    JobStopped(String),
    StaleVersion { current: u64, proposed: u64 },
    SlotOutOfRange(u32),
    SlotOccupied(u32),
    DuplicateAllocation(Uuid),
    AlreadyReplaced(Uuid),
    NodeNotAlive(u64),
    ConstraintUnsatisfiable(String),
    CapacityExhausted { node_id: u64, dimension: String },
    AllocationTerminal(Uuid),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::UnknownNode(id) => write!(f, "unknown node {}", id),
            Rejection::UnknownJob(id) => write!(f, "unknown job {}", id),
            Rejection::UnknownAllocation(id) => write!(f, "unknown allocation {}", id),
            Rejection::UnknownCheck(id) => write!(f, "unknown check {}", id),
            Rejection::NotConcrete(id) => write!(f, "job {} is a template", id),
            Rejection::NotTemplate(id) => write!(f, "job {} is not parameterized", id),
            Rejection::InvalidDispatch(e) => write!(f, "dispatch rejected: {}", e),
            Rejection::JobStopped(id) => write!(f, "job {} is stopped", id),
            Rejection::StaleVersion { current, proposed } => {
                write!(f, "placement for version {} but job is at {}", proposed, current)
            }
            Rejection::SlotOutOfRange(slot) => write!(f, "slot {} beyond job count", slot),
            Rejection::SlotOccupied(slot) => write!(f, "slot {} already has a live allocation", slot),
            Rejection::DuplicateAllocation(id) => write!(f, "allocation {} already exists", id),
            Rejection::AlreadyReplaced(id) => write!(f, "allocation {} already replaced", id),
            Rejection::NodeNotAlive(id) => write!(f, "node {} is not alive", id),
            Rejection::ConstraintUnsatisfiable(c) => write!(f, "constraint {} not satisfied", c),
            Rejection::CapacityExhausted { node_id, dimension } => {
                write!(f, "node {} has insufficient {}", node_id, dimension)
            }
            Rejection::AllocationTerminal(id) => write!(f, "allocation {} already terminal", id),
        }
    }
}

impl Rejection {
    /// Machine-readable reason code surfaced to API callers.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Rejection::UnknownNode(_) => "node_not_found",
            Rejection::UnknownJob(_) => "job_not_found",
            Rejection::UnknownAllocation(_) => "allocation_not_found",
            Rejection::UnknownCheck(_) => "check_not_found",
            Rejection::NotConcrete(_) => "job_is_template",
            Rejection::NotTemplate(_) => "not_parameterized",
            Rejection::InvalidDispatch(_) => "validation_failed",
            Rejection::JobStopped(_) => "job_stopped",
            Rejection::StaleVersion { .. } => "stale_version",
            Rejection::SlotOutOfRange(_) => "slot_out_of_range",
            Rejection::SlotOccupied(_) => "slot_occupied",
            Rejection::DuplicateAllocation(_) => "duplicate_allocation",
            Rejection::AlreadyReplaced(_) => "already_replaced",
            Rejection::NodeNotAlive(_) => "node_not_alive",
            Rejection::ConstraintUnsatisfiable(_) => "constraint_unsatisfiable",
            Rejection::CapacityExhausted { .. } => "insufficient_resources",
            Rejection::AllocationTerminal(_) => "allocation_terminal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The request id was already applied at `first_index`.
    Duplicate { first_index: u64 },
    Rejected(Rejection),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub nodes: BTreeMap<u64, Node>,
    pub jobs: BTreeMap<String, JobRecord>,
    pub allocations: BTreeMap<Uuid, Allocation>,
    pub services: BTreeMap<String, ServiceRegistration>,
    pub checks: BTreeMap<String, HealthCheckResult>,
    /// Raft voters, node id to RPC address.
    pub voters: BTreeMap<u64, String>,
    applied_requests: BTreeMap<String, u64>,
    request_order: BTreeMap<u64, String>,
    pub last_applied: u64,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Index at which a request id was applied, if still remembered.
    pub fn applied_request(&self, request_id: &str) -> Option<u64> {
        self.applied_requests.get(request_id).copied()
    }

    /// Apply one committed log entry.
    pub fn apply(&mut self, index: u64, request_id: Option<&str>, command: &Command) -> ApplyOutcome {
        self.last_applied = self.last_applied.max(index);

        if let Some(id) = request_id {
            if let Some(first_index) = self.applied_request(id) {
                return ApplyOutcome::Duplicate { first_index };
            }
        }

        match self.apply_command(command) {
            Ok(()) => {
                if let Some(id) = request_id {
                    self.remember_request(id, index);
                }
                ApplyOutcome::Applied
            }
            Err(rejection) => ApplyOutcome::Rejected(rejection),
        }
    }

    fn remember_request(&mut self, request_id: &str, index: u64) {
        self.applied_requests.insert(request_id.to_string(), index);
        self.request_order.insert(index, request_id.to_string());
        while self.request_order.len() > MAX_TRACKED_REQUESTS {
            if let Some((_, old)) = self.request_order.pop_first() {
                self.applied_requests.remove(&old);
            }
        }
    }

    fn apply_command(&mut self, command: &Command) -> std::result::Result<(), Rejection> {
        match command {
            Command::Noop => Ok(()),
            Command::RegisterNode {
                registration,
                at_ms,
            } => {
                match self.nodes.get_mut(&registration.id) {
                    Some(node) => {
                        node.registration = registration.clone();
                        if node.status != NodeStatus::Alive {
                            node.status = NodeStatus::Alive;
                            node.status_updated_at_ms = *at_ms;
                        }
                    }
                    None => {
                        self.nodes.insert(
                            registration.id,
                            Node {
                                registration: registration.clone(),
                                status: NodeStatus::Alive,
                                status_updated_at_ms: *at_ms,
                                registered_at_ms: *at_ms,
                            },
                        );
                    }
                }
                Ok(())
            }
            Command::UpdateNodeStatus {
                node_id,
                status,
                at_ms,
            } => {
                let node = self
                    .nodes
                    .get_mut(node_id)
                    .ok_or(Rejection::UnknownNode(*node_id))?;
                if node.status == *status {
                    return Ok(());
                }
                node.status = *status;
                node.status_updated_at_ms = *at_ms;
                if status.is_gone() {
                    self.mark_node_allocations_lost(*node_id, *at_ms, &format!("node {}", status));
                }
                Ok(())
            }
            Command::DeregisterNode { node_id, at_ms } => {
                self.nodes
                    .remove(node_id)
                    .ok_or(Rejection::UnknownNode(*node_id))?;
                self.mark_node_allocations_lost(*node_id, *at_ms, "node deregistered");
                Ok(())
            }
            Command::SubmitJob { job, at_ms } => self.submit_job(job, *at_ms),
            Command::StopJob { job_id, at_ms } => {
                let record = self
                    .jobs
                    .get_mut(job_id)
                    .ok_or_else(|| Rejection::UnknownJob(job_id.clone()))?;
                record.status = JobStatus::Stopped;
                record.blocked = None;
                record.modified_at_ms = *at_ms;
                for alloc in self.allocations.values_mut() {
                    if alloc.job_id == *job_id && alloc.desired == DesiredStatus::Run {
                        alloc.desired = DesiredStatus::Stop;
                        alloc.modified_at_ms = *at_ms;
                    }
                }
                Ok(())
            }
            Command::DispatchJob {
                parent_id,
                child_id,
                meta,
                at_ms,
            } => {
                if self.jobs.contains_key(child_id) {
                    return Ok(());
                }
                let record = self
                    .jobs
                    .get(parent_id)
                    .ok_or_else(|| Rejection::UnknownJob(parent_id.clone()))?;
                if record.status == JobStatus::Stopped {
                    return Err(Rejection::JobStopped(parent_id.clone()));
                }
                let template = record
                    .job
                    .as_template()
                    .ok_or_else(|| Rejection::NotTemplate(parent_id.clone()))?;
                let child = crate::scheduler::dispatch(template, meta, child_id)
                    .map_err(Rejection::InvalidDispatch)?;
                self.submit_job(&Job::Concrete(child), *at_ms)
            }
            Command::UpdateJobPlacement {
                job_id,
                failure,
                at_ms,
            } => {
                let record = self
                    .jobs
                    .get_mut(job_id)
                    .ok_or_else(|| Rejection::UnknownJob(job_id.clone()))?;
                if record.blocked != *failure {
                    record.blocked = failure.clone();
                    record.modified_at_ms = *at_ms;
                }
                Ok(())
            }
            Command::PlaceAllocation { placement, at_ms } => self.place(placement, *at_ms),
            Command::StopAllocation { alloc_id, at_ms } => {
                let alloc = self
                    .allocations
                    .get_mut(alloc_id)
                    .ok_or(Rejection::UnknownAllocation(*alloc_id))?;
                alloc.desired = DesiredStatus::Stop;
                alloc.modified_at_ms = *at_ms;
                Ok(())
            }
            Command::UpdateAllocationStatus {
                alloc_id,
                status,
                message,
                restarts,
                at_ms,
            } => {
                let alloc = self
                    .allocations
                    .get_mut(alloc_id)
                    .ok_or(Rejection::UnknownAllocation(*alloc_id))?;
                if alloc.status.is_terminal() {
                    return Err(Rejection::AllocationTerminal(*alloc_id));
                }
                alloc.status = *status;
                alloc.message = message.clone();
                alloc.restarts = *restarts;
                alloc.modified_at_ms = *at_ms;
                let job_id = alloc.job_id.clone();
                if status.is_terminal() {
                    self.remove_services_for_alloc(*alloc_id);
                }
                self.refresh_job_status(&job_id, *at_ms);
                Ok(())
            }
            Command::RegisterService {
                service, checks, ..
            } => {
                let alloc = self
                    .allocations
                    .get(&service.alloc_id)
                    .ok_or(Rejection::UnknownAllocation(service.alloc_id))?;
                if alloc.status.is_terminal() {
                    return Err(Rejection::AllocationTerminal(alloc.id));
                }
                self.services.insert(service.id.clone(), service.clone());
                for check in checks {
                    self.checks.insert(check.check_id.clone(), check.clone());
                }
                Ok(())
            }
            Command::DeregisterService { service_id, .. } => {
                self.remove_service(service_id);
                Ok(())
            }
            Command::UpdateCheck {
                check_id,
                status,
                output,
                at_ms,
            } => {
                let check = self
                    .checks
                    .get_mut(check_id)
                    .ok_or_else(|| Rejection::UnknownCheck(check_id.clone()))?;
                check.status = *status;
                check.output = output.clone();
                check.updated_at_ms = *at_ms;
                Ok(())
            }
            Command::AddVoter { node_id, rpc_addr } => {
                self.voters.insert(*node_id, rpc_addr.clone());
                Ok(())
            }
            Command::RemoveVoter { node_id } => {
                self.voters.remove(node_id);
                Ok(())
            }
        }
    }

    fn submit_job(&mut self, job: &Job, at_ms: i64) -> std::result::Result<(), Rejection> {
        if let Some(parent) = job.as_concrete().and_then(|j| j.parent_id.as_ref()) {
            let is_template = self
                .jobs
                .get(parent)
                .map(|r| r.job.as_template().is_some())
                .unwrap_or(false);
            if !is_template {
                return Err(Rejection::UnknownJob(parent.clone()));
            }
        }

        let id = job.id().to_string();
        let initial = if job.as_template().is_some() {
            JobStatus::Running
        } else {
            JobStatus::Pending
        };
        match self.jobs.get_mut(&id) {
            Some(record) => {
                if record.job == *job && record.status != JobStatus::Stopped {
                    return Ok(());
                }
                record.job = job.clone();
                record.version += 1;
                record.status = initial;
                record.blocked = None;
                record.modified_at_ms = at_ms;
            }
            None => {
                self.jobs.insert(
                    id.clone(),
                    JobRecord {
                        job: job.clone(),
                        version: 0,
                        status: initial,
                        blocked: None,
                        submitted_at_ms: at_ms,
                        modified_at_ms: at_ms,
                    },
                );
            }
        }
        self.refresh_job_status(&id, at_ms);
        Ok(())
    }

    /// Re-validate a scheduler decision against the current tables.
    fn place(&mut self, p: &Placement, at_ms: i64) -> std::result::Result<(), Rejection> {
        let record = self
            .jobs
            .get(&p.job_id)
            .ok_or_else(|| Rejection::UnknownJob(p.job_id.clone()))?;
        let job = record
            .job
            .as_concrete()
            .ok_or_else(|| Rejection::NotConcrete(p.job_id.clone()))?;
        if record.status == JobStatus::Stopped {
            return Err(Rejection::JobStopped(p.job_id.clone()));
        }
        if p.job_version != record.version {
            return Err(Rejection::StaleVersion {
                current: record.version,
                proposed: p.job_version,
            });
        }
        if p.slot >= job.spec.count {
            return Err(Rejection::SlotOutOfRange(p.slot));
        }
        if self.allocations.contains_key(&p.alloc_id) {
            return Err(Rejection::DuplicateAllocation(p.alloc_id));
        }

        let node = self
            .nodes
            .get(&p.node_id)
            .ok_or(Rejection::UnknownNode(p.node_id))?;
        if !node.status.is_schedulable() {
            return Err(Rejection::NodeNotAlive(p.node_id));
        }
        if let Some(c) = job
            .spec
            .constraints
            .iter()
            .find(|c| !c.is_satisfied_by(&node.registration))
        {
            return Err(Rejection::ConstraintUnsatisfiable(c.to_string()));
        }
        if self
            .allocations
            .values()
            .any(|a| a.job_id == p.job_id && a.slot == p.slot && a.consumes_capacity())
        {
            return Err(Rejection::SlotOccupied(p.slot));
        }
        if let Some(prev) = p.previous_allocation {
            let previous = self
                .allocations
                .get(&prev)
                .ok_or(Rejection::UnknownAllocation(prev))?;
            if previous.next_allocation.is_some() {
                return Err(Rejection::AlreadyReplaced(prev));
            }
        }

        let available = node
            .registration
            .resources
            .saturating_sub(&self.node_used(p.node_id));
        if let Some(dimension) = job.spec.task.resources.exceeded_dimension(&available) {
            return Err(Rejection::CapacityExhausted {
                node_id: p.node_id,
                dimension: dimension.to_string(),
            });
        }

        let alloc = Allocation {
            id: p.alloc_id,
            job_id: p.job_id.clone(),
            job_version: p.job_version,
            slot: p.slot,
            node_id: p.node_id,
            task: job.spec.task.clone(),
            restart: job.spec.restart.clone(),
            desired: DesiredStatus::Run,
            status: AllocStatus::Pending,
            message: None,
            restarts: 0,
            previous_allocation: p.previous_allocation,
            next_allocation: None,
            created_at_ms: at_ms,
            modified_at_ms: at_ms,
        };
        self.allocations.insert(alloc.id, alloc);
        if let Some(prev) = p.previous_allocation.and_then(|id| self.allocations.get_mut(&id)) {
            prev.next_allocation = Some(p.alloc_id);
        }
        if let Some(record) = self.jobs.get_mut(&p.job_id) {
            record.blocked = None;
        }
        self.refresh_job_status(&p.job_id, at_ms);
        Ok(())
    }

    fn mark_node_allocations_lost(&mut self, node_id: u64, at_ms: i64, reason: &str) {
        let lost: Vec<Uuid> = self
            .allocations
            .values()
            .filter(|a| a.node_id == node_id && !a.status.is_terminal())
            .map(|a| a.id)
            .collect();

        let mut jobs = BTreeSet::new();
        for id in lost {
            if let Some(alloc) = self.allocations.get_mut(&id) {
                alloc.status = AllocStatus::Lost;
                alloc.message = Some(reason.to_string());
                alloc.modified_at_ms = at_ms;
                jobs.insert(alloc.job_id.clone());
            }
            self.remove_services_for_alloc(id);
        }

        let stale: Vec<String> = self
            .services
            .values()
            .filter(|s| s.node_id == node_id)
            .map(|s| s.id.clone())
            .collect();
        for service_id in stale {
            self.remove_service(&service_id);
        }

        for job_id in jobs {
            self.refresh_job_status(&job_id, at_ms);
        }
    }

    fn remove_service(&mut self, service_id: &str) {
        if let Some(service) = self.services.remove(service_id) {
            for check_id in &service.check_ids {
                self.checks.remove(check_id);
            }
        }
    }

    fn remove_services_for_alloc(&mut self, alloc_id: Uuid) {
        let ids: Vec<String> = self
            .services
            .values()
            .filter(|s| s.alloc_id == alloc_id)
            .map(|s| s.id.clone())
            .collect();
        for id in ids {
            self.remove_service(&id);
        }
    }

    fn refresh_job_status(&mut self, job_id: &str, at_ms: i64) {
        let Some(record) = self.jobs.get(job_id) else {
            return;
        };
        if record.status == JobStatus::Stopped {
            return;
        }
        let status = match record.job.as_concrete() {
            None => JobStatus::Running,
            Some(job) => self.derive_job_status(job_id, record.version, &job.spec),
        };
        if let Some(record) = self.jobs.get_mut(job_id) {
            if record.status != status {
                record.status = status;
                record.modified_at_ms = at_ms;
            }
        }
    }

    fn derive_job_status(&self, job_id: &str, version: u64, spec: &JobSpec) -> JobStatus {
        let heads: Vec<Option<&Allocation>> = (0..spec.count)
            .map(|slot| self.slot_head(job_id, slot))
            .collect();

        let failed = heads.iter().flatten().any(|a| {
            a.job_version == version
                && a.status == AllocStatus::Failed
                && a.restart.mode == RestartMode::Fail
        });
        if failed {
            return JobStatus::Failed;
        }

        let complete = spec.job_type == JobType::Batch
            && heads.iter().all(|head| {
                matches!(head, Some(a) if a.status == AllocStatus::Complete && a.job_version == version)
            });
        if complete {
            return JobStatus::Complete;
        }

        if heads
            .iter()
            .flatten()
            .any(|a| a.status == AllocStatus::Running)
        {
            JobStatus::Running
        } else {
            JobStatus::Pending
        }
    }

    /// Newest allocation of a slot that has not been replaced.
    pub fn slot_head(&self, job_id: &str, slot: u32) -> Option<&Allocation> {
        self.allocations
            .values()
            .filter(|a| a.job_id == job_id && a.slot == slot && a.next_allocation.is_none())
            .max_by_key(|a| (a.created_at_ms, a.id))
    }

    /// Resources held by live allocations on a node.
    pub fn node_used(&self, node_id: u64) -> Resources {
        self.allocations
            .values()
            .filter(|a| a.node_id == node_id && a.consumes_capacity())
            .fold(Resources::default(), |acc, a| acc.add(&a.resources()))
    }

    pub fn allocations_for_job(&self, job_id: &str) -> Vec<&Allocation> {
        let mut allocs: Vec<&Allocation> = self
            .allocations
            .values()
            .filter(|a| a.job_id == job_id)
            .collect();
        allocs.sort_by_key(|a| (a.slot, a.created_at_ms, a.id));
        allocs
    }

    pub fn allocations_for_node(&self, node_id: u64) -> impl Iterator<Item = &Allocation> {
        self.allocations
            .values()
            .filter(move |a| a.node_id == node_id)
    }

    pub fn services_for_alloc(&self, alloc_id: Uuid) -> impl Iterator<Item = &ServiceRegistration> {
        self.services
            .values()
            .filter(move |s| s.alloc_id == alloc_id)
    }

    /// Running with every registered check passing.
    pub fn alloc_is_healthy(&self, alloc: &Allocation) -> bool {
        alloc.status == AllocStatus::Running
            && self.services_for_alloc(alloc.id).all(|s| {
                s.check_ids.iter().all(|id| {
                    self.checks
                        .get(id)
                        .map(|c| c.status == CheckStatus::Passing)
                        .unwrap_or(false)
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{job_spec, registration};
    use crate::model::{JobSpec, ParameterizedSpec, RestartPolicy};

    fn node_cmd(id: u64, cpu: u64, memory: u64) -> Command {
        Command::RegisterNode {
            registration: registration(id, Resources::new(cpu, memory, 0, 0)),
            at_ms: 1,
        }
    }

    fn submit(spec: JobSpec) -> Command {
        Command::SubmitJob {
            job: spec.into_job().unwrap(),
            at_ms: 2,
        }
    }

    fn place(alloc_id: Uuid, job: &str, slot: u32, node_id: u64) -> Command {
        Command::PlaceAllocation {
            placement: Placement {
                alloc_id,
                job_id: job.into(),
                job_version: 0,
                slot,
                node_id,
                previous_allocation: None,
            },
            at_ms: 3,
        }
    }

    fn status(alloc_id: Uuid, status: AllocStatus) -> Command {
        Command::UpdateAllocationStatus {
            alloc_id,
            status,
            message: None,
            restarts: 0,
            at_ms: 4,
        }
    }

    fn apply_all(state: &mut ClusterState, commands: &[Command]) -> Vec<ApplyOutcome> {
        commands
            .iter()
            .map(|cmd| {
                let index = state.last_applied + 1;
                state.apply(index, None, cmd)
            })
            .collect()
    }

    #[test]
    fn replicas_applying_same_log_converge() {
        let alloc = Uuid::from_u128(1);
        let log = vec![
            node_cmd(1, 1000, 1024),
            node_cmd(2, 2000, 2048),
            submit(job_spec("web")),
            place(alloc, "web", 0, 2),
            status(alloc, AllocStatus::Running),
        ];

        let mut a = ClusterState::new();
        let mut b = ClusterState::new();
        apply_all(&mut a, &log);
        apply_all(&mut b, &log);

        assert_eq!(a, b);
        assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
        assert_eq!(a.jobs["web"].status, JobStatus::Running);
    }

    #[test]
    fn duplicate_request_id_applies_once() {
        let mut state = ClusterState::new();
        let cmd = submit(job_spec("train"));
        assert_eq!(state.apply(1, Some("req-1"), &cmd), ApplyOutcome::Applied);

        let mut changed = job_spec("train");
        changed.count = 3;
        assert_eq!(
            state.apply(2, Some("req-1"), &submit(changed)),
            ApplyOutcome::Duplicate { first_index: 1 }
        );
        assert_eq!(state.jobs["train"].version, 0);
        assert_eq!(state.jobs["train"].job.spec().count, 1);
        assert_eq!(state.last_applied, 2);
    }

    #[test]
    fn identical_resubmission_keeps_version() {
        let mut state = ClusterState::new();
        apply_all(&mut state, &[submit(job_spec("web")), submit(job_spec("web"))]);
        assert_eq!(state.jobs["web"].version, 0);

        let mut changed = job_spec("web");
        changed.task.args = vec!["--fast".into()];
        apply_all(&mut state, &[submit(changed)]);
        assert_eq!(state.jobs["web"].version, 1);
    }

    #[test]
    fn capacity_is_rechecked_at_apply() {
        let mut spec = job_spec("big");
        spec.count = 2;
        spec.task.resources = Resources::new(600, 128, 0, 0);

        let mut state = ClusterState::new();
        let outcomes = apply_all(
            &mut state,
            &[
                node_cmd(1, 1000, 1024),
                submit(spec),
                place(Uuid::from_u128(1), "big", 0, 1),
                place(Uuid::from_u128(2), "big", 1, 1),
            ],
        );

        assert_eq!(outcomes[2], ApplyOutcome::Applied);
        assert_eq!(
            outcomes[3],
            ApplyOutcome::Rejected(Rejection::CapacityExhausted {
                node_id: 1,
                dimension: "cpu".into()
            })
        );
        assert_eq!(state.allocations.len(), 1);
        assert_eq!(state.node_used(1).cpu, 600);
    }

    #[test]
    fn occupied_slot_is_rejected() {
        let mut state = ClusterState::new();
        let outcomes = apply_all(
            &mut state,
            &[
                node_cmd(1, 1000, 1024),
                submit(job_spec("web")),
                place(Uuid::from_u128(1), "web", 0, 1),
                place(Uuid::from_u128(2), "web", 0, 1),
            ],
        );
        assert_eq!(outcomes[3], ApplyOutcome::Rejected(Rejection::SlotOccupied(0)));
    }

    #[test]
    fn dead_node_loses_allocations_and_services() {
        let alloc = Uuid::from_u128(9);
        let service_id = ServiceRegistration::service_id(alloc, "api");
        let check_id = ServiceRegistration::check_id(&service_id, "alive");
        let mut state = ClusterState::new();
        apply_all(
            &mut state,
            &[
                node_cmd(1, 1000, 1024),
                submit(job_spec("web")),
                place(alloc, "web", 0, 1),
                status(alloc, AllocStatus::Running),
                Command::RegisterService {
                    service: ServiceRegistration {
                        id: service_id.clone(),
                        name: "api".into(),
                        alloc_id: alloc,
                        node_id: 1,
                        address: "127.0.0.1".into(),
                        port: 8080,
                        tags: vec![],
                        check_ids: vec![check_id.clone()],
                    },
                    checks: vec![HealthCheckResult {
                        check_id: check_id.clone(),
                        service_id: service_id.clone(),
                        name: "alive".into(),
                        status: CheckStatus::Passing,
                        output: String::new(),
                        updated_at_ms: 5,
                    }],
                    at_ms: 5,
                },
                Command::UpdateNodeStatus {
                    node_id: 1,
                    status: NodeStatus::Dead,
                    at_ms: 6,
                },
            ],
        );

        assert_eq!(state.allocations[&alloc].status, AllocStatus::Lost);
        assert!(state.services.is_empty());
        assert!(state.checks.is_empty());
        assert_eq!(state.jobs["web"].status, JobStatus::Pending);
        assert_eq!(state.node_used(1), Resources::default());
    }

    #[test]
    fn client_cannot_revive_lost_allocation() {
        let alloc = Uuid::from_u128(3);
        let mut state = ClusterState::new();
        let outcomes = apply_all(
            &mut state,
            &[
                node_cmd(1, 1000, 1024),
                submit(job_spec("web")),
                place(alloc, "web", 0, 1),
                Command::DeregisterNode { node_id: 1, at_ms: 5 },
                status(alloc, AllocStatus::Running),
            ],
        );
        assert_eq!(
            outcomes[4],
            ApplyOutcome::Rejected(Rejection::AllocationTerminal(alloc))
        );
    }

    #[test]
    fn batch_job_status_follows_allocations() {
        let alloc = Uuid::from_u128(4);
        let mut state = ClusterState::new();
        apply_all(
            &mut state,
            &[
                node_cmd(1, 1000, 1024),
                submit(job_spec("once")),
                place(alloc, "once", 0, 1),
            ],
        );
        assert_eq!(state.jobs["once"].status, JobStatus::Pending);

        apply_all(&mut state, &[status(alloc, AllocStatus::Complete)]);
        assert_eq!(state.jobs["once"].status, JobStatus::Complete);
    }

    #[test]
    fn exhausted_fail_mode_fails_the_job() {
        let alloc = Uuid::from_u128(5);
        let mut spec = job_spec("flaky");
        spec.restart = RestartPolicy {
            mode: RestartMode::Fail,
            ..Default::default()
        };
        let mut state = ClusterState::new();
        apply_all(
            &mut state,
            &[
                node_cmd(1, 1000, 1024),
                submit(spec),
                place(alloc, "flaky", 0, 1),
                status(alloc, AllocStatus::Failed),
            ],
        );
        assert_eq!(state.jobs["flaky"].status, JobStatus::Failed);
    }

    #[test]
    fn replacement_links_previous_allocation() {
        let first = Uuid::from_u128(6);
        let second = Uuid::from_u128(7);
        let mut state = ClusterState::new();
        apply_all(
            &mut state,
            &[
                node_cmd(1, 1000, 1024),
                submit(job_spec("web")),
                place(first, "web", 0, 1),
                status(first, AllocStatus::Failed),
                Command::PlaceAllocation {
                    placement: Placement {
                        alloc_id: second,
                        job_id: "web".into(),
                        job_version: 0,
                        slot: 0,
                        node_id: 1,
                        previous_allocation: Some(first),
                    },
                    at_ms: 9,
                },
            ],
        );

        assert_eq!(state.allocations[&first].next_allocation, Some(second));
        assert_eq!(state.slot_head("web", 0).map(|a| a.id), Some(second));
    }

    #[test]
    fn dispatched_child_requires_template_parent() {
        let mut state = ClusterState::new();
        let job = job_spec("child").into_job().unwrap();
        let crate::model::Job::Concrete(mut concrete) = job else {
            panic!("expected concrete job");
        };
        concrete.parent_id = Some("missing".into());
        let outcome = state.apply(
            1,
            None,
            &Command::SubmitJob {
                job: crate::model::Job::Concrete(concrete),
                at_ms: 1,
            },
        );
        assert_eq!(
            outcome,
            ApplyOutcome::Rejected(Rejection::UnknownJob("missing".into()))
        );
    }

    #[test]
    fn stop_job_marks_allocations_for_stop() {
        let alloc = Uuid::from_u128(8);
        let mut state = ClusterState::new();
        apply_all(
            &mut state,
            &[
                node_cmd(1, 1000, 1024),
                submit(job_spec("web")),
                place(alloc, "web", 0, 1),
                Command::StopJob {
                    job_id: "web".into(),
                    at_ms: 10,
                },
            ],
        );
        assert_eq!(state.jobs["web"].status, JobStatus::Stopped);
        assert_eq!(state.allocations[&alloc].desired, DesiredStatus::Stop);
        assert!(!state.allocations[&alloc].consumes_capacity());
    }

    #[test]
    fn snapshot_bytes_restore_identical_state() {
        let mut state = ClusterState::new();
        apply_all(&mut state, &[node_cmd(1, 1000, 1024), submit(job_spec("web"))]);
        state.apply(3, Some("req-9"), &Command::Noop);

        let restored = ClusterState::from_bytes(&state.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, state);
        assert_eq!(restored.applied_request("req-9"), Some(3));
    }

    fn dispatch_cmd(parent: &str, child: &str, day: Option<&str>) -> Command {
        Command::DispatchJob {
            parent_id: parent.into(),
            child_id: child.into(),
            meta: day
                .map(|d| BTreeMap::from([("DAY".to_string(), d.to_string())]))
                .unwrap_or_default(),
            at_ms: 5,
        }
    }

    #[test]
    fn dispatch_resolves_template_at_apply() {
        let mut template = job_spec("report");
        template.parameterized = Some(ParameterizedSpec {
            meta_required: vec!["DAY".into()],
            ..Default::default()
        });

        let mut state = ClusterState::new();
        let outcomes = apply_all(
            &mut state,
            &[
                dispatch_cmd("report", "report-dispatch-1", Some("mon")),
                submit(template),
                dispatch_cmd("report", "report-dispatch-1", None),
                dispatch_cmd("report", "report-dispatch-1", Some("mon")),
                dispatch_cmd("report", "report-dispatch-1", Some("tue")),
            ],
        );

        assert_eq!(
            outcomes[0],
            ApplyOutcome::Rejected(Rejection::UnknownJob("report".into()))
        );
        assert!(matches!(
            &outcomes[2],
            ApplyOutcome::Rejected(Rejection::InvalidDispatch(ValidationError::MissingMetaKey(k))) if k == "DAY"
        ));
        assert_eq!(outcomes[3], ApplyOutcome::Applied);
        // Same child id again leaves the first child in place.
        assert_eq!(outcomes[4], ApplyOutcome::Applied);

        let child = state.jobs["report-dispatch-1"].job.as_concrete().unwrap();
        assert_eq!(child.parent_id.as_deref(), Some("report"));
        assert_eq!(child.spec.task.env["DAY"], "mon");
        assert_eq!(state.jobs["report-dispatch-1"].version, 0);
    }

    #[test]
    fn dispatch_of_stopped_or_concrete_job_is_rejected() {
        let mut template = job_spec("report");
        template.parameterized = Some(ParameterizedSpec::default());

        let mut state = ClusterState::new();
        let outcomes = apply_all(
            &mut state,
            &[
                submit(job_spec("web")),
                dispatch_cmd("web", "web-dispatch-1", None),
                submit(template),
                Command::StopJob {
                    job_id: "report".into(),
                    at_ms: 4,
                },
                dispatch_cmd("report", "report-dispatch-1", None),
            ],
        );

        assert_eq!(
            outcomes[1],
            ApplyOutcome::Rejected(Rejection::NotTemplate("web".into()))
        );
        assert_eq!(
            outcomes[4],
            ApplyOutcome::Rejected(Rejection::JobStopped("report".into()))
        );
        assert!(!state.jobs.contains_key("report-dispatch-1"));
    }
}
