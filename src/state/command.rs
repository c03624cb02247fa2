use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{
    AllocStatus, CheckStatus, HealthCheckResult, Job, NodeRegistration, NodeStatus, Placement,
    PlacementFailure, ServiceRegistration,
};

/// Commands replicated through the log and applied by every node.
///
/// Each command carries the proposer's wall-clock time (`at_ms`) so that
/// applying it never consults the local clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Appended by every new leader so earlier entries can commit.
    Noop,
    RegisterNode {
        registration: NodeRegistration,
        at_ms: i64,
    },
    UpdateNodeStatus {
        node_id: u64,
        status: NodeStatus,
        at_ms: i64,
    },
    DeregisterNode {
        node_id: u64,
        at_ms: i64,
    },
    SubmitJob {
        job: Job,
        at_ms: i64,
    },
    StopJob {
        job_id: String,
        at_ms: i64,
    },
    /// Instantiate a parameterized template as `child_id`. The template is
    /// resolved at apply time, so any node may propose it.
    DispatchJob {
        parent_id: String,
        child_id: String,
        meta: BTreeMap<String, String>,
        at_ms: i64,
    },
    UpdateJobPlacement {
        job_id: String,
        failure: Option<PlacementFailure>,
        at_ms: i64,
    },
    PlaceAllocation {
        placement: Placement,
        at_ms: i64,
    },
    StopAllocation {
        alloc_id: Uuid,
        at_ms: i64,
    },
    UpdateAllocationStatus {
        alloc_id: Uuid,
        status: AllocStatus,
        message: Option<String>,
        restarts: u32,
        at_ms: i64,
    },
    RegisterService {
        service: ServiceRegistration,
        checks: Vec<HealthCheckResult>,
        at_ms: i64,
    },
    DeregisterService {
        service_id: String,
        at_ms: i64,
    },
    UpdateCheck {
        check_id: String,
        status: CheckStatus,
        output: String,
        at_ms: i64,
    },
    AddVoter {
        node_id: u64,
        rpc_addr: String,
    },
    RemoveVoter {
        node_id: u64,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Noop => "noop",
            Command::RegisterNode { .. } => "register_node",
            Command::UpdateNodeStatus { .. } => "update_node_status",
            Command::DeregisterNode { .. } => "deregister_node",
            Command::SubmitJob { .. } => "submit_job",
            Command::StopJob { .. } => "stop_job",
            Command::DispatchJob { .. } => "dispatch_job",
            Command::UpdateJobPlacement { .. } => "update_job_placement",
            Command::PlaceAllocation { .. } => "place_allocation",
            Command::StopAllocation { .. } => "stop_allocation",
            Command::UpdateAllocationStatus { .. } => "update_allocation_status",
            Command::RegisterService { .. } => "register_service",
            Command::DeregisterService { .. } => "deregister_service",
            Command::UpdateCheck { .. } => "update_check",
            Command::AddVoter { .. } => "add_voter",
            Command::RemoveVoter { .. } => "remove_voter",
        }
    }

    pub fn changes_voters(&self) -> bool {
        matches!(self, Command::AddVoter { .. } | Command::RemoveVoter { .. })
    }
}

/// Current wall-clock time for stamping commands.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
