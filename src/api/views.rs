//! JSON bodies exchanged over the control API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{
    Allocation, JobRecord, JobSpec, JobStatus, JobType, Node, NodeStatus, PlacementFailure,
    Resources,
};
use crate::state::ClusterState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderInfo {
    pub leader_id: Option<u64>,
    /// RPC address of the leader; empty while no leader is known.
    pub address: String,
    pub http_addr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: u64,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    /// 0 healthy, 1 degraded, 2 critical.
    pub code: u8,
    pub node_id: u64,
    pub leader_id: Option<u64>,
    pub applied_index: u64,
    pub last_contact_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: u64,
    pub name: String,
    pub datacenter: String,
    pub class: Option<String>,
    pub address: String,
    pub status: NodeStatus,
    pub resources: Resources,
    pub used: Resources,
    pub allocations: usize,
}

impl NodeSummary {
    pub fn new(state: &ClusterState, node: &Node) -> Self {
        let reg = &node.registration;
        Self {
            id: reg.id,
            name: reg.name.clone(),
            datacenter: reg.datacenter.clone(),
            class: reg.class.clone(),
            address: reg.address.clone(),
            status: node.status,
            resources: reg.resources,
            used: state.node_used(reg.id),
            allocations: state
                .allocations_for_node(reg.id)
                .filter(|a| a.consumes_capacity())
                .count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDetail {
    pub node: Node,
    pub used: Resources,
    pub allocations: Vec<Allocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub version: u64,
    pub parameterized: bool,
    pub parent_id: Option<String>,
    pub blocked: Option<PlacementFailure>,
}

impl From<&JobRecord> for JobSummary {
    fn from(record: &JobRecord) -> Self {
        let spec = record.job.spec();
        Self {
            id: spec.id.clone(),
            job_type: spec.job_type,
            status: record.status,
            version: record.version,
            parameterized: record.job.as_template().is_some(),
            parent_id: record.job.as_concrete().and_then(|j| j.parent_id.clone()),
            blocked: record.blocked.clone(),
        }
    }
}

/// A job as submitted, plus its scheduling state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobView {
    pub spec: JobSpec,
    pub version: u64,
    pub status: JobStatus,
    pub blocked: Option<PlacementFailure>,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub dispatch_meta: BTreeMap<String, String>,
    pub submitted_at_ms: i64,
    pub modified_at_ms: i64,
}

impl From<&JobRecord> for JobView {
    fn from(record: &JobRecord) -> Self {
        let concrete = record.job.as_concrete();
        Self {
            spec: record.job.to_spec(),
            version: record.version,
            status: record.status,
            blocked: record.blocked.clone(),
            parent_id: concrete.and_then(|j| j.parent_id.clone()),
            dispatch_meta: concrete.map(|j| j.dispatch_meta.clone()).unwrap_or_default(),
            submitted_at_ms: record.submitted_at_ms,
            modified_at_ms: record.modified_at_ms,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// Result of a write: the job it touched and the log index it committed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub job_id: String,
    pub index: u64,
    pub request_id: String,
}
