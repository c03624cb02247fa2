use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{RestartPolicy, TaskSpec};
use super::Resources;

/// Observed state of an allocation, reported by the node running it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocStatus {
    Pending,
    Running,
    Complete,
    Failed,
    /// The hosting node died or left; set by the state machine, never by a client.
    Lost,
}

impl AllocStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AllocStatus::Complete | AllocStatus::Failed | AllocStatus::Lost
        )
    }
}

impl fmt::Display for AllocStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocStatus::Pending => write!(f, "pending"),
            AllocStatus::Running => write!(f, "running"),
            AllocStatus::Complete => write!(f, "complete"),
            AllocStatus::Failed => write!(f, "failed"),
            AllocStatus::Lost => write!(f, "lost"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredStatus {
    Run,
    Stop,
}

/// Binding of one slot of a job version to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Uuid,
    pub job_id: String,
    pub job_version: u64,
    pub slot: u32,
    pub node_id: u64,
    /// Copied from the job version this allocation was placed for.
    pub task: TaskSpec,
    pub restart: RestartPolicy,
    pub desired: DesiredStatus,
    pub status: AllocStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub restarts: u32,
    #[serde(default)]
    pub previous_allocation: Option<Uuid>,
    #[serde(default)]
    pub next_allocation: Option<Uuid>,
    pub created_at_ms: i64,
    pub modified_at_ms: i64,
}

impl Allocation {
    pub fn resources(&self) -> Resources {
        self.task.resources
    }

    /// Counted against its node's capacity.
    pub fn consumes_capacity(&self) -> bool {
        self.desired == DesiredStatus::Run && !self.status.is_terminal()
    }
}

/// A scheduler decision awaiting validation by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub alloc_id: Uuid,
    pub job_id: String,
    pub job_version: u64,
    pub slot: u32,
    pub node_id: u64,
    #[serde(default)]
    pub previous_allocation: Option<Uuid>,
}
