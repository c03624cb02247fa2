//! Cluster data model shared by the state machine, scheduler and API.

pub mod allocation;
pub mod job;
pub mod node;
pub mod resources;
pub mod service;

pub use allocation::{AllocStatus, Allocation, DesiredStatus, Placement};
pub use job::{
    CheckKind, CheckSpec, ConcreteJob, Constraint, ConstraintOperator, Job, JobRecord, JobSpec,
    JobStatus, JobTemplate, JobType, MetaKind, MetaValidation, ParameterizedSpec,
    PlacementFailure, RestartMode, RestartPolicy, ServiceSpec, TaskSpec, UpdateStrategy,
};
pub use node::{Node, NodeRegistration, NodeStatus};
pub use resources::Resources;
pub use service::{CheckStatus, HealthCheckResult, ServiceRegistration};
