use std::time::Duration;

use thiserror::Error;
use tonic::{Code, Status};
use uuid::Uuid;

use crate::state::Rejection;

/// Errors raised while validating user supplied jobs and dispatch requests.
///
/// Validation always happens before anything is proposed to the log, so a
/// `ValidationError` never leaves partial state behind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid job id {0:?}: use letters, digits, '-', '_' or '.'")]
    InvalidJobId(String),

    #[error("count must be at least 1")]
    InvalidCount,

    #[error("task must request cpu or memory")]
    EmptyResources,

    #[error("constraint references unknown attribute {0:?}")]
    UnknownAttribute(String),

    #[error("restart policy must allow at least one attempt")]
    InvalidRestartPolicy,

    #[error("update strategy max_parallel must be at least 1")]
    InvalidUpdateStrategy,

    #[error("check {check:?}: {reason}")]
    InvalidCheck { check: String, reason: String },

    #[error("meta key {0:?} declared both required and optional")]
    DuplicateMetaKey(String),

    #[error("validation rule for undeclared meta key {0:?}")]
    UndeclaredMetaRule(String),

    #[error("invalid pattern for meta key {key:?}: {reason}")]
    InvalidPattern { key: String, reason: String },

    #[error("missing required meta key {0:?}")]
    MissingMetaKey(String),

    #[error("unexpected meta key {0:?}")]
    UnknownMetaKey(String),

    #[error("meta key {key:?}: {reason}")]
    InvalidMetaValue { key: String, reason: String },

    #[error("job id in path ({path:?}) does not match body ({body:?})")]
    JobIdMismatch { path: String, body: String },

    #[error("malformed request: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum StevedoreError {
    #[error("not the leader, current leader is node {0:?}")]
    NotLeader(Option<u64>),

    #[error("no cluster leader")]
    NoLeader,

    #[error("quorum unavailable")]
    QuorumUnavailable,

    #[error("proposal timed out after {0:?}; outcome unknown, retry with the same request id")]
    ProposalTimeout(Duration),

    #[error("leadership lost before entry {0} committed")]
    LeadershipLost(u64),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {0} is not parameterized")]
    NotParameterized(String),

    #[error("allocation not found: {0}")]
    AllocationNotFound(Uuid),

    #[error("node not found: {0}")]
    NodeNotFound(u64),

    #[error("check not found: {0}")]
    CheckNotFound(String),

    #[error("rejected: {0}")]
    Conflict(Rejection),

    #[error("permission denied")]
    PermissionDenied,

    #[error("remote error ({code}): {message}")]
    Remote {
        code: String,
        message: String,
        retryable: bool,
    },

    #[error("raft error: {0}")]
    Raft(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("gRPC error: {0}")]
    Grpc(#[from] Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StevedoreError {
    /// Machine-readable reason code surfaced to API callers.
    pub fn reason_code(&self) -> &str {
        match self {
            StevedoreError::NotLeader(_) => "not_leader",
            StevedoreError::NoLeader => "no_leader",
            StevedoreError::QuorumUnavailable => "quorum_unavailable",
            StevedoreError::ProposalTimeout(_) => "proposal_timeout",
            StevedoreError::LeadershipLost(_) => "leadership_lost",
            StevedoreError::Validation(_) => "validation_failed",
            StevedoreError::JobNotFound(_) => "job_not_found",
            StevedoreError::NotParameterized(_) => "not_parameterized",
            StevedoreError::AllocationNotFound(_) => "allocation_not_found",
            StevedoreError::NodeNotFound(_) => "node_not_found",
            StevedoreError::CheckNotFound(_) => "check_not_found",
            StevedoreError::Conflict(rejection) => rejection.reason_code(),
            StevedoreError::PermissionDenied => "permission_denied",
            StevedoreError::Remote { code, .. } => code,
            StevedoreError::Raft(_) => "raft_error",
            StevedoreError::Storage(_) => "storage_error",
            StevedoreError::Serialization(_) => "serialization_error",
            StevedoreError::Grpc(_) | StevedoreError::Transport(_) | StevedoreError::Http(_) => {
                "transport_error"
            }
            StevedoreError::Internal(_) => "internal_error",
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StevedoreError::NotLeader(_)
            | StevedoreError::NoLeader
            | StevedoreError::QuorumUnavailable
            | StevedoreError::ProposalTimeout(_)
            | StevedoreError::LeadershipLost(_)
            | StevedoreError::Grpc(_)
            | StevedoreError::Transport(_)
            | StevedoreError::Http(_) => true,
            StevedoreError::Remote { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Rebuild an error returned by a remote node over gRPC.
    pub fn from_status(status: Status, timeout: Duration) -> Self {
        match status.code() {
            Code::FailedPrecondition => StevedoreError::NotLeader(None),
            Code::Unavailable => StevedoreError::NoLeader,
            Code::DeadlineExceeded => StevedoreError::ProposalTimeout(timeout),
            Code::Aborted => StevedoreError::LeadershipLost(0),
            Code::InvalidArgument => StevedoreError::Validation(ValidationError::Malformed(
                status.message().to_string(),
            )),
            _ => StevedoreError::Grpc(status),
        }
    }
}

impl From<StevedoreError> for Status {
    fn from(err: StevedoreError) -> Self {
        let message = err.to_string();
        match err {
            StevedoreError::NotLeader(_) => Status::failed_precondition(message),
            StevedoreError::NoLeader | StevedoreError::QuorumUnavailable => {
                Status::unavailable(message)
            }
            StevedoreError::ProposalTimeout(_) => Status::deadline_exceeded(message),
            StevedoreError::LeadershipLost(_) => Status::aborted(message),
            StevedoreError::Validation(_) | StevedoreError::Serialization(_) => {
                Status::invalid_argument(message)
            }
            StevedoreError::Grpc(status) => status,
            _ => Status::internal(message),
        }
    }
}

impl From<Rejection> for StevedoreError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::UnknownJob(id) => StevedoreError::JobNotFound(id),
            Rejection::UnknownNode(id) => StevedoreError::NodeNotFound(id),
            Rejection::UnknownAllocation(id) => StevedoreError::AllocationNotFound(id),
            Rejection::UnknownCheck(id) => StevedoreError::CheckNotFound(id),
            Rejection::NotTemplate(id) => StevedoreError::NotParameterized(id),
            Rejection::InvalidDispatch(e) => StevedoreError::Validation(e),
            other => StevedoreError::Conflict(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, StevedoreError>;
