use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::node::{is_known_attribute, NodeRegistration};
use super::service::CheckStatus;
use super::Resources;
use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Runs to completion; finished slots are not replaced.
    #[default]
    Batch,
    /// Long running; every slot is kept occupied.
    Service,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Batch => write!(f, "batch"),
            JobType::Service => write!(f, "service"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintOperator {
    #[default]
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}

/// Attribute predicate a node must satisfy to host a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub attribute: String,
    #[serde(default)]
    pub operator: ConstraintOperator,
    pub value: String,
}

impl Constraint {
    pub fn is_satisfied_by(&self, node: &NodeRegistration) -> bool {
        let actual = node.attribute(&self.attribute);
        match self.operator {
            ConstraintOperator::Equal => actual.as_deref() == Some(self.value.as_str()),
            ConstraintOperator::NotEqual => actual.as_deref() != Some(self.value.as_str()),
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.operator {
            ConstraintOperator::Equal => "=",
            ConstraintOperator::NotEqual => "!=",
        };
        write!(f, "{} {} {}", self.attribute, op, self.value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    /// Ask the scheduler for a replacement allocation after `delay`.
    Delay,
    /// Give up: the allocation and its job are marked failed.
    #[default]
    Fail,
}

/// Node-local restart budget for a failing task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Failures tolerated inside `interval`; the failure reaching this count exhausts the policy.
    pub attempts: u32,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    pub mode: RestartMode,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval: Duration::from_secs(24 * 60 * 60),
            delay: Duration::from_secs(15),
            mode: RestartMode::Fail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateStrategy {
    pub max_parallel: u32,
    #[serde(with = "humantime_serde")]
    pub stagger: Duration,
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            stagger: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckKind {
    /// 2xx passes, 429 warns, anything else fails.
    Http {
        #[serde(default = "default_http_path")]
        path: String,
    },
    Tcp,
    /// Exit 0 passes, exit 1 warns, anything else fails.
    Script {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

fn default_http_path() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSpec {
    pub name: String,
    pub kind: CheckKind,
    #[serde(with = "humantime_serde", default = "default_check_interval")]
    pub interval: Duration,
    #[serde(with = "humantime_serde", default = "default_check_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_successes_before_passing")]
    pub successes_before_passing: u32,
    #[serde(default = "default_failures_before_critical")]
    pub failures_before_critical: u32,
    #[serde(default)]
    pub initial_status: CheckStatus,
}

fn default_check_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_successes_before_passing() -> u32 {
    1
}

fn default_failures_before_critical() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default = "default_driver")]
    pub driver: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Container image, used by the docker driver only.
    #[serde(default)]
    pub image: Option<String>,
    pub resources: Resources,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

fn default_driver() -> String {
    "exec".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaKind {
    #[default]
    String,
    Integer,
}

/// Rule a dispatch meta value must satisfy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaValidation {
    pub kind: MetaKind,
    pub pattern: Option<String>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min_value: Option<i64>,
    pub max_value: Option<i64>,
}

impl MetaValidation {
    fn invalid(key: &str, reason: String) -> ValidationError {
        ValidationError::InvalidMetaValue {
            key: key.to_string(),
            reason,
        }
    }

    fn compile(&self, key: &str) -> Result<Option<Regex>, ValidationError> {
        self.pattern
            .as_deref()
            .map(|p| {
                Regex::new(p).map_err(|e| ValidationError::InvalidPattern {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    pub fn check(&self, key: &str, value: &str) -> Result<(), ValidationError> {
        match self.kind {
            MetaKind::Integer => {
                let n: i64 = value
                    .parse()
                    .map_err(|_| Self::invalid(key, "must be a valid integer".into()))?;
                if let Some(min) = self.min_value {
                    if n < min {
                        return Err(Self::invalid(key, format!("must be at least {}", min)));
                    }
                }
                if let Some(max) = self.max_value {
                    if n > max {
                        return Err(Self::invalid(key, format!("must be at most {}", max)));
                    }
                }
            }
            MetaKind::String => {
                let len = value.chars().count();
                if let Some(min) = self.min_length {
                    if len < min {
                        return Err(Self::invalid(
                            key,
                            format!("must be at least {} characters long", min),
                        ));
                    }
                }
                if let Some(max) = self.max_length {
                    if len > max {
                        return Err(Self::invalid(
                            key,
                            format!("must be at most {} characters long", max),
                        ));
                    }
                }
                if let Some(re) = self.compile(key)? {
                    if !re.is_match(value) {
                        return Err(Self::invalid(
                            key,
                            format!("does not match required pattern {}", re.as_str()),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Makes a job a template that is only ever instantiated by dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterizedSpec {
    pub meta_required: Vec<String>,
    pub meta_optional: Vec<String>,
    pub validation: BTreeMap<String, MetaValidation>,
}

impl ParameterizedSpec {
    pub fn declares(&self, key: &str) -> bool {
        self.meta_required.iter().any(|k| k == key) || self.meta_optional.iter().any(|k| k == key)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if let Some(dup) = self
            .meta_required
            .iter()
            .find(|k| self.meta_optional.contains(k))
        {
            return Err(ValidationError::DuplicateMetaKey(dup.clone()));
        }
        for (key, rule) in &self.validation {
            if !self.declares(key) {
                return Err(ValidationError::UndeclaredMetaRule(key.clone()));
            }
            rule.compile(key)?;
        }
        Ok(())
    }
}

/// A job as submitted by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub job_type: JobType,
    #[serde(default = "default_count")]
    pub count: u32,
    /// Empty means any datacenter.
    #[serde(default)]
    pub datacenters: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    pub task: TaskSpec,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default)]
    pub update: Option<UpdateStrategy>,
    #[serde(default)]
    pub parameterized: Option<ParameterizedSpec>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

fn default_count() -> u32 {
    1
}

fn valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl JobSpec {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        if !valid_job_id(&self.id) {
            return Err(ValidationError::InvalidJobId(self.id.clone()));
        }
        if self.count == 0 {
            return Err(ValidationError::InvalidCount);
        }
        if self.task.command.trim().is_empty() {
            return Err(ValidationError::MissingField("task.command"));
        }
        if self.task.resources.cpu == 0 && self.task.resources.memory_mb == 0 {
            return Err(ValidationError::EmptyResources);
        }
        for constraint in &self.constraints {
            if !is_known_attribute(&constraint.attribute) {
                return Err(ValidationError::UnknownAttribute(
                    constraint.attribute.clone(),
                ));
            }
        }
        if self.restart.attempts == 0 {
            return Err(ValidationError::InvalidRestartPolicy);
        }
        if matches!(&self.update, Some(u) if u.max_parallel == 0) {
            return Err(ValidationError::InvalidUpdateStrategy);
        }
        for service in &self.task.services {
            if service.name.is_empty() {
                return Err(ValidationError::MissingField("service.name"));
            }
            for check in &service.checks {
                Self::validate_check(check)?;
            }
        }
        if let Some(params) = &self.parameterized {
            params.validate()?;
        }
        Ok(())
    }

    fn validate_check(check: &CheckSpec) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidCheck {
            check: check.name.clone(),
            reason: reason.to_string(),
        };
        if check.name.is_empty() {
            return Err(ValidationError::MissingField("check.name"));
        }
        if check.interval.is_zero() || check.timeout.is_zero() {
            return Err(invalid("interval and timeout must be non-zero"));
        }
        if check.successes_before_passing == 0 || check.failures_before_critical == 0 {
            return Err(invalid("thresholds must be at least 1"));
        }
        if let CheckKind::Script { command, .. } = &check.kind {
            if command.trim().is_empty() {
                return Err(invalid("script command is empty"));
            }
        }
        Ok(())
    }

    /// Validate and classify into a concrete job or a dispatch template.
    pub fn into_job(mut self) -> Result<Job, ValidationError> {
        self.validate()?;
        Ok(match self.parameterized.take() {
            Some(parameters) => Job::Template(JobTemplate {
                spec: self,
                parameters,
            }),
            None => Job::Concrete(ConcreteJob {
                spec: self,
                parent_id: None,
                dispatch_meta: BTreeMap::new(),
            }),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcreteJob {
    pub spec: JobSpec,
    /// Set on jobs created by dispatching a template.
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub dispatch_meta: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub spec: JobSpec,
    pub parameters: ParameterizedSpec,
}

/// A validated job. Templates are never scheduled directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    Concrete(ConcreteJob),
    Template(JobTemplate),
}

impl Job {
    pub fn id(&self) -> &str {
        &self.spec().id
    }

    pub fn spec(&self) -> &JobSpec {
        match self {
            Job::Concrete(job) => &job.spec,
            Job::Template(template) => &template.spec,
        }
    }

    pub fn as_concrete(&self) -> Option<&ConcreteJob> {
        match self {
            Job::Concrete(job) => Some(job),
            Job::Template(_) => None,
        }
    }

    pub fn as_template(&self) -> Option<&JobTemplate> {
        match self {
            Job::Template(template) => Some(template),
            Job::Concrete(_) => None,
        }
    }

    /// The job as a user would submit it, template fields included.
    pub fn to_spec(&self) -> JobSpec {
        match self {
            Job::Concrete(job) => job.spec.clone(),
            Job::Template(template) => JobSpec {
                parameterized: Some(template.parameters.clone()),
                ..template.spec.clone()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Stopped
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Why the scheduler could not place an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum PlacementFailure {
    NoNodes,
    ConstraintUnsatisfiable { constraint: String },
    InsufficientResources { dimension: String },
}

impl PlacementFailure {
    pub fn reason_code(&self) -> &'static str {
        match self {
            PlacementFailure::NoNodes => "no_nodes",
            PlacementFailure::ConstraintUnsatisfiable { .. } => "constraint_unsatisfiable",
            PlacementFailure::InsufficientResources { .. } => "insufficient_resources",
        }
    }
}

impl fmt::Display for PlacementFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlacementFailure::NoNodes => write!(f, "no alive nodes in the requested datacenters"),
            PlacementFailure::ConstraintUnsatisfiable { constraint } => {
                write!(f, "no node satisfies constraint {}", constraint)
            }
            PlacementFailure::InsufficientResources { dimension } => {
                write!(f, "no node has enough {} left", dimension)
            }
        }
    }
}

/// A job as held in the replicated state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: Job,
    pub version: u64,
    pub status: JobStatus,
    /// Last placement failure, cleared once a placement succeeds.
    #[serde(default)]
    pub blocked: Option<PlacementFailure>,
    pub submitted_at_ms: i64,
    pub modified_at_ms: i64,
}
