use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passing,
    Warning,
    #[default]
    Critical,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Passing => write!(f, "passing"),
            CheckStatus::Warning => write!(f, "warning"),
            CheckStatus::Critical => write!(f, "critical"),
        }
    }
}

/// A service instance offered by a running allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub id: String,
    pub name: String,
    pub alloc_id: Uuid,
    pub node_id: u64,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub check_ids: Vec<String>,
}

impl ServiceRegistration {
    pub fn service_id(alloc_id: Uuid, service_name: &str) -> String {
        format!("{}-{}", alloc_id, service_name)
    }

    pub fn check_id(service_id: &str, check_name: &str) -> String {
        format!("{}:{}", service_id, check_name)
    }
}

/// Last reported result of one health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub check_id: String,
    pub service_id: String,
    pub name: String,
    pub status: CheckStatus,
    #[serde(default)]
    pub output: String,
    pub updated_at_ms: i64,
}
