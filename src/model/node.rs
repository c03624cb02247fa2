use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::Resources;

/// Liveness of a node as recorded in the replicated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Alive,
    Suspect,
    Dead,
    /// Left gracefully; never scheduled on again.
    Left,
}

impl NodeStatus {
    pub fn is_schedulable(&self) -> bool {
        matches!(self, NodeStatus::Alive)
    }

    /// Dead and left nodes no longer host allocations.
    pub fn is_gone(&self) -> bool {
        matches!(self, NodeStatus::Dead | NodeStatus::Left)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Alive => write!(f, "alive"),
            NodeStatus::Suspect => write!(f, "suspect"),
            NodeStatus::Dead => write!(f, "dead"),
            NodeStatus::Left => write!(f, "left"),
        }
    }
}

/// What a node advertises about itself in every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub id: u64,
    pub name: String,
    pub datacenter: String,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Host other nodes and service consumers reach this node on.
    pub address: String,
    pub rpc_addr: String,
    pub http_addr: String,
    pub resources: Resources,
}

/// Attribute keys a constraint may reference.
pub fn is_known_attribute(key: &str) -> bool {
    matches!(
        key,
        "node.id" | "node.name" | "node.class" | "node.datacenter"
    ) || key
        .strip_prefix("attr.")
        .map(|rest| !rest.is_empty())
        .unwrap_or(false)
}

impl NodeRegistration {
    /// Resolve a constraint attribute against this node.
    pub fn attribute(&self, key: &str) -> Option<String> {
        match key {
            "node.id" => Some(self.id.to_string()),
            "node.name" => Some(self.name.clone()),
            "node.class" => self.class.clone(),
            "node.datacenter" => Some(self.datacenter.clone()),
            _ => key
                .strip_prefix("attr.")
                .and_then(|attr| self.attributes.get(attr).cloned()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub registration: NodeRegistration,
    pub status: NodeStatus,
    pub status_updated_at_ms: i64,
    pub registered_at_ms: i64,
}

impl Node {
    pub fn id(&self) -> u64 {
        self.registration.id
    }

    pub fn name(&self) -> &str {
        &self.registration.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> NodeRegistration {
        NodeRegistration {
            id: 7,
            name: "gpu-7".into(),
            datacenter: "dc1".into(),
            class: Some("gpu".into()),
            attributes: BTreeMap::from([("kernel".to_string(), "linux".to_string())]),
            address: "127.0.0.1".into(),
            rpc_addr: "127.0.0.1:7000".into(),
            http_addr: "127.0.0.1:7001".into(),
            resources: Resources::new(1000, 1024, 0, 0),
        }
    }

    #[test]
    fn resolves_builtin_and_custom_attributes() {
        let reg = registration();
        assert_eq!(reg.attribute("node.id").as_deref(), Some("7"));
        assert_eq!(reg.attribute("node.class").as_deref(), Some("gpu"));
        assert_eq!(reg.attribute("attr.kernel").as_deref(), Some("linux"));
        assert_eq!(reg.attribute("attr.arch"), None);
    }

    #[test]
    fn known_attributes() {
        assert!(is_known_attribute("node.datacenter"));
        assert!(is_known_attribute("attr.gpu"));
        assert!(!is_known_attribute("attr."));
        assert!(!is_known_attribute("meta.owner"));
    }
}
