//! Service discovery over the applied cluster state.
//!
//! Lookups are pure functions of a [`ClusterState`] snapshot and never touch
//! consensus. Freshness is the caller's concern: blocking queries wait on the
//! store's applied index before calling in here.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{AllocStatus, CheckStatus, HealthCheckResult, ServiceRegistration};
use crate::state::ClusterState;

/// Filters for a service lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceQuery {
    /// Only instances carrying this tag.
    pub tag: Option<String>,
    /// Only instances whose checks all pass.
    pub passing: bool,
    /// Include critical and non-running instances.
    pub all: bool,
}

/// One discoverable instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service: ServiceRegistration,
    pub node_name: String,
    pub job_id: String,
    pub alloc_id: Uuid,
    pub alloc_status: AllocStatus,
    /// Worst status across the instance's checks; passing when it has none.
    pub status: CheckStatus,
    pub checks: Vec<HealthCheckResult>,
}

/// Every registered service name with the union of its tags.
pub fn catalog(state: &ClusterState) -> BTreeMap<String, BTreeSet<String>> {
    let mut names: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for service in state.services.values() {
        names
            .entry(service.name.clone())
            .or_default()
            .extend(service.tags.iter().cloned());
    }
    names
}

/// Instances of `name` matching `query`, ordered by node then service id.
pub fn lookup(state: &ClusterState, name: &str, query: &ServiceQuery) -> Vec<ServiceInstance> {
    let mut instances: Vec<ServiceInstance> = state
        .services
        .values()
        .filter(|s| s.name == name)
        .filter(|s| match &query.tag {
            Some(tag) => s.tags.iter().any(|t| t == tag),
            None => true,
        })
        .filter_map(|s| instance(state, s))
        .filter(|i| {
            if query.all {
                return true;
            }
            if i.alloc_status != AllocStatus::Running {
                return false;
            }
            if query.passing {
                i.status == CheckStatus::Passing
            } else {
                i.status != CheckStatus::Critical
            }
        })
        .collect();
    instances.sort_by(|a, b| {
        (a.service.node_id, &a.service.id).cmp(&(b.service.node_id, &b.service.id))
    });
    instances
}

fn instance(state: &ClusterState, service: &ServiceRegistration) -> Option<ServiceInstance> {
    let alloc = state.allocations.get(&service.alloc_id)?;
    let checks: Vec<HealthCheckResult> = service
        .check_ids
        .iter()
        .filter_map(|id| state.checks.get(id).cloned())
        .collect();
    let status = aggregate(&checks);
    let node_name = state
        .nodes
        .get(&service.node_id)
        .map(|n| n.name().to_string())
        .unwrap_or_default();

    Some(ServiceInstance {
        service: service.clone(),
        node_name,
        job_id: alloc.job_id.clone(),
        alloc_id: alloc.id,
        alloc_status: alloc.status,
        status,
        checks,
    })
}

fn aggregate(checks: &[HealthCheckResult]) -> CheckStatus {
    checks
        .iter()
        .map(|c| c.status)
        .max_by_key(|s| severity(*s))
        .unwrap_or(CheckStatus::Passing)
}

fn severity(status: CheckStatus) -> u8 {
    match status {
        CheckStatus::Passing => 0,
        CheckStatus::Warning => 1,
        CheckStatus::Critical => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{job_spec, registration};
    use crate::model::{Placement, Resources};
    use crate::state::Command;

    fn service(alloc_id: Uuid, name: &str, tags: &[&str], check_id: &str) -> Command {
        let service_id = ServiceRegistration::service_id(alloc_id, name);
        Command::RegisterService {
            service: ServiceRegistration {
                id: service_id.clone(),
                name: name.into(),
                alloc_id,
                node_id: 1,
                address: "127.0.0.1".into(),
                port: 8080,
                tags: tags.iter().map(|t| t.to_string()).collect(),
                check_ids: vec![check_id.into()],
            },
            checks: vec![HealthCheckResult {
                check_id: check_id.into(),
                service_id,
                name: "alive".into(),
                status: CheckStatus::Critical,
                output: String::new(),
                updated_at_ms: 5,
            }],
            at_ms: 5,
        }
    }

    fn check(check_id: &str, status: CheckStatus) -> Command {
        Command::UpdateCheck {
            check_id: check_id.into(),
            status,
            output: String::new(),
            at_ms: 6,
        }
    }

    /// Two running allocations of `web`, one tagged `v2`.
    fn cluster() -> ClusterState {
        let mut state = ClusterState::new();
        let mut spec = job_spec("web");
        spec.count = 2;
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let mut commands = vec![
            Command::RegisterNode {
                registration: registration(1, Resources::new(4000, 4096, 0, 0)),
                at_ms: 1,
            },
            Command::SubmitJob {
                job: spec.into_job().unwrap(),
                at_ms: 2,
            },
        ];
        for (slot, id) in [a, b].into_iter().enumerate() {
            commands.push(Command::PlaceAllocation {
                placement: Placement {
                    alloc_id: id,
                    job_id: "web".into(),
                    job_version: 0,
                    slot: slot as u32,
                    node_id: 1,
                    previous_allocation: None,
                },
                at_ms: 3,
            });
            commands.push(Command::UpdateAllocationStatus {
                alloc_id: id,
                status: AllocStatus::Running,
                message: None,
                restarts: 0,
                at_ms: 4,
            });
        }
        commands.push(service(a, "web", &["v1"], "a:alive"));
        commands.push(service(b, "web", &["v2"], "b:alive"));
        for (i, command) in commands.iter().enumerate() {
            state.apply(i as u64 + 1, None, command);
        }
        state
    }

    fn apply(state: &mut ClusterState, command: Command) {
        let index = state.last_applied + 1;
        state.apply(index, None, &command);
    }

    #[test]
    fn test_critical_instances_are_hidden() {
        let mut state = cluster();
        assert!(lookup(&state, "web", &ServiceQuery::default()).is_empty());

        apply(&mut state, check("a:alive", CheckStatus::Passing));
        let found = lookup(&state, "web", &ServiceQuery::default());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].alloc_id, Uuid::from_u128(1));
        assert_eq!(found[0].node_name, "node-1");

        let all = ServiceQuery {
            all: true,
            ..Default::default()
        };
        assert_eq!(lookup(&state, "web", &all).len(), 2);
    }

    #[test]
    fn test_warning_is_visible_unless_passing_requested() {
        let mut state = cluster();
        apply(&mut state, check("a:alive", CheckStatus::Warning));
        assert_eq!(lookup(&state, "web", &ServiceQuery::default()).len(), 1);

        let passing = ServiceQuery {
            passing: true,
            ..Default::default()
        };
        assert!(lookup(&state, "web", &passing).is_empty());
    }

    #[test]
    fn test_tag_filter_and_catalog() {
        let mut state = cluster();
        apply(&mut state, check("a:alive", CheckStatus::Passing));
        apply(&mut state, check("b:alive", CheckStatus::Passing));

        let v2 = ServiceQuery {
            tag: Some("v2".into()),
            ..Default::default()
        };
        let found = lookup(&state, "web", &v2);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].alloc_id, Uuid::from_u128(2));

        let names = catalog(&state);
        assert_eq!(names.len(), 1);
        assert_eq!(
            names["web"].iter().cloned().collect::<Vec<_>>(),
            vec!["v1".to_string(), "v2".to_string()]
        );
    }

    #[test]
    fn test_terminal_allocation_drops_out() {
        let mut state = cluster();
        apply(&mut state, check("a:alive", CheckStatus::Passing));
        apply(
            &mut state,
            Command::UpdateAllocationStatus {
                alloc_id: Uuid::from_u128(1),
                status: AllocStatus::Failed,
                message: None,
                restarts: 0,
                at_ms: 7,
            },
        );
        assert!(lookup(&state, "web", &ServiceQuery::default()).is_empty());
    }
}
