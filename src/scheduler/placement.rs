use std::collections::BTreeMap;

use crate::model::{JobSpec, PlacementFailure, Resources};
use crate::state::ClusterState;

/// Capacity claimed by decisions made earlier in the same planning pass,
/// not yet visible in the applied state.
#[derive(Debug, Default, Clone)]
pub struct Reservations {
    claimed: BTreeMap<u64, Resources>,
}

impl Reservations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, node_id: u64, resources: &Resources) {
        let entry = self.claimed.entry(node_id).or_default();
        *entry = entry.add(resources);
    }

    pub fn get(&self, node_id: u64) -> Resources {
        self.claimed.get(&node_id).copied().unwrap_or_default()
    }
}

/// Pick the node for one allocation of `spec`.
///
/// A node is eligible when it is alive, in one of the job's datacenters,
/// satisfies every constraint and has room for the task in every
/// dimension. Among eligible nodes the one least utilised after placement
/// wins; ties go to the lowest node id.
pub fn select_node(
    state: &ClusterState,
    spec: &JobSpec,
    reservations: &Reservations,
) -> Result<u64, PlacementFailure> {
    let mut candidates: Vec<_> = state
        .nodes
        .values()
        .filter(|n| n.status.is_schedulable())
        .filter(|n| {
            spec.datacenters.is_empty()
                || spec.datacenters.contains(&n.registration.datacenter)
        })
        .collect();
    if candidates.is_empty() {
        return Err(PlacementFailure::NoNodes);
    }

    for constraint in &spec.constraints {
        candidates.retain(|n| constraint.is_satisfied_by(&n.registration));
        if candidates.is_empty() {
            return Err(PlacementFailure::ConstraintUnsatisfiable {
                constraint: constraint.to_string(),
            });
        }
    }

    let request = spec.task.resources;
    let mut best: Option<(u64, f64)> = None;
    let mut shortfall: Option<&'static str> = None;
    for node in candidates {
        let capacity = node.registration.resources;
        let used = state.node_used(node.id()).add(&reservations.get(node.id()));
        let available = capacity.saturating_sub(&used);
        if let Some(dimension) = request.exceeded_dimension(&available) {
            shortfall.get_or_insert(dimension);
            continue;
        }
        let score = Resources::utilization(&used.add(&request), &capacity);
        match best {
            Some((_, best_score)) if score >= best_score => {}
            _ => best = Some((node.id(), score)),
        }
    }

    match best {
        Some((node_id, _)) => Ok(node_id),
        None => Err(PlacementFailure::InsufficientResources {
            dimension: shortfall.unwrap_or("cpu").to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{job_spec, registration};
    use crate::model::{Constraint, ConstraintOperator, NodeStatus};
    use crate::state::Command;

    fn cluster(nodes: &[(u64, Resources)]) -> ClusterState {
        let mut state = ClusterState::new();
        for (i, (id, resources)) in nodes.iter().enumerate() {
            state.apply(
                i as u64 + 1,
                None,
                &Command::RegisterNode {
                    registration: registration(*id, *resources),
                    at_ms: 0,
                },
            );
        }
        state
    }

    #[test]
    fn prefers_least_utilised_node() {
        let state = cluster(&[
            (1, Resources::new(1000, 1000, 0, 0)),
            (2, Resources::new(4000, 4000, 0, 0)),
        ]);
        let spec = job_spec("web");
        assert_eq!(select_node(&state, &spec, &Reservations::new()), Ok(2));
    }

    #[test]
    fn ties_go_to_lowest_id() {
        let state = cluster(&[
            (3, Resources::new(1000, 1000, 0, 0)),
            (2, Resources::new(1000, 1000, 0, 0)),
        ]);
        assert_eq!(
            select_node(&state, &job_spec("web"), &Reservations::new()),
            Ok(2)
        );
    }

    #[test]
    fn reservations_count_against_capacity() {
        let state = cluster(&[
            (1, Resources::new(1000, 1000, 0, 0)),
            (2, Resources::new(1000, 1000, 0, 0)),
        ]);
        let mut spec = job_spec("big");
        spec.task.resources = Resources::new(800, 100, 0, 0);

        let mut reservations = Reservations::new();
        assert_eq!(select_node(&state, &spec, &reservations), Ok(1));
        reservations.reserve(1, &spec.task.resources);
        assert_eq!(select_node(&state, &spec, &reservations), Ok(2));
        reservations.reserve(2, &spec.task.resources);
        assert_eq!(
            select_node(&state, &spec, &reservations),
            Err(PlacementFailure::InsufficientResources {
                dimension: "cpu".into()
            })
        );
    }

    #[test]
    fn reports_unsatisfiable_constraint() {
        let state = cluster(&[(1, Resources::new(1000, 1000, 0, 0))]);
        let mut spec = job_spec("gpu");
        spec.constraints.push(Constraint {
            attribute: "node.class".into(),
            operator: ConstraintOperator::Equal,
            value: "gpu".into(),
        });
        assert_eq!(
            select_node(&state, &spec, &Reservations::new()),
            Err(PlacementFailure::ConstraintUnsatisfiable {
                constraint: "node.class = gpu".into()
            })
        );
    }

    #[test]
    fn only_alive_nodes_in_requested_datacenter() {
        let mut state = cluster(&[(1, Resources::new(1000, 1000, 0, 0))]);
        let mut spec = job_spec("web");
        spec.datacenters = vec!["eu-west".into()];
        assert_eq!(
            select_node(&state, &spec, &Reservations::new()),
            Err(PlacementFailure::NoNodes)
        );

        spec.datacenters.clear();
        state.apply(
            10,
            None,
            &Command::UpdateNodeStatus {
                node_id: 1,
                status: NodeStatus::Suspect,
                at_ms: 0,
            },
        );
        assert_eq!(
            select_node(&state, &spec, &Reservations::new()),
            Err(PlacementFailure::NoNodes)
        );
    }
}
