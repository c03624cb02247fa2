use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::MembershipConfig;
use crate::model::{NodeRegistration, NodeStatus};
use crate::state::{ClusterState, Command};

/// Leader-side heartbeat bookkeeping.
///
/// Nodes are downgraded alive -> suspect -> dead by how long they have been
/// silent; every decision comes out as a command to propose, never as a
/// direct state change.
#[derive(Debug)]
pub struct FailureDetector {
    suspect_after: Duration,
    dead_after: Duration,
    last_seen: HashMap<u64, Instant>,
    /// Registrations received since the last evaluation.
    pending: HashMap<u64, NodeRegistration>,
}

impl FailureDetector {
    pub fn new(config: &MembershipConfig) -> Self {
        Self {
            suspect_after: config.heartbeat_interval * config.suspect_multiplier.max(1),
            dead_after: config.heartbeat_interval
                * config.dead_multiplier.max(config.suspect_multiplier + 1),
            last_seen: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn observe(&mut self, registration: NodeRegistration, now: Instant) {
        self.last_seen.insert(registration.id, now);
        self.pending.insert(registration.id, registration);
    }

    /// Forget all timing so every known node gets a full grace period.
    pub fn reset(&mut self) {
        self.last_seen.clear();
        self.pending.clear();
    }

    /// Commands that bring the replicated node table in line with what
    /// this detector has observed.
    pub fn evaluate(&mut self, state: &ClusterState, now: Instant, at_ms: i64) -> Vec<Command> {
        let mut commands = Vec::new();
        let mut pending: Vec<NodeRegistration> = self.pending.drain().map(|(_, r)| r).collect();
        pending.sort_by_key(|r| r.id);

        for registration in pending {
            match state.nodes.get(&registration.id) {
                Some(node) if node.registration == registration => {
                    if node.status != NodeStatus::Alive {
                        tracing::info!(
                            peer_id = registration.id,
                            from = %node.status,
                            "Node heartbeat resumed"
                        );
                        commands.push(Command::UpdateNodeStatus {
                            node_id: registration.id,
                            status: NodeStatus::Alive,
                            at_ms,
                        });
                    }
                }
                _ => commands.push(Command::RegisterNode {
                    registration,
                    at_ms,
                }),
            }
        }

        for (id, node) in &state.nodes {
            if !matches!(node.status, NodeStatus::Alive | NodeStatus::Suspect) {
                continue;
            }
            if commands.iter().any(|c| command_targets(c, *id)) {
                continue;
            }
            let seen = *self.last_seen.entry(*id).or_insert(now);
            let silent = now.saturating_duration_since(seen);
            let next = if silent >= self.dead_after {
                NodeStatus::Dead
            } else if silent >= self.suspect_after && node.status == NodeStatus::Alive {
                NodeStatus::Suspect
            } else {
                continue;
            };
            tracing::warn!(
                peer_id = id,
                silent_ms = silent.as_millis() as u64,
                status = %next,
                "Node missed heartbeats"
            );
            commands.push(Command::UpdateNodeStatus {
                node_id: *id,
                status: next,
                at_ms,
            });
        }
        commands
    }
}

fn command_targets(command: &Command, node_id: u64) -> bool {
    match command {
        Command::RegisterNode { registration, .. } => registration.id == node_id,
        Command::UpdateNodeStatus { node_id: id, .. } => *id == node_id,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::registration;
    use crate::model::Resources;

    fn config() -> MembershipConfig {
        MembershipConfig {
            heartbeat_interval: Duration::from_secs(1),
            suspect_multiplier: 3,
            dead_multiplier: 10,
        }
    }

    fn state_with(reg: &NodeRegistration) -> ClusterState {
        let mut state = ClusterState::new();
        state.apply(
            1,
            None,
            &Command::RegisterNode {
                registration: reg.clone(),
                at_ms: 0,
            },
        );
        state
    }

    #[test]
    fn first_heartbeat_registers_node() {
        let mut detector = FailureDetector::new(&config());
        let reg = registration(2, Resources::new(1000, 1024, 0, 0));
        detector.observe(reg.clone(), Instant::now());

        let commands = detector.evaluate(&ClusterState::new(), Instant::now(), 10);
        assert_eq!(
            commands,
            vec![Command::RegisterNode {
                registration: reg,
                at_ms: 10
            }]
        );
    }

    #[test]
    fn unchanged_heartbeat_is_silent() {
        let mut detector = FailureDetector::new(&config());
        let reg = registration(2, Resources::new(1000, 1024, 0, 0));
        let state = state_with(&reg);
        detector.observe(reg, Instant::now());
        assert!(detector.evaluate(&state, Instant::now(), 10).is_empty());
    }

    #[test]
    fn silence_downgrades_to_suspect_then_dead() {
        let mut detector = FailureDetector::new(&config());
        let reg = registration(2, Resources::new(1000, 1024, 0, 0));
        let mut state = state_with(&reg);
        let start = Instant::now();
        detector.observe(reg, start);
        assert!(detector.evaluate(&state, start, 0).is_empty());

        let commands = detector.evaluate(&state, start + Duration::from_secs(3), 3000);
        assert_eq!(
            commands,
            vec![Command::UpdateNodeStatus {
                node_id: 2,
                status: NodeStatus::Suspect,
                at_ms: 3000
            }]
        );
        state.apply(2, None, &commands[0]);

        // Suspect stays suspect until the dead threshold.
        assert!(detector
            .evaluate(&state, start + Duration::from_secs(5), 5000)
            .is_empty());
        let commands = detector.evaluate(&state, start + Duration::from_secs(10), 10_000);
        assert!(matches!(
            commands[0],
            Command::UpdateNodeStatus {
                status: NodeStatus::Dead,
                ..
            }
        ));
    }

    #[test]
    fn heartbeat_revives_suspect_node() {
        let mut detector = FailureDetector::new(&config());
        let reg = registration(2, Resources::new(1000, 1024, 0, 0));
        let mut state = state_with(&reg);
        state.apply(
            2,
            None,
            &Command::UpdateNodeStatus {
                node_id: 2,
                status: NodeStatus::Suspect,
                at_ms: 1,
            },
        );

        detector.observe(reg, Instant::now());
        let commands = detector.evaluate(&state, Instant::now(), 2);
        assert_eq!(
            commands,
            vec![Command::UpdateNodeStatus {
                node_id: 2,
                status: NodeStatus::Alive,
                at_ms: 2
            }]
        );
    }

    #[test]
    fn reset_grants_fresh_grace_period() {
        let mut detector = FailureDetector::new(&config());
        let reg = registration(2, Resources::new(1000, 1024, 0, 0));
        let state = state_with(&reg);
        let start = Instant::now();
        detector.observe(reg, start);
        detector.evaluate(&state, start, 0);

        detector.reset();
        let later = start + Duration::from_secs(30);
        assert!(detector.evaluate(&state, later, 0).is_empty());
        assert!(!detector
            .evaluate(&state, later + Duration::from_secs(3), 0)
            .is_empty());
    }
}
