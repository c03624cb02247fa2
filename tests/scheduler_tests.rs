//! Scheduler behaviour driven through the replicated state machine:
//! placement filtering, bin packing, blocked jobs, dispatch and request
//! deduplication. No networking involved.

use std::collections::BTreeMap;

use stevedore::error::ValidationError;
use stevedore::model::{
    AllocStatus, Constraint, ConstraintOperator, JobSpec, JobStatus, JobType, MetaKind,
    MetaValidation, NodeRegistration, NodeStatus, ParameterizedSpec, PlacementFailure, Resources,
    RestartPolicy, TaskSpec,
};
use stevedore::scheduler::{dispatch, dispatch_id, plan, select_node, Reservations};
use stevedore::state::{ApplyOutcome, ClusterState, Command};

fn spec(id: &str, cpu: u64) -> JobSpec {
    JobSpec {
        id: id.to_string(),
        job_type: JobType::Batch,
        count: 1,
        datacenters: vec![],
        constraints: vec![],
        task: TaskSpec {
            driver: "exec".into(),
            command: "true".into(),
            args: vec![],
            env: BTreeMap::new(),
            image: None,
            resources: Resources::new(cpu, 64, 0, 0),
            services: vec![],
        },
        restart: RestartPolicy::default(),
        update: None,
        parameterized: None,
        meta: BTreeMap::new(),
    }
}

fn node(id: u64, datacenter: &str, cpu: u64) -> NodeRegistration {
    NodeRegistration {
        id,
        name: format!("node-{}", id),
        datacenter: datacenter.into(),
        class: None,
        attributes: BTreeMap::new(),
        address: "127.0.0.1".into(),
        rpc_addr: format!("127.0.0.1:{}", 7000 + id),
        http_addr: format!("127.0.0.1:{}", 8000 + id),
        resources: Resources::new(cpu, 4096, 0, 0),
    }
}

/// Replicated state fed one command at a time, as a follower would see it.
struct Harness {
    state: ClusterState,
    index: u64,
}

impl Harness {
    fn new(nodes: Vec<NodeRegistration>) -> Self {
        let mut h = Self {
            state: ClusterState::new(),
            index: 0,
        };
        for registration in nodes {
            h.apply(Command::RegisterNode {
                registration,
                at_ms: 0,
            });
        }
        h
    }

    fn apply(&mut self, command: Command) -> ApplyOutcome {
        self.index += 1;
        self.state.apply(self.index, None, &command)
    }

    fn submit(&mut self, spec: JobSpec) {
        let job = spec.into_job().expect("valid job spec");
        assert_eq!(self.apply(Command::SubmitJob { job, at_ms: 0 }), ApplyOutcome::Applied);
    }

    /// Run the planner once and commit everything it decided.
    fn schedule(&mut self, now_ms: i64) -> Vec<Command> {
        let commands = plan(&self.state, now_ms);
        for command in &commands {
            self.apply(command.clone());
        }
        commands
    }

    fn nodes_of(&self, job_id: &str) -> Vec<u64> {
        self.state
            .allocations_for_job(job_id)
            .iter()
            .map(|a| a.node_id)
            .collect()
    }
}

#[test]
fn test_constraint_limits_candidate_nodes() {
    let mut gpu = node(2, "dc1", 1000);
    gpu.class = Some("gpu".into());
    let mut h = Harness::new(vec![node(1, "dc1", 8000), gpu]);

    let mut job = spec("train", 100);
    job.constraints.push(Constraint {
        attribute: "node.class".into(),
        operator: ConstraintOperator::Equal,
        value: "gpu".into(),
    });
    h.submit(job);
    h.schedule(0);

    assert_eq!(h.nodes_of("train"), vec![2]);
}

#[test]
fn test_datacenter_filter_and_unsatisfiable_constraint() {
    let mut h = Harness::new(vec![node(1, "dc1", 1000), node(2, "dc2", 1000)]);

    let mut west = spec("west", 100);
    west.datacenters = vec!["dc2".into()];
    h.submit(west);

    let mut nowhere = spec("nowhere", 100);
    nowhere.constraints.push(Constraint {
        attribute: "attr.rack".into(),
        operator: ConstraintOperator::Equal,
        value: "r9".into(),
    });
    h.submit(nowhere);
    h.schedule(0);

    assert_eq!(h.nodes_of("west"), vec![2]);
    assert!(h.nodes_of("nowhere").is_empty());
    assert!(matches!(
        h.state.jobs["nowhere"].blocked,
        Some(PlacementFailure::ConstraintUnsatisfiable { .. })
    ));
}

#[test]
fn test_allocations_spread_to_least_utilised_nodes() {
    let mut h = Harness::new(vec![node(1, "dc1", 1000), node(2, "dc1", 1000)]);

    let mut web = spec("web", 400);
    web.count = 2;
    h.submit(web);
    h.schedule(0);

    let mut nodes = h.nodes_of("web");
    nodes.sort();
    assert_eq!(nodes, vec![1, 2], "Reservations should steer the second slot away");
}

#[test]
fn test_capacity_exhaustion_blocks_then_unblocks() {
    let mut h = Harness::new(vec![node(1, "dc1", 500)]);

    h.submit(spec("big", 400));
    h.submit(spec("bigger", 400));
    h.schedule(0);

    assert_eq!(h.nodes_of("big"), vec![1]);
    assert!(h.nodes_of("bigger").is_empty());
    assert_eq!(
        h.state.jobs["bigger"].blocked,
        Some(PlacementFailure::InsufficientResources {
            dimension: "cpu".into()
        })
    );

    // A finished batch allocation frees its share of the node.
    let alloc_id = h.state.slot_head("big", 0).unwrap().id;
    h.apply(Command::UpdateAllocationStatus {
        alloc_id,
        status: AllocStatus::Complete,
        message: None,
        restarts: 0,
        at_ms: 10,
    });
    h.schedule(20);

    assert_eq!(h.nodes_of("bigger"), vec![1]);
    assert_eq!(h.state.jobs["bigger"].blocked, None);
}

#[test]
fn test_no_alive_nodes_reports_no_nodes() {
    let mut h = Harness::new(vec![node(1, "dc1", 1000)]);
    h.apply(Command::UpdateNodeStatus {
        node_id: 1,
        status: NodeStatus::Dead,
        at_ms: 0,
    });

    let result = select_node(&h.state, &spec("web", 100), &Reservations::new());

    assert_eq!(result, Err(PlacementFailure::NoNodes));
}

#[test]
fn test_service_on_dead_node_is_replaced_elsewhere() {
    let mut h = Harness::new(vec![node(1, "dc1", 1000), node(2, "dc1", 1000)]);
    let mut api = spec("api", 100);
    api.job_type = JobType::Service;
    h.submit(api);
    h.schedule(0);

    let first = h.state.slot_head("api", 0).unwrap().clone();
    h.apply(Command::UpdateNodeStatus {
        node_id: first.node_id,
        status: NodeStatus::Dead,
        at_ms: 50,
    });
    assert_eq!(h.state.allocations[&first.id].status, AllocStatus::Lost);

    h.schedule(60);

    let replacement = h.state.slot_head("api", 0).unwrap().clone();
    assert_ne!(replacement.node_id, first.node_id);
    assert_eq!(replacement.previous_allocation, Some(first.id));
    // Placed but not yet started by its node.
    assert_eq!(h.state.jobs["api"].status, JobStatus::Pending);

    h.apply(Command::UpdateAllocationStatus {
        alloc_id: replacement.id,
        status: AllocStatus::Running,
        message: None,
        restarts: 0,
        at_ms: 70,
    });
    assert_eq!(h.state.jobs["api"].status, JobStatus::Running);
}

#[test]
fn test_templates_are_never_placed() {
    let mut h = Harness::new(vec![node(1, "dc1", 1000)]);
    let mut train = spec("train", 100);
    train.parameterized = Some(ParameterizedSpec {
        meta_required: vec!["MODEL_NAME".into()],
        ..Default::default()
    });
    h.submit(train);

    assert!(h.schedule(0).is_empty());
    assert!(h.state.allocations.is_empty());
}

#[test]
fn test_dispatch_builds_a_placeable_child() {
    let mut h = Harness::new(vec![node(1, "dc1", 1000)]);
    let mut train = spec("train", 100);
    train.parameterized = Some(ParameterizedSpec {
        meta_required: vec!["MODEL_NAME".into()],
        meta_optional: vec![],
        validation: BTreeMap::from([(
            "MODEL_NAME".to_string(),
            MetaValidation {
                kind: MetaKind::String,
                pattern: Some("^[a-z0-9-]+$".into()),
                ..Default::default()
            },
        )]),
    });
    h.submit(train);
    let template = h.state.jobs["train"].job.as_template().unwrap().clone();

    let missing = dispatch(&template, &BTreeMap::new(), "train-dispatch-x");
    assert!(matches!(missing, Err(ValidationError::MissingMetaKey(k)) if k == "MODEL_NAME"));

    let bad = BTreeMap::from([("MODEL_NAME".to_string(), "Bad Name".to_string())]);
    assert!(dispatch(&template, &bad, "train-dispatch-x").is_err());

    let child_id = dispatch_id("train", Some("req-1"));
    assert_eq!(child_id, dispatch_id("train", Some("req-1")));
    assert!(child_id.starts_with("train-dispatch-"));

    let meta = BTreeMap::from([("MODEL_NAME".to_string(), "exp-1".to_string())]);
    let child = dispatch(&template, &meta, &child_id).unwrap();
    assert_eq!(child.parent_id.as_deref(), Some("train"));
    assert_eq!(child.spec.task.env["MODEL_NAME"], "exp-1");

    h.submit(child.spec.clone());
    h.schedule(0);
    assert_eq!(h.nodes_of(&child_id), vec![1]);
}

#[test]
fn test_replayed_request_id_is_applied_once() {
    let mut state = ClusterState::new();
    let submit = Command::SubmitJob {
        job: spec("once", 100).into_job().unwrap(),
        at_ms: 0,
    };

    assert_eq!(state.apply(1, Some("req-7"), &submit), ApplyOutcome::Applied);
    assert_eq!(
        state.apply(2, Some("req-7"), &submit),
        ApplyOutcome::Duplicate { first_index: 1 }
    );

    assert_eq!(state.jobs["once"].version, 0);
    assert_eq!(state.applied_request("req-7"), Some(1));
    assert_eq!(state.last_applied, 2);
}
