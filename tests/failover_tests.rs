//! Leader failure, request deduplication across failover, dead-node
//! handling and quorum loss.


use std::collections::BTreeMap;
use std::time::Duration;

use stevedore::model::{AllocStatus, JobType, ParameterizedSpec};
use test_harness::{assert_eventually, shell_job, wait_for, TestCluster};

/// New leader is elected after leader shutdown
#[tokio::test]
async fn test_new_leader_election_after_shutdown() {
    let mut cluster = TestCluster::new(3, 52100).await;

    let initial_leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");
    let initial_term = cluster
        .get_node(initial_leader)
        .unwrap()
        .raft_node
        .current_term()
        .await;

    cluster.shutdown_node(initial_leader);

    let new_leader = cluster
        .wait_for_new_leader(initial_leader, Duration::from_secs(5))
        .await
        .expect("New leader should be elected");
    assert_ne!(new_leader, initial_leader);

    let new_term = cluster
        .get_node(new_leader)
        .unwrap()
        .raft_node
        .current_term()
        .await;
    assert!(new_term > initial_term, "New leader should have a higher term");

    // The survivors still accept writes.
    cluster
        .client(new_leader)
        .submit_job(&shell_job("after-failover", "true"), None)
        .await
        .expect("Write should succeed after failover");

    cluster.shutdown().await;
}

/// A dispatch retried with the same request id after the leader dies
/// yields the original child job and nothing more.
#[tokio::test]
async fn test_dispatch_retry_across_failover_is_deduplicated() {
    let mut cluster = TestCluster::new(3, 52110).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    let mut template = shell_job("report", "sleep 30");
    template.parameterized = Some(ParameterizedSpec {
        meta_required: vec!["DAY".into()],
        ..Default::default()
    });
    cluster
        .client(leader_id)
        .submit_job(&template, None)
        .await
        .unwrap();

    let follower_id = cluster.other_node(leader_id);
    let follower = cluster.client(follower_id);
    let meta = BTreeMap::from([("DAY".to_string(), "monday".to_string())]);
    let first = follower
        .dispatch("report", meta.clone(), Some("dispatch-monday".into()))
        .await
        .expect("Dispatch should succeed");

    cluster.shutdown_node(leader_id);
    cluster
        .wait_for_new_leader(leader_id, Duration::from_secs(5))
        .await
        .expect("New leader should be elected");

    let retried = follower
        .dispatch("report", meta, Some("dispatch-monday".into()))
        .await
        .expect("Retried dispatch should succeed");
    assert_eq!(retried.job_id, first.job_id);

    let jobs = follower.jobs().await.unwrap();
    let children: Vec<_> = jobs
        .iter()
        .filter(|j| j.parent_id.as_deref() == Some("report"))
        .collect();
    assert_eq!(children.len(), 1, "Exactly one child job should exist");

    let child_id = first.job_id.clone();
    assert_eventually(
        || {
            let follower = follower.clone();
            let child_id = child_id.clone();
            async move { matches!(follower.allocations(&child_id).await, Ok(a) if !a.is_empty()) }
        },
        Duration::from_secs(5),
        "Child job should be placed",
    )
    .await;
    let allocs = follower.allocations(&child_id).await.unwrap();
    let originals = allocs
        .iter()
        .filter(|a| a.previous_allocation.is_none())
        .count();
    assert_eq!(originals, 1, "Only one original allocation for the single slot");
    assert!(allocs.iter().all(|a| a.slot == 0));

    cluster.shutdown().await;
}

/// Allocations on a crashed node are marked lost and replaced elsewhere.
#[tokio::test]
async fn test_allocations_on_dead_node_are_replaced() {
    let mut cluster = TestCluster::new(3, 52120).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let client = cluster.client(leader_id);
    assert_eventually(
        || {
            let client = client.clone();
            async move { matches!(client.nodes().await, Ok(n) if n.len() == 3) }
        },
        Duration::from_secs(5),
        "All nodes should register",
    )
    .await;

    let mut spec = shell_job("api", "sleep 60");
    spec.job_type = JobType::Service;
    client.submit_job(&spec, None).await.unwrap();

    assert_eventually(
        || {
            let client = client.clone();
            async move {
                matches!(client.allocations("api").await,
                    Ok(a) if a.iter().any(|a| a.status == AllocStatus::Running))
            }
        },
        Duration::from_secs(5),
        "Service allocation should start running",
    )
    .await;
    let victim = client.allocations("api").await.unwrap()[0].node_id;

    cluster.shutdown_node(victim);
    let survivor = cluster.other_node(victim);
    let client = cluster.client(survivor);

    assert_eventually(
        || {
            let client = client.clone();
            async move {
                match client.allocations("api").await {
                    Ok(allocs) => {
                        allocs
                            .iter()
                            .any(|a| a.node_id == victim && a.status == AllocStatus::Lost)
                            && allocs.iter().any(|a| {
                                a.node_id != victim && a.status == AllocStatus::Running
                            })
                    }
                    Err(_) => false,
                }
            }
        },
        Duration::from_secs(15),
        "Lost allocation should be replaced on a live node",
    )
    .await;

    cluster.shutdown().await;
}

/// Autopilot removes a voter that stays dead past the threshold.
#[tokio::test]
async fn test_autopilot_removes_dead_voter() {
    let mut cluster = TestCluster::new(3, 52130).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    let client = cluster.client(leader_id);
    assert_eventually(
        || {
            let client = client.clone();
            async move { matches!(client.nodes().await, Ok(n) if n.len() == 3) }
        },
        Duration::from_secs(5),
        "All nodes should register",
    )
    .await;

    let victim = cluster.other_node(leader_id);
    cluster.shutdown_node(victim);

    let survivor = cluster.other_node(victim);
    let client = cluster.client(survivor);
    let removed = wait_for(
        || {
            let client = client.clone();
            async move {
                matches!(client.peers().await,
                    Ok(peers) if peers.len() == 2 && peers.iter().all(|p| p.node_id != victim))
            }
        },
        Duration::from_secs(15),
        Duration::from_millis(100),
    )
    .await;
    assert!(removed, "Dead voter should be removed from the configuration");

    assert_eventually(
        || {
            let client = client.clone();
            async move {
                matches!(client.nodes().await, Ok(n) if n.iter().all(|n| n.id != victim))
            }
        },
        Duration::from_secs(5),
        "Dead node should be deregistered",
    )
    .await;

    cluster.shutdown().await;
}

/// With two of three voters gone, writes fail with a retryable error.
#[tokio::test]
async fn test_quorum_loss_rejects_writes() {
    let mut cluster = TestCluster::with_config(3, 52140, |c| c.autopilot.enabled = false).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    cluster
        .client(leader_id)
        .submit_job(&shell_job("before", "true"), None)
        .await
        .expect("Job should be submitted with quorum");

    let survivor = cluster.other_node(leader_id);
    for id in cluster.active_node_ids() {
        if id != survivor {
            cluster.shutdown_node(id);
        }
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    let client = cluster
        .client(survivor)
        .with_retry_for(Duration::from_secs(1));
    let err = client
        .submit_job(&shell_job("after", "true"), None)
        .await
        .expect_err("Write without quorum must fail");
    assert!(err.is_retryable(), "Quorum loss is transient: {}", err);

    // Committed state survives on the remaining node.
    let state = cluster.get_node(survivor).unwrap().store.snapshot().await;
    assert!(state.jobs.contains_key("before"));
    assert!(!state.jobs.contains_key("after"));

    cluster.shutdown().await;
}
