use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use stevedore::config::NodeConfig;
use stevedore::proto::{
    AppendEntriesRequest, InstallSnapshotRequest, JoinRequest, LogEntry as ProtoLogEntry, Member,
    VoteRequest,
};
use stevedore::raft::node::RaftNode;
use stevedore::raft::rpc::{
    handle_append_entries, handle_install_snapshot, handle_request_vote, log_entry_to_proto,
};
use stevedore::raft::state::RaftState;
use stevedore::raft::{LogEntry, RaftMessage, RaftRole, RaftStorage};
use stevedore::state::{ClusterState, Command};

fn proto_entry(term: u64, index: u64) -> ProtoLogEntry {
    log_entry_to_proto(&LogEntry {
        term,
        index,
        request_id: None,
        command: Command::Noop,
    })
    .unwrap()
}

fn append(term: u64, prev: (u64, u64), entries: Vec<ProtoLogEntry>, commit: u64) -> AppendEntriesRequest {
    AppendEntriesRequest {
        term,
        leader_id: 2,
        prev_log_index: prev.0,
        prev_log_term: prev.1,
        entries,
        leader_commit: commit,
    }
}

#[test]
fn test_request_vote_reject_stale_term() {
    let mut state = RaftState::new();
    state.current_term = 5;

    let req = VoteRequest {
        term: 3, // Lower than current term
        candidate_id: 2,
        last_log_index: 0,
        last_log_term: 0,
    };

    let resp = handle_request_vote(&mut state, &req, 1);
    assert!(!resp.vote_granted);
    assert_eq!(resp.term, 5);
}

#[test]
fn test_request_vote_reject_outdated_log() {
    let mut state = RaftState::new();
    state.current_term = 2;
    state.log.append(2, None, Command::Noop);
    state.log.append(2, None, Command::Noop);

    let req = VoteRequest {
        term: 3,
        candidate_id: 2,
        last_log_index: 5,
        last_log_term: 1, // Older last term loses even with a longer log
    };

    let resp = handle_request_vote(&mut state, &req, 1);
    assert!(!resp.vote_granted);
    assert_eq!(state.current_term, 3, "Higher term is still adopted");
    assert_eq!(state.voted_for, None);
}

#[test]
fn test_append_entries_higher_term_becomes_follower() {
    let mut state = RaftState::new();
    state.current_term = 1;
    state.become_candidate(1);
    assert_eq!(state.role, RaftRole::Candidate);

    let resp = handle_append_entries(&mut state, &append(3, (0, 0), vec![], 0), 1).unwrap();
    assert!(resp.success);
    assert_eq!(state.role, RaftRole::Follower);
    assert_eq!(state.current_term, 3);
    assert_eq!(state.leader_id, Some(2));
}

#[test]
fn test_append_entries_replaces_conflicting_suffix() {
    let mut state = RaftState::new();
    handle_append_entries(
        &mut state,
        &append(1, (0, 0), vec![proto_entry(1, 1), proto_entry(1, 2), proto_entry(1, 3)], 1),
        1,
    )
    .unwrap();

    // A new leader in term 2 disagrees from index 2 onward.
    let resp = handle_append_entries(
        &mut state,
        &append(2, (1, 1), vec![proto_entry(2, 2)], 1),
        1,
    )
    .unwrap();

    assert!(resp.success);
    assert_eq!(resp.match_index, 2);
    assert_eq!(state.last_log_index(), 2);
    assert_eq!(state.log.term_at(2), Some(2));
}

#[test]
fn test_install_snapshot_resets_log_and_voters() {
    let mut state = RaftState::new();
    state.log.append(1, None, Command::Noop);

    let resp = handle_install_snapshot(
        &mut state,
        InstallSnapshotRequest {
            term: 4,
            leader_id: 3,
            last_included_index: 40,
            last_included_term: 4,
            voters: vec![
                Member {
                    node_id: 1,
                    rpc_addr: "127.0.0.1:7001".into(),
                },
                Member {
                    node_id: 3,
                    rpc_addr: "127.0.0.1:7003".into(),
                },
            ],
            data: ClusterState::new().to_bytes().unwrap(),
        },
        1,
    );

    assert_eq!(resp.term, 4);
    assert_eq!(state.log.offset(), 40);
    assert!(state.log.is_empty());
    assert_eq!(state.commit_index, 40);
    assert!(state.pending_snapshot);
    assert_eq!(state.voters.len(), 2);
    assert_eq!(state.leader_id, Some(3));
}

#[test]
fn test_install_snapshot_from_stale_leader_is_ignored() {
    let mut state = RaftState::new();
    state.current_term = 6;

    let resp = handle_install_snapshot(
        &mut state,
        InstallSnapshotRequest {
            term: 5,
            leader_id: 3,
            last_included_index: 10,
            last_included_term: 5,
            voters: vec![],
            data: vec![],
        },
        1,
    );

    assert_eq!(resp.term, 6);
    assert!(state.snapshot.is_none());
    assert_eq!(state.log.offset(), 0);
}

#[tokio::test]
async fn test_commit_notification_on_follower_append_entries() {
    let (raft_node, _rx) = RaftNode::new(NodeConfig::default(), None).unwrap();

    {
        let mut state = raft_node.state.write().await;
        state.current_term = 1;
        state.log.append(1, None, Command::Noop);
    }

    let mut commit_rx = raft_node.subscribe_commits();
    let resp = raft_node
        .handle_append_entries(append(1, (1, 1), vec![], 1))
        .await
        .unwrap();
    assert!(resp.success);

    let result = tokio::time::timeout(Duration::from_millis(100), commit_rx.changed()).await;
    assert!(result.is_ok(), "Should receive commit notification");
    assert_eq!(*commit_rx.borrow(), 1);

    let batch = raft_node.take_committed().await;
    assert_eq!(batch.entries.len(), 1);
    assert!(batch.snapshot.is_none());
}

#[tokio::test]
async fn test_no_notification_when_commit_index_unchanged() {
    let (raft_node, _rx) = RaftNode::new(NodeConfig::default(), None).unwrap();

    let mut commit_rx = raft_node.subscribe_commits();
    let _ = commit_rx.borrow_and_update();

    let resp = raft_node
        .handle_append_entries(append(1, (0, 0), vec![], 0))
        .await
        .unwrap();
    assert!(resp.success);

    let result = tokio::time::timeout(Duration::from_millis(50), commit_rx.changed()).await;
    assert!(
        result.is_err(),
        "Should not receive notification when commit_index unchanged"
    );
}

#[tokio::test]
async fn test_join_before_bootstrap_records_voter() {
    let (raft_node, _rx) = RaftNode::new(NodeConfig::default(), None).unwrap();
    let raft_node = std::sync::Arc::new(raft_node);

    let resp = raft_node
        .handle_join(JoinRequest {
            node_id: 2,
            rpc_addr: "127.0.0.1:50052".into(),
        })
        .await;

    assert!(!resp.bootstrapped);
    assert_eq!(resp.node_id, 1);
    assert_eq!(resp.leader_id, 0);
    let voters = raft_node.voters().await;
    assert_eq!(voters.get(&2).map(String::as_str), Some("127.0.0.1:50052"));
    assert_eq!(resp.members.len(), 2);
}

#[tokio::test]
async fn test_propose_on_follower_is_rejected() {
    let (raft_node, _rx) = RaftNode::new(NodeConfig::default(), None).unwrap();
    let err = raft_node
        .propose(None, Command::Noop, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), "not_leader");
}

/// A node whose raft directory is swapped for a plain file after recovery,
/// so every later write to disk fails.
fn node_with_failing_disk(dir: &Path) -> (RaftNode, tokio::sync::mpsc::Receiver<RaftMessage>) {
    let storage = Arc::new(RaftStorage::open(dir, 1, "node-1").unwrap());
    let node = RaftNode::new(NodeConfig::default(), Some(storage)).unwrap();
    std::fs::remove_dir_all(dir.join("raft")).unwrap();
    std::fs::write(dir.join("raft"), b"").unwrap();
    node
}

fn vote_request(term: u64) -> VoteRequest {
    VoteRequest {
        term,
        candidate_id: 2,
        last_log_index: 0,
        last_log_term: 0,
    }
}

#[tokio::test]
async fn test_vote_is_refused_when_it_cannot_be_persisted() {
    let healthy_dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(RaftStorage::open(healthy_dir.path(), 1, "node-1").unwrap());
    let (healthy, _rx) = RaftNode::new(NodeConfig::default(), Some(storage)).unwrap();
    assert!(healthy.handle_vote_request(vote_request(2)).await.vote_granted);

    let dir = tempfile::tempdir().unwrap();
    let (node, _rx) = node_with_failing_disk(dir.path());
    let resp = node.handle_vote_request(vote_request(2)).await;

    assert!(!resp.vote_granted);
    assert_eq!(resp.term, 2);
}

#[tokio::test]
async fn test_append_is_not_acknowledged_when_it_cannot_be_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let (node, _rx) = node_with_failing_disk(dir.path());

    let result = node
        .handle_append_entries(append(1, (0, 0), vec![proto_entry(1, 1)], 0))
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_leader_steps_down_when_proposal_cannot_be_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let (node, _rx) = node_with_failing_disk(dir.path());
    {
        let mut state = node.state.write().await;
        state.current_term = 1;
        state.role = RaftRole::Leader;
        state.leader_id = Some(node.id);
    }

    let err = node
        .propose(None, Command::Noop, Duration::from_millis(100))
        .await
        .unwrap_err();

    assert_eq!(err.reason_code(), "storage_error");
    let state = node.state.read().await;
    assert_eq!(state.role, RaftRole::Follower);
    assert_eq!(state.commit_index, 0);
}
