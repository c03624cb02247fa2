use std::collections::BTreeMap;

use crate::error::Result;
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, LogEntry as ProtoLogEntry, Member, VoteRequest, VoteResponse,
};
use crate::raft::log::LogEntry;
use crate::raft::state::{RaftRole, RaftState, Snapshot};

/// Handle RequestVote RPC
pub fn handle_request_vote(state: &mut RaftState, req: &VoteRequest, my_id: u64) -> VoteResponse {
    // If request term is greater, update our term and become follower
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    let vote_granted = if req.term < state.current_term {
        false
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        // Already voted for someone else in this term
        false
    } else if !state.is_log_up_to_date(req.last_log_index, req.last_log_term) {
        false
    } else {
        state.voted_for = Some(req.candidate_id);
        true
    };

    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    VoteResponse {
        term: state.current_term,
        vote_granted,
    }
}

/// Handle AppendEntries RPC.
///
/// On success `match_index` is the last index known to agree with the
/// leader; on rejection it is a hint for where the leader should retry.
pub fn handle_append_entries(
    state: &mut RaftState,
    req: &AppendEntriesRequest,
    my_id: u64,
) -> Result<AppendEntriesResponse> {
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    if req.term < state.current_term {
        return Ok(AppendEntriesResponse {
            term: state.current_term,
            success: false,
            match_index: state.last_log_index(),
        });
    }

    // Valid AppendEntries from leader - reset to follower if we're a candidate
    if state.role != RaftRole::Follower {
        state.become_follower(req.term);
    }
    state.leader_id = Some(req.leader_id);

    // Anything at or before our snapshot point is committed and therefore matches.
    let prev_matches = req.prev_log_index < state.log.offset()
        || state.log.term_at(req.prev_log_index) == Some(req.prev_log_term);
    if !prev_matches {
        let hint = if req.prev_log_index > state.last_log_index() {
            state.last_log_index()
        } else {
            req.prev_log_index.saturating_sub(1)
        };
        return Ok(AppendEntriesResponse {
            term: state.current_term,
            success: false,
            match_index: hint,
        });
    }

    let entries = req
        .entries
        .iter()
        .map(proto_to_log_entry)
        .collect::<Result<Vec<_>>>()?;
    let last_new_index = req.prev_log_index + entries.len() as u64;
    if !entries.is_empty() {
        let count = entries.len();
        state.log.append_from_leader(entries);
        tracing::debug!(
            node_id = my_id,
            entries_appended = count,
            new_last_index = state.last_log_index(),
            "Appended entries"
        );
    }

    if req.leader_commit > state.commit_index {
        state.commit_index = req.leader_commit.min(last_new_index).max(state.commit_index);
    }

    Ok(AppendEntriesResponse {
        term: state.current_term,
        success: true,
        match_index: last_new_index.max(state.log.offset()),
    })
}

/// Handle InstallSnapshot RPC from a leader whose log no longer holds the
/// entries this follower is missing.
pub fn handle_install_snapshot(
    state: &mut RaftState,
    req: InstallSnapshotRequest,
    my_id: u64,
) -> InstallSnapshotResponse {
    if req.term > state.current_term {
        state.become_follower(req.term);
    }
    if req.term < state.current_term {
        return InstallSnapshotResponse {
            term: state.current_term,
        };
    }
    if state.role != RaftRole::Follower {
        state.become_follower(req.term);
    }
    state.leader_id = Some(req.leader_id);

    if req.last_included_index <= state.last_applied {
        return InstallSnapshotResponse {
            term: state.current_term,
        };
    }

    tracing::info!(
        node_id = my_id,
        last_included_index = req.last_included_index,
        last_included_term = req.last_included_term,
        "Installing snapshot from leader"
    );

    state
        .log
        .reset_to_snapshot(req.last_included_index, req.last_included_term);
    let voters = members_to_voters(&req.voters);
    if !voters.is_empty() {
        state.voters = voters.clone();
    }
    state.snapshot = Some(Snapshot {
        last_included_index: req.last_included_index,
        last_included_term: req.last_included_term,
        voters,
        data: req.data,
    });
    state.pending_snapshot = true;
    state.commit_index = state.commit_index.max(req.last_included_index);

    InstallSnapshotResponse {
        term: state.current_term,
    }
}

pub fn log_entry_to_proto(entry: &LogEntry) -> Result<ProtoLogEntry> {
    Ok(ProtoLogEntry {
        term: entry.term,
        index: entry.index,
        request_id: entry.request_id.clone().unwrap_or_default(),
        command: serde_json::to_vec(&entry.command)?,
    })
}

pub fn proto_to_log_entry(proto: &ProtoLogEntry) -> Result<LogEntry> {
    Ok(LogEntry {
        term: proto.term,
        index: proto.index,
        request_id: if proto.request_id.is_empty() {
            None
        } else {
            Some(proto.request_id.clone())
        },
        command: serde_json::from_slice(&proto.command)?,
    })
}

pub fn voters_to_members(voters: &BTreeMap<u64, String>) -> Vec<Member> {
    voters
        .iter()
        .map(|(id, addr)| Member {
            node_id: *id,
            rpc_addr: addr.clone(),
        })
        .collect()
}

pub fn members_to_voters(members: &[Member]) -> BTreeMap<u64, String> {
    members
        .iter()
        .map(|m| (m.node_id, m.rpc_addr.clone()))
        .collect()
}
