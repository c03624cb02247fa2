use std::collections::{BTreeMap, HashMap};

use crate::raft::log::ReplicatedLog;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Serialized state machine covering every entry up to `last_included_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub voters: BTreeMap<u64, String>,
    pub data: Vec<u8>,
}

/// Consensus state of one node.
///
/// Safety rests on a few rules kept by the methods below: one vote per
/// term (a same-term step-down keeps `voted_for`), votes only for logs at
/// least as current as ours, and commits counted only for entries of the
/// current term across a quorum of `voters`. Followers truncate at the
/// first conflicting term; leaders only append. `snapshot` never covers an
/// index past `commit_index`.
#[derive(Debug)]
pub struct RaftState {
    // Persistent state
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: ReplicatedLog,
    /// Voting members, node id to RPC address. Always includes this node.
    pub voters: BTreeMap<u64, String>,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<u64, u64>,
    pub match_index: HashMap<u64, u64>,

    // Current role
    pub role: RaftRole,

    // Known leader (if any)
    pub leader_id: Option<u64>,

    // Votes received in current election (for candidates)
    pub votes_received: u64,

    /// Latest snapshot, taken locally or installed by the leader.
    pub snapshot: Option<Snapshot>,
    /// An installed snapshot the apply loop has not restored yet.
    pub pending_snapshot: bool,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: ReplicatedLog::new(),
            voters: BTreeMap::new(),
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            role: RaftRole::Follower,
            leader_id: None,
            votes_received: 0,
            snapshot: None,
            pending_snapshot: false,
        }
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    /// Check if candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        let our_last_index = self.last_log_index();

        // Candidate's log is up-to-date if:
        // 1. Their last term is greater, OR
        // 2. Terms are equal and their index is >= ours
        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index)
    }

    /// Votes (or acknowledgements) needed for a majority of voters.
    pub fn quorum_size(&self) -> usize {
        self.voters.len().max(1) / 2 + 1
    }

    /// Transition to follower state.
    ///
    /// The vote is only forgotten when the term actually advances.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        self.role = RaftRole::Follower;
        self.votes_received = 0;
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self, my_id: u64) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.votes_received = 1; // Vote for self
        self.leader_id = None;
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, my_id: u64) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);

        let last_log_index = self.last_log_index();
        self.next_index.clear();
        self.match_index.clear();
        for &peer_id in self.voters.keys().filter(|&&id| id != my_id) {
            self.next_index.insert(peer_id, last_log_index + 1);
            self.match_index.insert(peer_id, 0);
        }
    }

    /// Start tracking voters added while leading.
    pub fn track_new_peers(&mut self, my_id: u64) {
        let next = self.last_log_index() + 1;
        let peers: Vec<u64> = self.voters.keys().copied().filter(|&id| id != my_id).collect();
        for peer_id in &peers {
            self.next_index.entry(*peer_id).or_insert(next);
            self.match_index.entry(*peer_id).or_insert(0);
        }
        self.next_index.retain(|id, _| peers.contains(id));
        self.match_index.retain(|id, _| peers.contains(id));
    }

    /// Advance `commit_index` to the highest index replicated on a quorum
    /// whose entry belongs to the current term. Returns true if it moved.
    pub fn advance_commit_index(&mut self, my_id: u64) -> bool {
        let mut replicated: Vec<u64> = self
            .voters
            .keys()
            .map(|id| {
                if *id == my_id {
                    self.last_log_index()
                } else {
                    self.match_index.get(id).copied().unwrap_or(0)
                }
            })
            .collect();
        if replicated.is_empty() {
            replicated.push(self.last_log_index());
        }
        replicated.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = replicated[self.quorum_size().min(replicated.len()) - 1];
        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.current_term) {
            self.commit_index = candidate;
            return true;
        }
        false
    }

    /// Enough voters are known to hold the first election.
    pub fn is_bootstrap_ready(&self, bootstrap_expect: usize) -> bool {
        self.voters.len() >= bootstrap_expect.max(1)
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Command;

    fn three_voters() -> RaftState {
        let mut state = RaftState::new();
        for id in 1..=3 {
            state.voters.insert(id, format!("127.0.0.1:{}", 7000 + id));
        }
        state
    }

    #[test]
    fn test_new_state_is_follower() {
        let state = RaftState::new();
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 0);
        assert_eq!(state.voted_for, None);
        assert!(state.log.is_empty());
    }

    #[test]
    fn test_become_candidate() {
        let mut state = RaftState::new();
        state.become_candidate(1);

        assert_eq!(state.role, RaftRole::Candidate);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for, Some(1));
        assert_eq!(state.votes_received, 1); // Self-vote
        assert_eq!(state.leader_id, None);
    }

    #[test]
    fn test_become_leader() {
        let mut state = three_voters();
        state.become_candidate(1);
        state.become_leader(1);

        assert_eq!(state.role, RaftRole::Leader);
        assert_eq!(state.leader_id, Some(1));
        assert_eq!(state.next_index.get(&2), Some(&1));
        assert_eq!(state.next_index.get(&3), Some(&1));
        assert_eq!(state.match_index.get(&2), Some(&0));
        assert!(!state.next_index.contains_key(&1));
    }

    #[test]
    fn test_become_follower_higher_term_clears_vote() {
        let mut state = RaftState::new();
        state.become_candidate(1);
        state.become_follower(5);

        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 5);
        assert_eq!(state.voted_for, None);
        assert_eq!(state.votes_received, 0);
    }

    #[test]
    fn test_same_term_step_down_keeps_vote() {
        let mut state = RaftState::new();
        state.become_candidate(1);
        state.become_follower(1);

        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.voted_for, Some(1));
    }

    #[test]
    fn test_is_log_up_to_date() {
        let mut state = RaftState::new();

        assert!(state.is_log_up_to_date(0, 0));
        assert!(state.is_log_up_to_date(1, 1));

        state.log.append(1, None, Command::Noop);
        state.log.append(2, None, Command::Noop);

        assert!(state.is_log_up_to_date(1, 3));
        assert!(state.is_log_up_to_date(2, 2));
        assert!(state.is_log_up_to_date(3, 2));
        assert!(!state.is_log_up_to_date(5, 1));
        assert!(!state.is_log_up_to_date(1, 2));
    }

    #[test]
    fn test_commit_requires_quorum_and_current_term() {
        let mut state = three_voters();
        state.current_term = 1;
        state.log.append(1, None, Command::Noop);
        state.become_leader(1);
        state.current_term = 2;
        state.log.append(2, None, Command::Noop);

        // Only the leader has the entries.
        assert!(!state.advance_commit_index(1));

        // A quorum has index 1, but it belongs to an older term.
        state.match_index.insert(2, 1);
        assert!(!state.advance_commit_index(1));
        assert_eq!(state.commit_index, 0);

        state.match_index.insert(2, 2);
        assert!(state.advance_commit_index(1));
        assert_eq!(state.commit_index, 2);
    }

    #[test]
    fn test_quorum_and_bootstrap_readiness() {
        let mut state = RaftState::new();
        assert_eq!(state.quorum_size(), 1);
        state.voters.insert(1, "a".into());
        assert!(!state.is_bootstrap_ready(3));
        state.voters.insert(2, "b".into());
        state.voters.insert(3, "c".into());
        assert!(state.is_bootstrap_ready(3));
        assert_eq!(state.quorum_size(), 2);
    }
}
