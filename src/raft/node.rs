use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};

use crate::config::NodeConfig;
use crate::error::{Result, StevedoreError};
use crate::proto::raft_service_client::RaftServiceClient;
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, JoinRequest, JoinResponse, VoteRequest, VoteResponse,
};
use crate::raft::log::LogEntry;
use crate::raft::rpc::{
    handle_append_entries, handle_install_snapshot, handle_request_vote, log_entry_to_proto,
    members_to_voters, voters_to_members,
};
use crate::raft::state::{RaftRole, RaftState, Snapshot};
use crate::raft::storage::{HardState, RaftStorage};
use crate::raft::timer::random_election_timeout;
use crate::state::Command;

/// Entries shipped per AppendEntries request.
const MAX_ENTRIES_PER_APPEND: usize = 256;

/// Message types for the Raft node event loop
#[derive(Debug)]
pub enum RaftMessage {
    /// Heartbeat received from leader (resets election timeout)
    HeartbeatReceived,
    /// Trigger election
    TriggerElection,
    /// New entries were appended; replicate without waiting for the next tick.
    Replicate,
}

/// Committed work handed to the apply loop.
#[derive(Debug, Default)]
pub struct CommittedBatch {
    /// Installed by the leader; restore it before applying `entries`.
    pub snapshot: Option<Snapshot>,
    pub entries: Vec<LogEntry>,
}

/// The main Raft node that coordinates consensus
pub struct RaftNode {
    pub id: u64,
    pub state: Arc<RwLock<RaftState>>,
    config: NodeConfig,
    rpc_addr: String,
    storage: Option<Arc<RaftStorage>>,
    clients: Mutex<HashMap<u64, (String, RaftServiceClient<Channel>)>>,
    message_tx: mpsc::Sender<RaftMessage>,
    last_heartbeat: RwLock<Instant>,
    /// When each peer last acknowledged this node as leader, by send time.
    last_ack: Mutex<HashMap<u64, Instant>>,
    leader_since: RwLock<Instant>,
    /// Peers treated as unreachable, for partition tests.
    disconnected: RwLock<HashSet<u64>>,
    snapshots_in_flight: Mutex<HashSet<u64>>,
    /// Discovered an already running cluster; wait for its leader instead of electing.
    joined_existing: AtomicBool,
    /// The replicated state machine holds a voter set.
    voters_recorded: AtomicBool,
    commit_tx: watch::Sender<u64>,
}

impl RaftNode {
    /// Build a node, recovering persisted state when `storage` is given.
    pub fn new(
        config: NodeConfig,
        storage: Option<Arc<RaftStorage>>,
    ) -> Result<(Self, mpsc::Receiver<RaftMessage>)> {
        let (message_tx, message_rx) = mpsc::channel(100);
        let rpc_addr = config.rpc_advertise_addr();

        let mut state = RaftState::new();
        if let Some(storage) = &storage {
            let recovered = storage.load()?;
            state.current_term = recovered.hard_state.current_term;
            state.voted_for = recovered.hard_state.voted_for;
            state.voters = recovered.hard_state.voters;
            state.log = recovered.log;
            if let Some(snapshot) = recovered.snapshot {
                state.commit_index = snapshot.last_included_index;
                state.pending_snapshot = true;
                if state.voters.is_empty() {
                    state.voters = snapshot.voters.clone();
                }
                state.snapshot = Some(snapshot);
            }
            tracing::info!(
                node_id = config.node_id,
                term = state.current_term,
                last_index = state.last_log_index(),
                "Recovered raft state"
            );
        }
        state.voters.insert(config.node_id, rpc_addr.clone());
        for peer in &config.peers {
            state.voters.entry(peer.node_id).or_insert_with(|| peer.addr.clone());
        }

        let (commit_tx, _) = watch::channel(state.commit_index);
        let node = Self {
            id: config.node_id,
            state: Arc::new(RwLock::new(state)),
            config,
            rpc_addr,
            storage,
            clients: Mutex::new(HashMap::new()),
            message_tx,
            last_heartbeat: RwLock::new(Instant::now()),
            last_ack: Mutex::new(HashMap::new()),
            leader_since: RwLock::new(Instant::now()),
            disconnected: RwLock::new(HashSet::new()),
            snapshots_in_flight: Mutex::new(HashSet::new()),
            joined_existing: AtomicBool::new(false),
            voters_recorded: AtomicBool::new(false),
            commit_tx,
        };

        Ok((node, message_rx))
    }

    /// Get the message sender for external communication
    pub fn message_sender(&self) -> mpsc::Sender<RaftMessage> {
        self.message_tx.clone()
    }

    pub fn rpc_addr(&self) -> &str {
        &self.rpc_addr
    }

    /// Run the Raft node main loop until cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut message_rx: mpsc::Receiver<RaftMessage>,
        cancel: CancellationToken,
    ) {
        let mut election_timeout = self.next_election_timeout();

        loop {
            let role = self.state.read().await.role;

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(node_id = self.id, "Raft loop stopped");
                    return;
                }

                Some(msg) = message_rx.recv() => {
                    match msg {
                        RaftMessage::HeartbeatReceived => {
                            *self.last_heartbeat.write().await = Instant::now();
                            election_timeout = self.next_election_timeout();
                        }
                        RaftMessage::TriggerElection => {
                            self.start_election().await;
                        }
                        RaftMessage::Replicate => {
                            if role == RaftRole::Leader {
                                self.send_heartbeats().await;
                            }
                        }
                    }
                }

                // Election timeout (for followers and candidates)
                _ = tokio::time::sleep(election_timeout), if role != RaftRole::Leader => {
                    let elapsed = self.last_heartbeat.read().await.elapsed();
                    if elapsed >= election_timeout {
                        if self.may_start_election().await {
                            tracing::info!(
                                node_id = self.id,
                                elapsed_ms = elapsed.as_millis(),
                                "Election timeout, starting election"
                            );
                            self.start_election().await;
                        } else {
                            self.probe_peers().await;
                        }
                    }
                    election_timeout = self.next_election_timeout();
                }

                // Heartbeat interval (for leaders)
                _ = tokio::time::sleep(self.config.heartbeat_interval()), if role == RaftRole::Leader => {
                    self.send_heartbeats().await;
                    self.check_quorum().await;
                }
            }
        }
    }

    fn next_election_timeout(&self) -> Duration {
        random_election_timeout(
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
        )
    }

    fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.config.election_timeout_max_ms.max(100))
    }

    /// Elections wait for bootstrap and, after joining a running cluster,
    /// for first contact from its leader.
    async fn may_start_election(&self) -> bool {
        if self.joined_existing.load(Ordering::SeqCst) {
            return false;
        }
        let state = self.state.read().await;
        state.voters.contains_key(&self.id)
            && state.is_bootstrap_ready(self.config.effective_bootstrap_expect())
    }

    /// Make term, vote, voters and log durable before acting on them.
    fn persist(&self, state: &mut RaftState) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let hard = HardState {
            current_term: state.current_term,
            voted_for: state.voted_for,
            voters: state.voters.clone(),
        };
        storage.save_hard_state(&hard)?;
        let change = state.log.take_change();
        if let Err(e) = storage.save_log(&state.log, change) {
            state.log.require_rewrite();
            return Err(e);
        }
        Ok(())
    }

    /// Persist where nothing is acknowledged on the strength of it.
    fn persist_or_log(&self, state: &mut RaftState) {
        if let Err(e) = self.persist(state) {
            tracing::error!(node_id = self.id, error = %e, "Failed to persist raft state");
        }
    }

    async fn client_for(&self, peer_id: u64, addr: &str) -> Result<RaftServiceClient<Channel>> {
        let mut clients = self.clients.lock().await;
        if let Some((known_addr, client)) = clients.get(&peer_id) {
            if known_addr == addr {
                return Ok(client.clone());
            }
        }
        let channel = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| StevedoreError::Raft(format!("invalid peer address {}: {}", addr, e)))?
            .connect_timeout(self.rpc_timeout())
            .connect_lazy();
        let client = RaftServiceClient::new(channel);
        clients.insert(peer_id, (addr.to_string(), client.clone()));
        Ok(client)
    }

    /// Voters other than this node that are currently reachable.
    async fn reachable_peers(&self) -> Vec<(u64, String)> {
        let disconnected = self.disconnected.read().await.clone();
        self.state
            .read()
            .await
            .voters
            .iter()
            .filter(|(id, _)| **id != self.id && !disconnected.contains(id))
            .map(|(id, addr)| (*id, addr.clone()))
            .collect()
    }

    /// Contact `retry_join` addresses to discover voters or a running cluster.
    async fn probe_peers(&self) {
        if self.config.retry_join.is_empty() {
            return;
        }
        let req = JoinRequest {
            node_id: self.id,
            rpc_addr: self.rpc_addr.clone(),
        };

        let mut targets: Vec<String> = self.config.retry_join.clone();
        let mut visited = HashSet::new();
        while let Some(addr) = targets.pop() {
            if addr == self.rpc_addr || !visited.insert(addr.clone()) {
                continue;
            }
            let Ok(endpoint) = Endpoint::from_shared(format!("http://{}", addr)) else {
                tracing::warn!(addr = %addr, "Skipping invalid retry_join address");
                continue;
            };
            let mut client = RaftServiceClient::new(
                endpoint.connect_timeout(self.rpc_timeout()).connect_lazy(),
            );
            let resp = match timeout(self.rpc_timeout(), client.join(req.clone())).await {
                Ok(Ok(resp)) => resp.into_inner(),
                Ok(Err(e)) => {
                    tracing::trace!(addr = %addr, error = %e, "Join probe failed");
                    continue;
                }
                Err(_) => {
                    tracing::trace!(addr = %addr, "Join probe timed out");
                    continue;
                }
            };
            if resp.node_id == self.id {
                continue;
            }

            let mut state = self.state.write().await;
            let bootstrapped_here = state.last_log_index() > 0 || state.leader_id.is_some();
            if resp.bootstrapped {
                if !bootstrapped_here && !self.joined_existing.swap(true, Ordering::SeqCst) {
                    tracing::info!(
                        node_id = self.id,
                        via = resp.node_id,
                        leader = resp.leader_id,
                        "Discovered running cluster, waiting to be added"
                    );
                }
                // Ask the leader directly so it proposes us as a voter.
                if resp.leader_id != 0 && resp.leader_id != resp.node_id && !resp.leader_addr.is_empty() {
                    targets.push(resp.leader_addr.clone());
                }
            } else if !bootstrapped_here {
                let before = state.voters.len();
                state.voters.insert(resp.node_id, resp.rpc_addr.clone());
                for (id, member_addr) in members_to_voters(&resp.members) {
                    state.voters.entry(id).or_insert(member_addr);
                }
                if state.voters.len() != before {
                    tracing::info!(
                        node_id = self.id,
                        voters = state.voters.len(),
                        expect = self.config.effective_bootstrap_expect(),
                        "Discovered voters"
                    );
                    self.persist_or_log(&mut state);
                }
            }
        }
    }

    /// Start a new election
    async fn start_election(self: &Arc<Self>) {
        let (term, req, quorum) = {
            let mut state = self.state.write().await;
            state.become_candidate(self.id);
            let req = VoteRequest {
                term: state.current_term,
                candidate_id: self.id,
                last_log_index: state.last_log_index(),
                last_log_term: state.last_log_term(),
            };
            if let Err(e) = self.persist(&mut state) {
                tracing::error!(node_id = self.id, error = %e, "Cannot persist vote for self, abandoning election");
                let term = state.current_term;
                state.become_follower(term);
                return;
            }
            (state.current_term, req, state.quorum_size())
        };
        *self.last_heartbeat.write().await = Instant::now();

        tracing::info!(node_id = self.id, term, "Starting election");

        let mut votes = 1usize; // Vote for self
        let mut requests = JoinSet::new();
        for (peer_id, addr) in self.reachable_peers().await {
            let mut client = match self.client_for(peer_id, &addr).await {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!(peer_id, error = %e, "No client for peer");
                    continue;
                }
            };
            let req = req.clone();
            let rpc_timeout = self.rpc_timeout();
            requests.spawn(async move {
                (peer_id, timeout(rpc_timeout, client.request_vote(req)).await)
            });
        }

        while votes < quorum {
            let Some(joined) = requests.join_next().await else {
                break;
            };
            let Ok((peer_id, result)) = joined else {
                continue;
            };
            match result {
                Ok(Ok(response)) => {
                    let resp: VoteResponse = response.into_inner();
                    if resp.term > term {
                        let mut state = self.state.write().await;
                        state.become_follower(resp.term);
                        self.persist_or_log(&mut state);
                        return;
                    }
                    if resp.vote_granted {
                        votes += 1;
                        tracing::debug!(node_id = self.id, peer_id, votes, "Received vote");
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(peer_id, error = %e, "Vote request failed");
                }
                Err(_) => {
                    tracing::debug!(peer_id, "Vote request timed out");
                }
            }
        }
        requests.abort_all();

        let mut state = self.state.write().await;
        if state.role != RaftRole::Candidate || state.current_term != term {
            return;
        }
        if votes < quorum {
            tracing::debug!(
                node_id = self.id,
                term,
                votes,
                needed = quorum,
                "Election failed, not enough votes"
            );
            return;
        }

        state.become_leader(self.id);
        state.log.append(term, None, Command::Noop);
        if !self.voters_recorded.load(Ordering::SeqCst) {
            // Seed the replicated voter set before any join can be proposed.
            let voters: Vec<(u64, String)> =
                state.voters.iter().map(|(id, addr)| (*id, addr.clone())).collect();
            for (node_id, rpc_addr) in voters {
                state.log.append(term, None, Command::AddVoter { node_id, rpc_addr });
            }
        }
        if let Err(e) = self.persist(&mut state) {
            tracing::error!(node_id = self.id, term, error = %e, "Cannot persist leader entries, stepping down");
            state.become_follower(term);
            state.leader_id = None;
            return;
        }
        state.advance_commit_index(self.id);
        let commit = state.commit_index;
        drop(state);

        self.commit_tx.send_replace(commit);
        self.last_ack.lock().await.clear();
        *self.leader_since.write().await = Instant::now();
        self.joined_existing.store(false, Ordering::SeqCst);
        tracing::info!(node_id = self.id, term, votes, "Became leader");

        self.send_heartbeats().await;
    }

    /// Replicate to every reachable voter (leader only).
    ///
    /// Returns the in-flight request tasks; callers may await them to learn
    /// which peers acknowledged this round.
    pub async fn send_heartbeats(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let peers = self.reachable_peers().await;
        let state = self.state.read().await;
        if state.role != RaftRole::Leader {
            return Vec::new();
        }

        let term = state.current_term;
        let mut handles = Vec::new();
        for (peer_id, addr) in peers {
            let next_index = state
                .next_index
                .get(&peer_id)
                .copied()
                .unwrap_or(state.last_log_index() + 1);

            let client = match self.client_for(peer_id, &addr).await {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!(peer_id, error = %e, "No client for peer");
                    continue;
                }
            };

            if next_index <= state.log.offset() {
                if let Some(snapshot) = state.snapshot.clone() {
                    if self.snapshots_in_flight.lock().await.insert(peer_id) {
                        let req = InstallSnapshotRequest {
                            term,
                            leader_id: self.id,
                            last_included_index: snapshot.last_included_index,
                            last_included_term: snapshot.last_included_term,
                            voters: voters_to_members(&snapshot.voters),
                            data: snapshot.data,
                        };
                        handles.push(self.spawn_install_snapshot(peer_id, client, req));
                    }
                    continue;
                }
            }

            let prev_log_index = next_index.saturating_sub(1);
            let prev_log_term = state.log.term_at(prev_log_index).unwrap_or(0);
            let entries = match state
                .log
                .entries_from(next_index, MAX_ENTRIES_PER_APPEND)
                .iter()
                .map(log_entry_to_proto)
                .collect::<Result<Vec<_>>>()
            {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::error!(peer_id, error = %e, "Failed to encode entries");
                    continue;
                }
            };

            let req = AppendEntriesRequest {
                term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: state.commit_index,
            };
            handles.push(self.spawn_append_entries(peer_id, client, req));
        }
        handles
    }

    fn spawn_append_entries(
        self: &Arc<Self>,
        peer_id: u64,
        mut client: RaftServiceClient<Channel>,
        req: AppendEntriesRequest,
    ) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let rpc_timeout = self.rpc_timeout();
        tokio::spawn(async move {
            let sent_at = Instant::now();
            let term = req.term;
            match timeout(rpc_timeout, client.append_entries(req)).await {
                Ok(Ok(response)) => {
                    node.on_append_response(peer_id, term, sent_at, response.into_inner()).await;
                }
                Ok(Err(e)) => {
                    tracing::trace!(peer_id, error = %e, "AppendEntries failed");
                }
                Err(_) => {
                    tracing::trace!(peer_id, "AppendEntries timed out");
                }
            }
        })
    }

    fn spawn_install_snapshot(
        self: &Arc<Self>,
        peer_id: u64,
        mut client: RaftServiceClient<Channel>,
        req: InstallSnapshotRequest,
    ) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let snapshot_timeout = self.rpc_timeout() * 20;
        tokio::spawn(async move {
            let sent_at = Instant::now();
            let term = req.term;
            let index = req.last_included_index;
            tracing::info!(peer_id, index, "Sending snapshot to lagging follower");
            let result = timeout(snapshot_timeout, client.install_snapshot(req)).await;
            node.snapshots_in_flight.lock().await.remove(&peer_id);
            match result {
                Ok(Ok(response)) => {
                    node
                        .on_snapshot_response(peer_id, term, index, sent_at, response.into_inner())
                        .await;
                }
                Ok(Err(e)) => tracing::warn!(peer_id, error = %e, "InstallSnapshot failed"),
                Err(_) => tracing::warn!(peer_id, "InstallSnapshot timed out"),
            }
        })
    }

    async fn on_append_response(
        &self,
        peer_id: u64,
        term: u64,
        sent_at: Instant,
        resp: AppendEntriesResponse,
    ) {
        let mut state = self.state.write().await;
        if resp.term > state.current_term {
            state.become_follower(resp.term);
            self.persist_or_log(&mut state);
            return;
        }
        if state.role != RaftRole::Leader || state.current_term != term {
            return;
        }

        if resp.success {
            let matched = state.match_index.get(&peer_id).copied().unwrap_or(0).max(resp.match_index);
            state.match_index.insert(peer_id, matched);
            state.next_index.insert(peer_id, matched + 1);
            if state.advance_commit_index(self.id) {
                let commit = state.commit_index;
                tracing::debug!(commit_index = commit, "Updated commit index");
                drop(state);
                self.commit_tx.send_replace(commit);
            }
        } else {
            // Back off towards the follower's hint and retry next round.
            let current = state.next_index.get(&peer_id).copied().unwrap_or(1);
            let next = current.saturating_sub(1).min(resp.match_index + 1).max(1);
            state.next_index.insert(peer_id, next);
        }
        self.last_ack.lock().await.insert(peer_id, sent_at);
    }

    async fn on_snapshot_response(
        &self,
        peer_id: u64,
        term: u64,
        index: u64,
        sent_at: Instant,
        resp: InstallSnapshotResponse,
    ) {
        let mut state = self.state.write().await;
        if resp.term > state.current_term {
            state.become_follower(resp.term);
            self.persist_or_log(&mut state);
            return;
        }
        if state.role != RaftRole::Leader || state.current_term != term {
            return;
        }
        let matched = state.match_index.get(&peer_id).copied().unwrap_or(0).max(index);
        state.match_index.insert(peer_id, matched);
        state.next_index.insert(peer_id, matched + 1);
        drop(state);
        self.last_ack.lock().await.insert(peer_id, sent_at);
    }

    /// Step down when a quorum has not acknowledged us recently.
    async fn check_quorum(&self) {
        let window = self.config.election_timeout_max() * 2;
        if self.leader_since.read().await.elapsed() < window {
            return;
        }
        let (quorum, voters): (usize, Vec<u64>) = {
            let state = self.state.read().await;
            if state.role != RaftRole::Leader {
                return;
            }
            (state.quorum_size(), state.voters.keys().copied().collect())
        };
        let acks = self.last_ack.lock().await;
        let recent = voters
            .iter()
            .filter(|id| **id != self.id)
            .filter(|id| acks.get(id).map(|t| t.elapsed() < window).unwrap_or(false))
            .count()
            + 1;
        drop(acks);

        if recent < quorum {
            let mut state = self.state.write().await;
            if state.role == RaftRole::Leader {
                tracing::warn!(
                    node_id = self.id,
                    term = state.current_term,
                    recent,
                    quorum,
                    "Lost contact with quorum, stepping down"
                );
                let term = state.current_term;
                state.become_follower(term);
                state.leader_id = None;
                self.persist_or_log(&mut state);
            }
        }
    }

    /// Confirm this node still leads by collecting a fresh round of
    /// acknowledgements from a quorum.
    pub async fn confirm_leadership(self: &Arc<Self>) -> Result<()> {
        let quorum = {
            let state = self.state.read().await;
            if state.role != RaftRole::Leader {
                return Err(StevedoreError::NotLeader(state.leader_id));
            }
            state.quorum_size()
        };
        if quorum <= 1 {
            return Ok(());
        }

        let started = Instant::now();
        let handles = self.send_heartbeats().await;
        let _ = timeout(self.config.election_timeout_max(), async {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await;

        let fresh = {
            let acks = self.last_ack.lock().await;
            acks.values().filter(|t| **t >= started).count() + 1
        };
        if fresh >= quorum && self.is_leader().await {
            Ok(())
        } else {
            Err(StevedoreError::QuorumUnavailable)
        }
    }

    /// Append a command as leader and wait until it commits.
    ///
    /// A timeout leaves the outcome unknown; retrying with the same
    /// `request_id` is safe because duplicates are dropped at apply time.
    pub async fn propose(
        &self,
        request_id: Option<String>,
        command: Command,
        wait: Duration,
    ) -> Result<u64> {
        let (index, term, commit) = {
            let mut state = self.state.write().await;
            if state.role != RaftRole::Leader {
                return Err(StevedoreError::NotLeader(state.leader_id));
            }
            let term = state.current_term;
            let name = command.name();
            let index = state.log.append(term, request_id, command);
            tracing::debug!(index, term, command = name, "Appended command to log");
            if let Err(e) = self.persist(&mut state) {
                // The entry never became durable here; let a healthy node lead.
                tracing::error!(node_id = self.id, index, error = %e, "Cannot persist proposal, stepping down");
                state.become_follower(term);
                state.leader_id = None;
                return Err(e);
            }
            state.advance_commit_index(self.id);
            (index, term, state.commit_index)
        };
        self.commit_tx.send_replace(commit);
        let _ = self.message_tx.try_send(RaftMessage::Replicate);

        self.wait_for_commit(index, term, wait).await
    }

    async fn wait_for_commit(&self, index: u64, term: u64, wait: Duration) -> Result<u64> {
        let deadline = Instant::now() + wait;
        let mut commit_rx = self.commit_tx.subscribe();
        loop {
            {
                let state = self.state.read().await;
                match state.log.term_at(index) {
                    Some(t) if t != term => return Err(StevedoreError::LeadershipLost(index)),
                    _ if state.commit_index >= index => return Ok(index),
                    None if index > state.last_log_index() => {
                        return Err(StevedoreError::LeadershipLost(index));
                    }
                    _ => {}
                }
            }
            match tokio::time::timeout_at(deadline, commit_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(StevedoreError::Raft("commit channel closed".into())),
                Err(_) => return Err(StevedoreError::ProposalTimeout(wait)),
            }
        }
    }

    /// Receiver that changes whenever the commit index moves or a snapshot arrives.
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    /// Hand committed-but-unapplied work to the apply loop.
    pub async fn take_committed(&self) -> CommittedBatch {
        let mut state = self.state.write().await;
        let mut batch = CommittedBatch::default();

        if state.pending_snapshot {
            state.pending_snapshot = false;
            if let Some(snapshot) = state.snapshot.clone() {
                state.last_applied = state.last_applied.max(snapshot.last_included_index);
                batch.snapshot = Some(snapshot);
            }
        }

        if state.commit_index > state.last_applied {
            let from = state.last_applied + 1;
            let count = (state.commit_index - state.last_applied) as usize;
            batch.entries = state.log.entries_from(from, count);
            if let Some(last) = batch.entries.last() {
                state.last_applied = last.index;
            }
        }
        batch
    }

    /// Fold everything up to `index` into a snapshot and drop those entries.
    pub async fn compact(&self, index: u64, data: Vec<u8>) -> Result<()> {
        let mut state = self.state.write().await;
        if index <= state.log.offset() || index > state.last_applied {
            return Ok(());
        }
        let Some(term) = state.log.term_at(index) else {
            return Ok(());
        };
        let snapshot = Snapshot {
            last_included_index: index,
            last_included_term: term,
            voters: state.voters.clone(),
            data,
        };
        if let Some(storage) = &self.storage {
            storage.save_snapshot(&snapshot)?;
        }
        state.snapshot = Some(snapshot);
        state.log.compact_to(index);
        self.persist(&mut state)?;
        tracing::info!(
            node_id = self.id,
            index,
            remaining = state.log.len(),
            "Compacted log"
        );
        Ok(())
    }

    pub async fn should_compact(&self, threshold: usize) -> bool {
        let state = self.state.read().await;
        threshold > 0 && state.log.len() >= threshold && state.last_applied > state.log.offset()
    }

    /// Install the voter set recorded in the replicated state.
    pub async fn set_voters(&self, voters: BTreeMap<u64, String>) {
        if voters.is_empty() {
            return;
        }
        self.voters_recorded.store(true, Ordering::SeqCst);
        let mut state = self.state.write().await;
        if state.voters == voters {
            return;
        }
        tracing::info!(node_id = self.id, voters = ?voters.keys().collect::<Vec<_>>(), "Voter set changed");
        state.voters = voters;
        if state.role == RaftRole::Leader {
            state.track_new_peers(self.id);
        }
        self.persist_or_log(&mut state);
    }

    pub async fn voters(&self) -> BTreeMap<u64, String> {
        self.state.read().await.voters.clone()
    }

    /// Handle incoming RequestVote RPC
    pub async fn handle_vote_request(&self, req: VoteRequest) -> VoteResponse {
        let mut state = self.state.write().await;
        let mut response = handle_request_vote(&mut state, &req, self.id);
        if let Err(e) = self.persist(&mut state) {
            // A vote that is not on disk could be cast again after a restart.
            tracing::error!(node_id = self.id, term = req.term, error = %e, "Cannot persist vote, refusing it");
            response.vote_granted = false;
        }
        drop(state);

        // Reset election timeout if we granted vote
        if response.vote_granted {
            *self.last_heartbeat.write().await = Instant::now();
        }

        response
    }

    /// Handle incoming AppendEntries RPC
    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let mut state = self.state.write().await;
        let commit_before = state.commit_index;
        let response = handle_append_entries(&mut state, &req, self.id)?;
        // An error reply makes the leader resend instead of counting this ack.
        self.persist(&mut state)?;
        let commit_after = state.commit_index;
        drop(state);

        if response.term == req.term {
            // Any message from the current leader counts as contact.
            *self.last_heartbeat.write().await = Instant::now();
            self.joined_existing.store(false, Ordering::SeqCst);
        }
        if commit_after != commit_before {
            self.commit_tx.send_replace(commit_after);
        }

        Ok(response)
    }

    pub async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let leader_term = req.term;
        let mut state = self.state.write().await;
        let response = handle_install_snapshot(&mut state, req, self.id);
        let installed = state.pending_snapshot;
        if installed {
            if let (Some(storage), Some(snapshot)) = (&self.storage, &state.snapshot) {
                storage.save_snapshot(snapshot)?;
            }
        }
        self.persist(&mut state)?;
        let commit = state.commit_index;
        drop(state);

        if response.term == leader_term {
            *self.last_heartbeat.write().await = Instant::now();
            self.joined_existing.store(false, Ordering::SeqCst);
        }
        if installed {
            self.commit_tx.send_replace(commit);
        }
        Ok(response)
    }

    /// Handle a Join from a node discovering the cluster.
    ///
    /// Before bootstrap the caller simply becomes a voter candidate. Afterwards
    /// the leader proposes it as a voter and everyone else points at the leader.
    pub async fn handle_join(self: &Arc<Self>, req: JoinRequest) -> JoinResponse {
        let mut state = self.state.write().await;
        let bootstrapped = state.last_log_index() > 0 || state.leader_id.is_some();

        if req.node_id != self.id && !req.rpc_addr.is_empty() {
            if !bootstrapped {
                if state.voters.get(&req.node_id) != Some(&req.rpc_addr) {
                    state.voters.insert(req.node_id, req.rpc_addr.clone());
                    tracing::info!(
                        node_id = self.id,
                        peer_id = req.node_id,
                        voters = state.voters.len(),
                        "Peer joined before bootstrap"
                    );
                    self.persist_or_log(&mut state);
                }
            } else if state.role == RaftRole::Leader
                && state.voters.get(&req.node_id) != Some(&req.rpc_addr)
            {
                let node = Arc::clone(self);
                let command = Command::AddVoter {
                    node_id: req.node_id,
                    rpc_addr: req.rpc_addr.clone(),
                };
                let wait = self.config.election_timeout_max() * 10;
                tokio::spawn(async move {
                    match node.propose(None, command, wait).await {
                        Ok(index) => tracing::info!(peer_id = req.node_id, index, "Added voter"),
                        Err(e) => tracing::warn!(peer_id = req.node_id, error = %e, "Failed to add voter"),
                    }
                });
            }
        }

        let leader_id = if state.role == RaftRole::Leader {
            Some(self.id)
        } else {
            state.leader_id
        };
        JoinResponse {
            node_id: self.id,
            rpc_addr: self.rpc_addr.clone(),
            leader_id: leader_id.unwrap_or(0),
            leader_addr: leader_id
                .and_then(|id| state.voters.get(&id).cloned())
                .unwrap_or_default(),
            bootstrapped,
            members: voters_to_members(&state.voters),
        }
    }

    /// Check if this node is the leader
    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == RaftRole::Leader
    }

    /// Get the current leader ID
    pub async fn get_leader_id(&self) -> Option<u64> {
        let state = self.state.read().await;
        if state.role == RaftRole::Leader {
            Some(self.id)
        } else {
            state.leader_id
        }
    }

    /// RPC address of a voter.
    pub async fn peer_addr(&self, node_id: u64) -> Option<String> {
        self.state.read().await.voters.get(&node_id).cloned()
    }

    /// Time since the leader was last heard from; zero on the leader.
    pub async fn last_contact(&self) -> Duration {
        if self.is_leader().await {
            return Duration::ZERO;
        }
        self.last_heartbeat.read().await.elapsed()
    }

    pub async fn current_term(&self) -> u64 {
        self.state.read().await.current_term
    }

    pub async fn commit_index(&self) -> u64 {
        self.state.read().await.commit_index
    }

    /// Simulate a network partition: stop sending to `peer_id`.
    pub async fn disconnect_peer(&self, peer_id: u64) {
        self.disconnected.write().await.insert(peer_id);
        tracing::debug!(node_id = self.id, peer_id, "Disconnected peer");
    }

    pub async fn reconnect_peer(&self, peer_id: u64) {
        self.disconnected.write().await.remove(&peer_id);
        tracing::debug!(node_id = self.id, peer_id, "Reconnected peer");
    }

    pub async fn is_disconnected(&self, peer_id: u64) -> bool {
        self.disconnected.read().await.contains(&peer_id)
    }
}
