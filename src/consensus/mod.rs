//! Replicated-log consensus (Raft-style).
//!
//! Roles: FOLLOWER (initial) / CANDIDATE / LEADER. `currentTerm`,
//! `votedFor`, and the log are persistent through the repository; commit
//! and apply indices are volatile; `nextIndex`/`matchIndex` exist only on
//! the leader.
//!
//! Guarantees kept here:
//! - at most one leader per term (majority vote, one vote per node per term),
//! - log matching (a follower refuses entries whose previous index/term do
//!   not match its own log and truncates any conflicting suffix),
//! - commit only counts entries of the current term replicated to a
//!   majority; applied entries feed the state machine in index order,
//! - a leader that sees a higher term anywhere steps down immediately.
//!
//! Once the log grows past a threshold the applied prefix is folded into a
//! snapshot; lagging peers receive the snapshot instead of unreachable
//! entries.

pub mod rpc;

pub use rpc::{HttpTransport, LoopbackTransport, RaftTransport};

use crate::error::{CoreError, CoreResult};
use crate::ids;
use crate::storage::{keys, Repository, RepositoryExt};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Driver cadence; elections and heartbeats are checked at this rate.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Cap on next-index walkbacks within a single replication round.
const MAX_BACKTRACK_PER_ROUND: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    /// 1-based, strictly increasing, no gaps.
    pub index: u64,
    pub command: serde_json::Value,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: serde_json::Value,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: String,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RaftStatus {
    pub node_id: String,
    pub role: RaftRole,
    pub term: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub leader_hint: Option<String>,
}

/// Commands applied in log order on every node.
pub trait StateMachine: Send + Sync {
    fn apply(&self, entry: &LogEntry);
    /// Serialise the applied state for snapshotting.
    fn snapshot(&self) -> serde_json::Value;
    /// Replace the applied state with a snapshot.
    fn restore(&self, data: &serde_json::Value);
}

/// State machine that ignores everything; used in tests.
pub struct NullStateMachine;

impl StateMachine for NullStateMachine {
    fn apply(&self, _entry: &LogEntry) {}
    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({})
    }
    fn restore(&self, _data: &serde_json::Value) {}
}

#[derive(Debug, Clone)]
pub struct RaftOptions {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub snapshot_threshold: usize,
}

impl RaftOptions {
    pub fn from_config() -> Self {
        let cfg = &crate::config::get().raft;
        Self {
            election_timeout_min: cfg.election_timeout_min(),
            election_timeout_max: cfg.election_timeout_max(),
            heartbeat_interval: cfg.heartbeat_interval(),
            snapshot_threshold: cfg.snapshot_threshold,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedMeta {
    current_term: u64,
    voted_for: Option<String>,
}

struct RaftState {
    role: RaftRole,
    current_term: u64,
    voted_for: Option<String>,
    /// Entries after the snapshot, carrying absolute indices.
    log: Vec<LogEntry>,
    commit_index: u64,
    last_applied: u64,
    snapshot_last_index: u64,
    snapshot_last_term: u64,
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    election_deadline: Instant,
    last_heartbeat_sent: Option<Instant>,
    leader_hint: Option<String>,
}

impl RaftState {
    fn last_log_index(&self) -> u64 {
        self.log.last().map_or(self.snapshot_last_index, |e| e.index)
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().map_or(self.snapshot_last_term, |e| e.term)
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_last_index {
            return Some(self.snapshot_last_term);
        }
        if index <= self.snapshot_last_index {
            // Folded into the snapshot; the exact term is gone.
            return None;
        }
        let offset = (index - self.snapshot_last_index - 1) as usize;
        self.log.get(offset).map(|e| e.term)
    }

    fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_last_index {
            return None;
        }
        let offset = (index - self.snapshot_last_index - 1) as usize;
        self.log.get(offset)
    }

    fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        if index <= self.snapshot_last_index {
            return Vec::new();
        }
        let offset = (index - self.snapshot_last_index - 1) as usize;
        self.log.get(offset..).map(<[LogEntry]>::to_vec).unwrap_or_default()
    }

    /// Candidate log at least as up-to-date as ours?
    fn candidate_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_term = self.last_log_term();
        last_log_term > our_term
            || (last_log_term == our_term && last_log_index >= self.last_log_index())
    }
}

enum TickAction {
    None,
    StartElection,
    SendHeartbeats,
}

enum ElectionOutcome {
    /// The world moved on (higher term seen, or no longer a candidate for
    /// this term) while votes were being collected.
    Stale,
    Won,
    Lost,
}

pub struct RaftNode {
    node_id: String,
    peers: Mutex<Vec<String>>,
    state: Mutex<RaftState>,
    repo: Arc<dyn Repository>,
    transport: Arc<dyn RaftTransport>,
    machine: Arc<dyn StateMachine>,
    options: RaftOptions,
    /// Kicks the driver for immediate replication after an append.
    replicate_now: Notify,
}

impl RaftNode {
    pub fn new(
        node_id: &str,
        peers: Vec<String>,
        repo: Arc<dyn Repository>,
        transport: Arc<dyn RaftTransport>,
        machine: Arc<dyn StateMachine>,
        options: RaftOptions,
    ) -> CoreResult<Arc<Self>> {
        // Recover persistent state.
        let meta: Option<PersistedMeta> = repo.get_json(&keys::raft_term(node_id))?;
        let snapshot: Option<Snapshot> = repo.get_json(&keys::raft_snapshot(node_id))?;
        let (snapshot_last_index, snapshot_last_term) = snapshot
            .as_ref()
            .map_or((0, 0), |s| (s.last_included_index, s.last_included_term));

        let mut log: Vec<LogEntry> = repo
            .scan_json::<LogEntry>(&keys::raft_log_prefix(node_id))?
            .into_iter()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.index > snapshot_last_index)
            .collect();
        log.sort_by_key(|e| e.index);

        if let Some(snap) = &snapshot {
            machine.restore(&snap.data);
        }

        let now = Instant::now();
        let state = RaftState {
            role: RaftRole::Follower,
            current_term: meta.as_ref().map_or(0, |m| m.current_term),
            voted_for: meta.and_then(|m| m.voted_for),
            log,
            commit_index: snapshot_last_index,
            last_applied: snapshot_last_index,
            snapshot_last_index,
            snapshot_last_term,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_deadline: now + election_timeout(&options),
            last_heartbeat_sent: None,
            leader_hint: None,
        };

        info!(
            node_id = %node_id,
            term = state.current_term,
            log_len = state.log.len(),
            snapshot_index = snapshot_last_index,
            "Raft node initialised"
        );

        Ok(Arc::new(Self {
            node_id: node_id.to_string(),
            peers: Mutex::new(peers),
            state: Mutex::new(state),
            repo,
            transport,
            machine,
            options,
            replicate_now: Notify::new(),
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn set_peers(&self, peers: Vec<String>) {
        if let Ok(mut guard) = self.peers.lock() {
            *guard = peers;
        }
    }

    fn peers_snapshot(&self) -> Vec<String> {
        self.peers.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn lock_state(&self) -> MutexGuard<'_, RaftState> {
        // A poisoned consensus lock is unrecoverable.
        #[allow(clippy::expect_used)]
        self.state.lock().expect("raft state lock poisoned")
    }

    pub fn is_leader(&self) -> bool {
        self.lock_state().role == RaftRole::Leader
    }

    pub fn status(&self) -> RaftStatus {
        let state = self.lock_state();
        RaftStatus {
            node_id: self.node_id.clone(),
            role: state.role,
            term: state.current_term,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            last_log_index: state.last_log_index(),
            leader_hint: state.leader_hint.clone(),
        }
    }

    // -----------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------

    fn persist_meta(&self, state: &RaftState) {
        let meta = PersistedMeta {
            current_term: state.current_term,
            voted_for: state.voted_for.clone(),
        };
        if let Err(e) = self.repo.put_json(&keys::raft_term(&self.node_id), &meta) {
            warn!(error = %e, "Could not persist raft meta");
        }
    }

    fn persist_entry(&self, entry: &LogEntry) {
        if let Err(e) = self
            .repo
            .put_json(&keys::raft_log(&self.node_id, entry.index), entry)
        {
            warn!(error = %e, index = entry.index, "Could not persist log entry");
        }
    }

    fn delete_entries_from(&self, from_index: u64, up_to: u64) {
        for index in from_index..=up_to {
            let _ = self.repo.delete(&keys::raft_log(&self.node_id, index));
        }
    }

    // -----------------------------------------------------------------
    // Role changes
    // -----------------------------------------------------------------

    fn step_down(&self, state: &mut RaftState, term: u64) {
        if term > state.current_term {
            state.current_term = term;
            state.voted_for = None;
            self.persist_meta(state);
        }
        if state.role != RaftRole::Follower {
            info!(node_id = %self.node_id, term = state.current_term, "Stepping down to follower");
        }
        state.role = RaftRole::Follower;
        state.election_deadline = Instant::now() + election_timeout(&self.options);
    }

    fn become_leader(&self, state: &mut RaftState, peers: &[String]) {
        info!(node_id = %self.node_id, term = state.current_term, "Elected leader");
        state.role = RaftRole::Leader;
        state.leader_hint = Some(self.node_id.clone());
        let next = state.last_log_index() + 1;
        state.next_index = peers.iter().map(|p| (p.clone(), next)).collect();
        state.match_index = peers.iter().map(|p| (p.clone(), 0)).collect();
        state.last_heartbeat_sent = None;
    }

    // -----------------------------------------------------------------
    // Inbound RPC handlers (called by the API layer and loopback peers)
    // -----------------------------------------------------------------

    pub fn handle_vote_request(&self, req: &VoteRequest) -> VoteResponse {
        let mut state = self.lock_state();

        if req.term > state.current_term {
            self.step_down(&mut state, req.term);
        }

        let grant = req.term >= state.current_term
            && state
                .voted_for
                .as_ref()
                .map_or(true, |v| v == &req.candidate_id)
            && state.candidate_up_to_date(req.last_log_index, req.last_log_term);

        if grant {
            state.voted_for = Some(req.candidate_id.clone());
            state.election_deadline = Instant::now() + election_timeout(&self.options);
            self.persist_meta(&state);
            debug!(
                node_id = %self.node_id,
                candidate = %req.candidate_id,
                term = req.term,
                "Vote granted"
            );
        }

        VoteResponse {
            term: state.current_term,
            vote_granted: grant,
        }
    }

    pub fn handle_append_entries(&self, req: &AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.lock_state();

        if req.term < state.current_term {
            return AppendEntriesResponse {
                term: state.current_term,
                success: false,
            };
        }

        // Valid leader for this term: follow it and reset the clock.
        self.step_down(&mut state, req.term);
        state.leader_hint = Some(req.leader_id.clone());

        // Log-matching check on the previous entry.
        if req.prev_log_index > 0 {
            match state.term_at(req.prev_log_index) {
                Some(term) if term == req.prev_log_term => {}
                Some(_) => {
                    // Conflicting suffix: drop it and report the mismatch.
                    let last = state.last_log_index();
                    let keep = req
                        .prev_log_index
                        .saturating_sub(state.snapshot_last_index + 1)
                        as usize;
                    state.log.truncate(keep);
                    self.delete_entries_from(req.prev_log_index, last);
                    return AppendEntriesResponse {
                        term: state.current_term,
                        success: false,
                    };
                }
                None => {
                    if req.prev_log_index > state.last_log_index() {
                        return AppendEntriesResponse {
                            term: state.current_term,
                            success: false,
                        };
                    }
                    // prev is inside our snapshot: treat as matching.
                }
            }
        }

        // Append, resolving per-entry conflicts in favour of the leader.
        for entry in &req.entries {
            if entry.index <= state.snapshot_last_index {
                continue;
            }
            match state.term_at(entry.index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    let last = state.last_log_index();
                    let keep = (entry.index - state.snapshot_last_index - 1) as usize;
                    state.log.truncate(keep);
                    self.delete_entries_from(entry.index, last);
                    state.log.push(entry.clone());
                    self.persist_entry(entry);
                }
                None => {
                    state.log.push(entry.clone());
                    self.persist_entry(entry);
                }
            }
        }

        if req.leader_commit > state.commit_index {
            state.commit_index = req.leader_commit.min(state.last_log_index());
            self.apply_committed(&mut state);
        }
        self.maybe_snapshot(&mut state);

        AppendEntriesResponse {
            term: state.current_term,
            success: true,
        }
    }

    pub fn handle_install_snapshot(&self, req: &InstallSnapshotRequest) -> InstallSnapshotResponse {
        let mut state = self.lock_state();

        if req.term < state.current_term {
            return InstallSnapshotResponse {
                term: state.current_term,
                success: false,
            };
        }
        self.step_down(&mut state, req.term);
        state.leader_hint = Some(req.leader_id.clone());

        let snap = &req.snapshot;
        let newer = snap.last_included_index > state.snapshot_last_index
            || (snap.last_included_index == state.snapshot_last_index
                && snap.last_included_term > state.snapshot_last_term);
        if !newer {
            return InstallSnapshotResponse {
                term: state.current_term,
                success: true,
            };
        }

        info!(
            node_id = %self.node_id,
            index = snap.last_included_index,
            term = snap.last_included_term,
            "Installing snapshot"
        );

        self.machine.restore(&snap.data);

        // Drop everything the snapshot covers.
        let first_kept = snap.last_included_index + 1;
        let old_first = state.snapshot_last_index + 1;
        state.log.retain(|e| e.index >= first_kept);
        self.delete_entries_from(old_first, snap.last_included_index);

        state.snapshot_last_index = snap.last_included_index;
        state.snapshot_last_term = snap.last_included_term;
        state.commit_index = state.commit_index.max(snap.last_included_index);
        state.last_applied = state.last_applied.max(snap.last_included_index);

        if let Err(e) = self
            .repo
            .put_json(&keys::raft_snapshot(&self.node_id), snap)
        {
            warn!(error = %e, "Could not persist snapshot");
        }

        InstallSnapshotResponse {
            term: state.current_term,
            success: true,
        }
    }

    // -----------------------------------------------------------------
    // Client entry point
    // -----------------------------------------------------------------

    /// Append a command on the leader and kick replication. Returns the
    /// assigned log index.
    pub fn append_command(&self, command: serde_json::Value) -> CoreResult<u64> {
        let index = {
            let mut state = self.lock_state();
            if state.role != RaftRole::Leader {
                return Err(CoreError::InvalidState(format!(
                    "node {} is not the leader{}",
                    self.node_id,
                    state
                        .leader_hint
                        .as_ref()
                        .map(|l| format!(" (leader: {l})"))
                        .unwrap_or_default()
                )));
            }
            let entry = LogEntry {
                term: state.current_term,
                index: state.last_log_index() + 1,
                command,
                timestamp: ids::unix_secs(),
            };
            self.persist_entry(&entry);
            let index = entry.index;
            state.log.push(entry);
            index
        };
        self.replicate_now.notify_one();
        Ok(index)
    }

    // -----------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(node_id = %self.node_id, "Raft driver started");
        loop {
            let action = {
                let mut state = self.lock_state();
                let now = Instant::now();
                match state.role {
                    RaftRole::Follower | RaftRole::Candidate => {
                        if now >= state.election_deadline {
                            TickAction::StartElection
                        } else {
                            TickAction::None
                        }
                    }
                    RaftRole::Leader => {
                        let due = state.last_heartbeat_sent.map_or(true, |t| {
                            now.duration_since(t) >= self.options.heartbeat_interval
                        });
                        if due {
                            state.last_heartbeat_sent = Some(now);
                            TickAction::SendHeartbeats
                        } else {
                            TickAction::None
                        }
                    }
                }
            };

            match action {
                TickAction::StartElection => self.run_election().await,
                TickAction::SendHeartbeats => self.replicate_round().await,
                TickAction::None => {}
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    info!(node_id = %self.node_id, "Raft driver stopped");
                    return;
                }
                () = tokio::time::sleep(TICK_INTERVAL) => {}
                () = self.replicate_now.notified() => {
                    if self.is_leader() {
                        self.replicate_round().await;
                    }
                }
            }
        }
    }

    async fn run_election(&self) {
        let peers = self.peers_snapshot();
        let request = {
            let mut state = self.lock_state();
            state.role = RaftRole::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.node_id.clone());
            state.leader_hint = None;
            state.election_deadline = Instant::now() + election_timeout(&self.options);
            self.persist_meta(&state);
            info!(
                node_id = %self.node_id,
                term = state.current_term,
                "Election started"
            );
            VoteRequest {
                term: state.current_term,
                candidate_id: self.node_id.clone(),
                last_log_index: state.last_log_index(),
                last_log_term: state.last_log_term(),
            }
        };

        // Bound the collection so a dead peer's retries cannot stall the
        // driver past the next election timeout.
        let votes = tokio::time::timeout(
            self.options.election_timeout_min,
            join_all(peers.iter().map(|peer| {
                let req = request.clone();
                let transport = self.transport.clone();
                let peer = peer.clone();
                async move { transport.request_vote(&peer, &req).await }
            })),
        )
        .await
        .unwrap_or_default();

        let mut granted = 1; // own vote
        let mut highest_term = request.term;
        for vote in votes.into_iter().flatten() {
            if vote.vote_granted {
                granted += 1;
            }
            highest_term = highest_term.max(vote.term);
        }

        let cluster_size = peers.len() + 1;
        let majority = cluster_size / 2 + 1;
        match self.finalize_election(highest_term, request.term, granted, &peers) {
            ElectionOutcome::Stale => {}
            ElectionOutcome::Won => {
                // Empty AppendEntries assert leadership immediately.
                self.replicate_round().await;
            }
            ElectionOutcome::Lost => {
                debug!(
                    node_id = %self.node_id,
                    granted,
                    majority,
                    "Election lost, retrying after timeout"
                );
            }
        }
    }

    /// Apply collected votes to the consensus state. Confined to a
    /// synchronous helper so the `MutexGuard` never needs to live across
    /// an `.await` point in the caller.
    fn finalize_election(
        &self,
        highest_term: u64,
        request_term: u64,
        granted: usize,
        peers: &[String],
    ) -> ElectionOutcome {
        let mut state = self.lock_state();
        if highest_term > state.current_term {
            self.step_down(&mut state, highest_term);
            return ElectionOutcome::Stale;
        }
        // The world may have moved on while we were collecting votes.
        if state.role != RaftRole::Candidate || state.current_term != request_term {
            return ElectionOutcome::Stale;
        }

        let cluster_size = peers.len() + 1;
        let majority = cluster_size / 2 + 1;
        if granted >= majority {
            self.become_leader(&mut state, peers);
            ElectionOutcome::Won
        } else {
            ElectionOutcome::Lost
        }
    }

    /// One replication round: bring every peer as far forward as possible.
    /// Bounded so an unreachable peer cannot starve heartbeats to the
    /// healthy ones.
    async fn replicate_round(&self) {
        let peers = self.peers_snapshot();
        let round = join_all(peers.iter().map(|peer| self.replicate_to_peer(peer.clone())));
        let _ = tokio::time::timeout(self.options.heartbeat_interval * 4, round).await;

        let mut state = self.lock_state();
        if state.role == RaftRole::Leader {
            self.advance_commit(&mut state);
            self.maybe_snapshot(&mut state);
        }
    }

    async fn replicate_to_peer(&self, peer: String) {
        for _ in 0..MAX_BACKTRACK_PER_ROUND {
            enum Outbound {
                Entries(AppendEntriesRequest),
                Snapshot(InstallSnapshotRequest),
            }

            let outbound = {
                let state = self.lock_state();
                if state.role != RaftRole::Leader {
                    return;
                }
                let next = *state
                    .next_index
                    .get(&peer)
                    .unwrap_or(&(state.last_log_index() + 1));

                if next <= state.snapshot_last_index {
                    // The entries this peer needs are folded into the
                    // snapshot.
                    match self
                        .repo
                        .get_json::<Snapshot>(&keys::raft_snapshot(&self.node_id))
                    {
                        Ok(Some(snapshot)) => Outbound::Snapshot(InstallSnapshotRequest {
                            term: state.current_term,
                            leader_id: self.node_id.clone(),
                            snapshot,
                        }),
                        _ => return,
                    }
                } else {
                    let prev_log_index = next - 1;
                    let Some(prev_log_term) = state.term_at(prev_log_index) else {
                        return;
                    };
                    Outbound::Entries(AppendEntriesRequest {
                        term: state.current_term,
                        leader_id: self.node_id.clone(),
                        prev_log_index,
                        prev_log_term,
                        entries: state.entries_from(next),
                        leader_commit: state.commit_index,
                    })
                }
            };

            match outbound {
                Outbound::Snapshot(req) => {
                    let last_included = req.snapshot.last_included_index;
                    match self.transport.install_snapshot(&peer, &req).await {
                        Ok(resp) => {
                            let mut state = self.lock_state();
                            if resp.term > state.current_term {
                                self.step_down(&mut state, resp.term);
                                return;
                            }
                            if resp.success {
                                state.next_index.insert(peer.clone(), last_included + 1);
                                state.match_index.insert(peer.clone(), last_included);
                            }
                        }
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "Snapshot install failed");
                            return;
                        }
                    }
                    // Follow up with entries past the snapshot next round.
                    return;
                }
                Outbound::Entries(req) => {
                    let sent = req.entries.len() as u64;
                    let prev = req.prev_log_index;
                    match self.transport.append_entries(&peer, &req).await {
                        Ok(resp) => {
                            let mut state = self.lock_state();
                            if resp.term > state.current_term {
                                self.step_down(&mut state, resp.term);
                                return;
                            }
                            if state.role != RaftRole::Leader {
                                return;
                            }
                            if resp.success {
                                let matched = prev + sent;
                                state.match_index.insert(peer.clone(), matched);
                                state.next_index.insert(peer.clone(), matched + 1);
                                return;
                            }
                            // Log mismatch: walk back one entry and retry.
                            let next = state
                                .next_index
                                .entry(peer.clone())
                                .or_insert(prev + 1);
                            *next = next.saturating_sub(1).max(1);
                        }
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "AppendEntries failed");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Leader commit rule: an index is committed once a majority holds it
    /// and it belongs to the current term.
    fn advance_commit(&self, state: &mut RaftState) {
        let peers_count = state.match_index.len();
        let cluster_size = peers_count + 1;
        let majority = cluster_size / 2 + 1;

        let mut candidate = state.last_log_index();
        while candidate > state.commit_index {
            let replicas = 1 + state
                .match_index
                .values()
                .filter(|&&m| m >= candidate)
                .count();
            if replicas >= majority && state.term_at(candidate) == Some(state.current_term) {
                state.commit_index = candidate;
                self.apply_committed(state);
                break;
            }
            candidate -= 1;
        }
    }

    fn apply_committed(&self, state: &mut RaftState) {
        while state.last_applied < state.commit_index {
            let next = state.last_applied + 1;
            if let Some(entry) = state.entry_at(next) {
                self.machine.apply(entry);
            }
            state.last_applied = next;
        }
    }

    /// Fold the applied prefix into a snapshot once the log is long enough.
    fn maybe_snapshot(&self, state: &mut RaftState) {
        if state.log.len() <= self.options.snapshot_threshold {
            return;
        }
        if state.last_applied <= state.snapshot_last_index {
            return;
        }
        let Some(last_term) = state.term_at(state.last_applied) else {
            return;
        };

        let snapshot = Snapshot {
            last_included_index: state.last_applied,
            last_included_term: last_term,
            data: self.machine.snapshot(),
            timestamp: ids::unix_secs(),
        };
        if let Err(e) = self
            .repo
            .put_json(&keys::raft_snapshot(&self.node_id), &snapshot)
        {
            warn!(error = %e, "Could not persist snapshot");
            return;
        }

        let old_first = state.snapshot_last_index + 1;
        let new_last = snapshot.last_included_index;
        state.log.retain(|e| e.index > new_last);
        self.delete_entries_from(old_first, new_last);
        state.snapshot_last_index = new_last;
        state.snapshot_last_term = snapshot.last_included_term;

        info!(
            node_id = %self.node_id,
            index = new_last,
            remaining = state.log.len(),
            "Snapshot taken, log truncated"
        );
    }
}

fn election_timeout(options: &RaftOptions) -> Duration {
    ids::uniform_between(options.election_timeout_min, options.election_timeout_max)
}
