//! Multi-node consensus scenarios over the in-process loopback transport:
//! election, replication, leader failover, restart catch-up, and
//! snapshot-based recovery.

use skymesh::consensus::{
    LogEntry, LoopbackTransport, NullStateMachine, RaftNode, RaftOptions, StateMachine,
};
use skymesh::storage::{Repository, SledRepository};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const ELECTION_MAX: Duration = Duration::from_millis(400);

fn options() -> RaftOptions {
    RaftOptions {
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: ELECTION_MAX,
        heartbeat_interval: Duration::from_millis(50),
        snapshot_threshold: 1000,
    }
}

struct TestNode {
    raft: Arc<RaftNode>,
    repo: Arc<dyn Repository>,
    cancel: CancellationToken,
}

fn spawn_node(
    id: &str,
    peers: Vec<String>,
    repo: Arc<dyn Repository>,
    transport: &Arc<LoopbackTransport>,
    machine: Arc<dyn StateMachine>,
    opts: RaftOptions,
) -> TestNode {
    let raft = RaftNode::new(id, peers, repo.clone(), transport.clone(), machine, opts).unwrap();
    transport.add_node(raft.clone());
    let cancel = CancellationToken::new();
    tokio::spawn(raft.clone().run(cancel.clone()));
    TestNode { raft, repo, cancel }
}

async fn wait_for<F: Fn() -> bool>(budget: Duration, predicate: F) -> bool {
    let deadline = Instant::now() + budget;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

fn leader_of(nodes: &[&TestNode]) -> Option<String> {
    nodes
        .iter()
        .find(|n| n.raft.is_leader())
        .map(|n| n.raft.node_id().to_string())
}

fn three_peer_lists() -> Vec<(String, Vec<String>)> {
    let ids = ["n1", "n2", "n3"];
    ids.iter()
        .map(|id| {
            let peers = ids
                .iter()
                .filter(|p| p != &id)
                .map(|p| (*p).to_string())
                .collect();
            ((*id).to_string(), peers)
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_election_replication_and_failover() {
    let transport = Arc::new(LoopbackTransport::new());
    let mut nodes: Vec<TestNode> = Vec::new();
    for (id, peers) in three_peer_lists() {
        let repo: Arc<dyn Repository> = Arc::new(SledRepository::open_temporary().unwrap());
        nodes.push(spawn_node(
            &id,
            peers,
            repo,
            &transport,
            Arc::new(NullStateMachine),
            options(),
        ));
    }

    // A leader emerges.
    let refs: Vec<&TestNode> = nodes.iter().collect();
    assert!(
        wait_for(Duration::from_secs(3), || leader_of(&refs).is_some()).await,
        "no leader elected"
    );
    let first_leader = leader_of(&refs).unwrap();

    // Commit 100 entries.
    let leader = nodes
        .iter()
        .find(|n| n.raft.node_id() == first_leader)
        .unwrap();
    for i in 0..100u64 {
        leader
            .raft
            .append_command(serde_json::json!({"op": i}))
            .unwrap();
    }
    assert!(
        wait_for(Duration::from_secs(5), || {
            nodes
                .iter()
                .all(|n| n.raft.status().last_log_index >= 100)
        })
        .await,
        "entries did not replicate to all nodes"
    );
    assert!(
        wait_for(Duration::from_secs(5), || {
            leader.raft.status().commit_index >= 100
        })
        .await,
        "leader did not commit"
    );

    // Kill the leader.
    transport.remove_node(&first_leader);
    leader.cancel.cancel();
    let survivors: Vec<&TestNode> = nodes
        .iter()
        .filter(|n| n.raft.node_id() != first_leader)
        .collect();

    // Remaining two elect a replacement within twice the election
    // timeout maximum (plus driver tick slack).
    let start = Instant::now();
    assert!(
        wait_for(2 * ELECTION_MAX + Duration::from_millis(300), || {
            leader_of(&survivors).is_some()
        })
        .await,
        "no new leader after failover"
    );
    let elapsed = start.elapsed();
    assert!(
        elapsed <= 2 * ELECTION_MAX + Duration::from_millis(300),
        "failover took {elapsed:?}"
    );

    let second_leader = leader_of(&survivors).unwrap();
    assert_ne!(second_leader, first_leader);
    let new_leader = survivors
        .iter()
        .find(|n| n.raft.node_id() == second_leader)
        .unwrap();
    assert!(
        new_leader.raft.status().last_log_index >= 100,
        "new leader is missing entries"
    );

    // Restart the old leader from its persisted state; it rejoins as a
    // follower and catches up.
    let old_repo = leader.repo.clone();
    let peers = three_peer_lists()
        .into_iter()
        .find(|(id, _)| id == &first_leader)
        .map(|(_, peers)| peers)
        .unwrap();
    let restarted = spawn_node(
        &first_leader,
        peers,
        old_repo,
        &transport,
        Arc::new(NullStateMachine),
        options(),
    );
    assert_eq!(restarted.raft.status().last_log_index, 100);

    assert!(
        wait_for(Duration::from_secs(3), || {
            let status = restarted.raft.status();
            status.commit_index >= 100
        })
        .await,
        "restarted node did not catch up"
    );

    for node in &nodes {
        node.cancel.cancel();
    }
    restarted.cancel.cancel();
}

/// State machine that records applied commands in order.
struct RecordingMachine {
    applied: Mutex<Vec<serde_json::Value>>,
}

impl RecordingMachine {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            applied: Mutex::new(Vec::new()),
        })
    }

    fn values(&self) -> Vec<serde_json::Value> {
        self.applied.lock().unwrap().clone()
    }
}

impl StateMachine for RecordingMachine {
    fn apply(&self, entry: &LogEntry) {
        self.applied.lock().unwrap().push(entry.command.clone());
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({ "applied": self.values() })
    }

    fn restore(&self, data: &serde_json::Value) {
        let restored = data
            .get("applied")
            .and_then(|a| a.as_array())
            .cloned()
            .unwrap_or_default();
        *self.applied.lock().unwrap() = restored;
    }
}

/// Snapshot-install followed by log replay reproduces the same applied
/// state as the original sequence: a lagging peer joining after the log
/// was truncated converges through snapshot + remaining entries.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_install_plus_replay_matches() {
    let transport = Arc::new(LoopbackTransport::new());
    let tight_snapshots = RaftOptions {
        snapshot_threshold: 10,
        ..options()
    };

    // A single-node cluster elects itself and compacts aggressively.
    let leader_machine = RecordingMachine::new();
    let leader_repo: Arc<dyn Repository> = Arc::new(SledRepository::open_temporary().unwrap());
    let leader = spawn_node(
        "solo",
        vec![],
        leader_repo,
        &transport,
        leader_machine.clone(),
        tight_snapshots.clone(),
    );

    assert!(
        wait_for(Duration::from_secs(3), || leader.raft.is_leader()).await,
        "single node did not elect itself"
    );
    for i in 0..40u64 {
        leader
            .raft
            .append_command(serde_json::json!({"seq": i}))
            .unwrap();
        // Small pacing so commits and snapshots interleave with appends.
        if i % 10 == 9 {
            tokio::time::sleep(Duration::from_millis(120)).await;
        }
    }
    assert!(
        wait_for(Duration::from_secs(5), || {
            leader.raft.status().last_applied >= 40
        })
        .await,
        "leader did not apply all commands"
    );
    assert_eq!(leader_machine.values().len(), 40);

    // A fresh follower joins; its only route to the early entries is the
    // snapshot.
    let follower_machine = RecordingMachine::new();
    let follower_repo: Arc<dyn Repository> = Arc::new(SledRepository::open_temporary().unwrap());
    let follower = spawn_node(
        "late",
        vec!["solo".into()],
        follower_repo,
        &transport,
        follower_machine.clone(),
        tight_snapshots,
    );
    leader.raft.set_peers(vec!["late".into()]);

    assert!(
        wait_for(Duration::from_secs(5), || {
            follower.raft.status().last_applied >= 40
        })
        .await,
        "follower did not converge"
    );

    // Identical applied sequences, byte for byte.
    assert_eq!(leader_machine.values(), follower_machine.values());

    leader.cancel.cancel();
    follower.cancel.cancel();
}

/// A minority partition can neither elect a fresh leader nor commit new
/// entries, while the majority side stays available.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn minority_partition_cannot_commit() {
    let transport = Arc::new(LoopbackTransport::new());
    let mut nodes: Vec<TestNode> = Vec::new();
    for (id, peers) in three_peer_lists() {
        let repo: Arc<dyn Repository> = Arc::new(SledRepository::open_temporary().unwrap());
        nodes.push(spawn_node(
            &id,
            peers,
            repo,
            &transport,
            Arc::new(NullStateMachine),
            options(),
        ));
    }
    let refs: Vec<&TestNode> = nodes.iter().collect();
    assert!(
        wait_for(Duration::from_secs(3), || leader_of(&refs).is_some()).await,
        "no leader elected"
    );
    let leader_id = leader_of(&refs).unwrap();

    // Partition: the leader alone on one side, the other two together.
    for node in &nodes {
        if node.raft.node_id() != leader_id {
            transport.remove_node(node.raft.node_id());
        }
    }

    // The isolated leader accepts appends but can never commit them.
    let isolated = nodes
        .iter()
        .find(|n| n.raft.node_id() == leader_id)
        .unwrap();
    let before = isolated.raft.status().commit_index;
    if isolated.raft.is_leader() {
        isolated
            .raft
            .append_command(serde_json::json!({"doomed": true}))
            .unwrap();
    }
    tokio::time::sleep(2 * ELECTION_MAX).await;
    assert_eq!(
        isolated.raft.status().commit_index,
        before,
        "minority side must not commit"
    );

    // Meanwhile the majority side elects among itself once reconnected to
    // each other (they never left the transport registry of one another
    // through the leader's removal, so re-add them).
    let majority: Vec<&TestNode> = nodes
        .iter()
        .filter(|n| n.raft.node_id() != leader_id)
        .collect();
    for node in &majority {
        transport.add_node(node.raft.clone());
    }
    transport.remove_node(&leader_id);
    assert!(
        wait_for(Duration::from_secs(3), || {
            majority.iter().any(|n| n.raft.is_leader())
        })
        .await,
        "majority side failed to elect"
    );

    for node in &nodes {
        node.cancel.cancel();
    }
}
