//! Skymesh control plane node.
//!
//! One process hosts every component: fleet inventory, mission scheduler,
//! coordinator, consensus node, data sync, telemetry pipeline, viewer
//! broadcast, cross-region replication, autoscaler, and alerting. This is
//! the composition root — components are constructed here and injected
//! where needed; no module-level state beyond the global config.
//!
//! # Usage
//!
//! ```bash
//! # Single node with defaults
//! skymesh --node-id alpha
//!
//! # Three-node cluster from a config file
//! SKYMESH_CONFIG=node-a.toml skymesh
//! ```
//!
//! # Environment Variables
//!
//! - `SKYMESH_CONFIG`: path to the TOML configuration
//! - `PEER_NODES`: JSON list of static peers
//! - `RUST_LOG`: logging filter (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use skymesh::alerting::{AlertManager, Metric, MetricsStore};
use skymesh::api::{self, AppState};
use skymesh::autoscale::{AutoScaler, NodeMetrics, ScalingPolicy};
use skymesh::broadcast::{StreamMessage, ViewerBroadcaster};
use skymesh::config::{self, NodeConfig};
use skymesh::consensus::{HttpTransport, RaftNode, RaftOptions, RaftTransport};
use skymesh::coordinator::Coordinator;
use skymesh::discovery::{self, ServiceNode};
use skymesh::fleet::{ClusterRegistry, FleetInventory, UavFailure};
use skymesh::scheduler::MissionScheduler;
use skymesh::storage::{Repository, SledRepository};
use skymesh::sync::{DataSynchronizer, SyncStateMachine};
use skymesh::telemetry::TelemetryService;
use skymesh::types::{EntityKind, MissionState, SyncOpKind, UavStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "skymesh")]
#[command(about = "Skymesh UAV fleet control plane")]
#[command(version)]
struct CliArgs {
    /// Node identifier (overrides the config file)
    #[arg(long)]
    node_id: Option<String>,

    /// Server bind address (overrides the config file)
    #[arg(short, long)]
    addr: Option<String>,

    /// Path to the TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Local region identifier for cross-region replication
    #[arg(long, default_value = "region-1")]
    region: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();

    // Configuration: explicit path, then env/cwd, then defaults.
    let mut cfg = args
        .config
        .as_deref()
        .and_then(NodeConfig::from_file)
        .unwrap_or_else(NodeConfig::load);
    if let Some(node_id) = args.node_id {
        cfg.node.id = node_id;
    }
    if let Some(addr) = args.addr {
        cfg.node.bind_addr = addr;
    }
    cfg.validate().map_err(|e| anyhow::anyhow!(e))?;
    config::init(cfg);
    let cfg = config::get();

    info!(node_id = %cfg.node.id, addr = %cfg.node.bind_addr, "Starting skymesh node");

    // ------------------------------------------------------------------
    // Storage and component construction
    // ------------------------------------------------------------------

    let repo: Arc<dyn Repository> = Arc::new(
        SledRepository::open(&cfg.storage.data_dir).context("opening data store")?,
    );

    let fleet = Arc::new(FleetInventory::open(repo.clone()).context("opening fleet inventory")?);
    let clusters =
        Arc::new(ClusterRegistry::open(repo.clone()).context("opening cluster registry")?);
    let scheduler = Arc::new(
        MissionScheduler::open(repo.clone(), fleet.clone()).context("opening scheduler")?,
    );
    let coordinator = Arc::new(Coordinator::new(
        cfg.coordinator.min_separation_m,
        cfg.coordinator.avoidance_radius_m,
    ));
    let telemetry = Arc::new(TelemetryService::new(fleet.clone()));
    let broadcaster = Arc::new(ViewerBroadcaster::from_config());
    let metrics = Arc::new(MetricsStore::new(Duration::from_secs(3600)));
    let alerts = Arc::new(AlertManager::new(metrics.clone()));
    let regions = Arc::new(skymesh::regions::CrossRegionSync::new(&args.region));

    // Discovery + transport + consensus.
    let discovery = discovery::from_config(&cfg.cluster);
    discovery
        .register(&ServiceNode {
            node_id: cfg.node.id.clone(),
            address: format!("http://{}", cfg.node.bind_addr),
            metadata: std::collections::HashMap::new(),
        })
        .await
        .unwrap_or_else(|e| warn!(error = %e, "Self-registration with discovery failed"));

    let peer_ids: Vec<String> = discovery
        .discover()
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|n| n.node_id)
        .filter(|id| id != &cfg.node.id)
        .collect();
    info!(peers = ?peer_ids, "Cluster peers resolved");

    let sync = DataSynchronizer::new(&cfg.node.id, repo.clone(), scheduler.clone(), fleet.clone());
    let machine = Arc::new(SyncStateMachine::new(sync.clone()));
    let rpc = Arc::new(HttpTransport::new(discovery.clone()));
    let transport: Arc<dyn RaftTransport> = rpc.clone();
    let raft = RaftNode::new(
        &cfg.node.id,
        peer_ids.clone(),
        repo.clone(),
        transport,
        machine,
        RaftOptions::from_config(),
    )
    .context("initialising consensus node")?;
    sync.attach_raft(raft.clone());

    let autoscaler = Arc::new(AutoScaler::new(
        ScalingPolicy::from_config(),
        // Scaling is effected externally; these callbacks only record the
        // decision until an orchestrator hook is attached.
        Arc::new(|n| {
            info!(nodes = n, "Scale-up requested");
            true
        }),
        Arc::new(|nodes: &[String]| {
            info!(nodes = ?nodes, "Scale-down requested");
            true
        }),
    ));

    let state = AppState {
        fleet: fleet.clone(),
        clusters,
        scheduler: scheduler.clone(),
        coordinator: coordinator.clone(),
        telemetry: telemetry.clone(),
        broadcaster: broadcaster.clone(),
        raft: raft.clone(),
        sync: sync.clone(),
        regions: regions.clone(),
        autoscaler: autoscaler.clone(),
        metrics: metrics.clone(),
        alerts: alerts.clone(),
        rpc: Some(rpc),
    };

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<()> = JoinSet::new();

    // Liveness scan; failures flow to the coordinator for reassignment.
    let (failure_tx, failure_rx) = mpsc::channel::<UavFailure>(64);
    tasks.spawn(fleet.clone().run_liveness_loop(failure_tx, cancel.clone()));
    tasks.spawn(handle_uav_failures(
        failure_rx,
        fleet.clone(),
        coordinator.clone(),
        cancel.clone(),
    ));

    tasks.spawn(scheduler.clone().run_dispatch_loop(cancel.clone()));
    tasks.spawn(coordinator.clone().run_conflict_loop(cancel.clone()));
    tasks.spawn(raft.clone().run(cancel.clone()));
    tasks.spawn(sync.clone().run_change_listener(
        scheduler.subscribe_changes(),
        fleet.subscribe_changes(),
        cancel.clone(),
    ));
    tasks.spawn(sync.clone().run_sync_loops(cancel.clone()));
    tasks.spawn(broadcaster.clone().run_fanout(cancel.clone()));
    tasks.spawn(broadcaster.clone().run_heartbeat(cancel.clone()));
    tasks.spawn(regions.clone().run_worker(cancel.clone()));
    tasks.spawn(alerts.clone().run_loop(cancel.clone()));

    // Forward mission events to viewers.
    tasks.spawn(forward_mission_events(
        scheduler.clone(),
        broadcaster.clone(),
        cancel.clone(),
    ));

    // Replicate entity changes to peer regions.
    tasks.spawn(forward_region_changes(
        scheduler.clone(),
        regions.clone(),
        raft.clone(),
        cancel.clone(),
    ));

    // Node metrics sampling for the autoscaler and alert rules.
    tasks.spawn(sample_node_metrics(
        scheduler.clone(),
        fleet.clone(),
        metrics.clone(),
        autoscaler.clone(),
        cfg.node.id.clone(),
        cancel.clone(),
    ));

    let cluster_size = peer_ids.len() + 1;
    tasks.spawn(
        autoscaler
            .clone()
            .run_loop(Arc::new(move || cluster_size), cancel.clone()),
    );

    // ------------------------------------------------------------------
    // HTTP server
    // ------------------------------------------------------------------

    let router = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.node.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.node.bind_addr))?;
    info!(addr = %cfg.node.bind_addr, "API server listening");

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "API server exited with error");
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown signal received, stopping background tasks");
    cancel.cancel();

    // Every loop exits within one check interval of the cancel signal.
    let drain = async {
        while tasks.join_next().await.is_some() {}
        let _ = server.await;
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        warn!("Some tasks did not stop in time; aborting");
        tasks.abort_all();
    }

    let _ = discovery.deregister(&config::get().node.id).await;
    info!("Shutdown complete");
    Ok(())
}

/// Move missions off failed vehicles and rebind the fleet accordingly.
async fn handle_uav_failures(
    mut failures: mpsc::Receiver<UavFailure>,
    fleet: Arc<FleetInventory>,
    coordinator: Arc<Coordinator>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            failure = failures.recv() => {
                let Some(failure) = failure else { return };
                info!(
                    uav_id = %failure.uav_id,
                    mission_id = ?failure.mission_id,
                    "Handling UAV failure"
                );
                let candidates = fleet.list();
                for moved in coordinator.reassign_from_failed(&failure.uav_id, &candidates) {
                    if let Err(e) = fleet.clear_binding(&moved.from_uav) {
                        warn!(error = %e, "Could not clear failed vehicle binding");
                    }
                    if let Err(e) = fleet.set_status(
                        &moved.to_uav,
                        UavStatus::Busy,
                        Some(moved.mission_id.clone()),
                    ) {
                        warn!(error = %e, "Could not bind replacement vehicle");
                    }
                }
            }
        }
    }
}

/// Scheduler events feed the viewer stream.
async fn forward_mission_events(
    scheduler: Arc<MissionScheduler>,
    broadcaster: Arc<ViewerBroadcaster>,
    cancel: CancellationToken,
) {
    let mut events = scheduler.subscribe_events();
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            event = events.recv() => {
                match event {
                    Ok(event) => broadcaster.publish(StreamMessage::MissionEvent { data: event }),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

/// Replicated entity changes fan out to peer regions (leader only).
async fn forward_region_changes(
    scheduler: Arc<MissionScheduler>,
    regions: Arc<skymesh::regions::CrossRegionSync>,
    raft: Arc<RaftNode>,
    cancel: CancellationToken,
) {
    let mut changes = scheduler.subscribe_changes();
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            change = changes.recv() => {
                match change {
                    Ok(change) => {
                        if !raft.is_leader() {
                            continue;
                        }
                        let payload = match (change.entity, change.op) {
                            (_, SyncOpKind::Delete) => serde_json::Value::Null,
                            (EntityKind::Mission, _) => scheduler
                                .get(&change.entity_id)
                                .ok()
                                .and_then(|m| serde_json::to_value(m).ok())
                                .unwrap_or_default(),
                            _ => serde_json::Value::Null,
                        };
                        regions
                            .enqueue_change(change.op, change.entity, &change.entity_id, payload)
                            .await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

/// Periodic node metric samples for autoscaling and alerting.
async fn sample_node_metrics(
    scheduler: Arc<MissionScheduler>,
    fleet: Arc<FleetInventory>,
    metrics: Arc<MetricsStore>,
    autoscaler: Arc<AutoScaler>,
    node_id: String,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(Duration::from_secs(10)) => {
                let missions = scheduler.list();
                let pending = missions
                    .iter()
                    .filter(|m| m.state == MissionState::Pending)
                    .count();
                let active = missions
                    .iter()
                    .filter(|m| matches!(m.state, MissionState::Running | MissionState::Paused))
                    .count();

                metrics.record(Metric::gauge("pending_missions", pending as f64));
                metrics.record(Metric::gauge("active_missions", active as f64));
                metrics.record(Metric::gauge("uav_count", fleet.list().len() as f64));
                metrics.record(Metric::gauge(
                    "available_uavs",
                    fleet.available_uavs().len() as f64,
                ));

                // CPU and memory arrive from node agents via the metrics
                // endpoint; absent samples read as unloaded.
                let cpu = metrics.latest("cpu_percent", None).unwrap_or(0.0);
                let memory = metrics.latest("memory_percent", None).unwrap_or(0.0);
                autoscaler.record_metrics(NodeMetrics {
                    node_id: node_id.clone(),
                    cpu_percent: cpu,
                    memory_percent: memory,
                    active_missions: active,
                    pending_missions: pending,
                    timestamp: skymesh::ids::unix_secs(),
                });
            }
        }
    }
}
