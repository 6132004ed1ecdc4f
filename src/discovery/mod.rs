//! Peer discovery.
//!
//! The core never hard-codes peer addresses: every lookup goes through a
//! [`DiscoveryBackend`]. Three backends exist — a static list from
//! configuration, a Consul-style HTTP registry, and an etcd-style KV
//! prefix — each supporting register, deregister, discover, and watch.

use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub node_id: String,
    /// Base URL, e.g. `http://10.0.0.2:8080`.
    pub address: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Registered(ServiceNode),
    Deregistered(String),
}

#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    async fn register(&self, node: &ServiceNode) -> CoreResult<()>;
    async fn deregister(&self, node_id: &str) -> CoreResult<()>;
    async fn discover(&self) -> CoreResult<Vec<ServiceNode>>;
    /// Membership change stream.
    fn watch(&self) -> broadcast::Receiver<DiscoveryEvent>;

    /// Resolve one peer's base address.
    async fn resolve(&self, node_id: &str) -> CoreResult<String> {
        self.discover()
            .await?
            .into_iter()
            .find(|n| n.node_id == node_id)
            .map(|n| n.address)
            .ok_or_else(|| CoreError::NotFound(format!("peer {node_id}")))
    }
}

/// Build the backend selected in configuration.
pub fn from_config(cfg: &crate::config::ClusterSection) -> Arc<dyn DiscoveryBackend> {
    match cfg.discovery.as_str() {
        "consul" => Arc::new(ConsulDiscovery::new(&cfg.consul_addr, &cfg.service_name)),
        "etcd" => Arc::new(EtcdDiscovery::new(&cfg.etcd_addr, &cfg.service_name)),
        other => {
            if other != "static" {
                warn!(backend = %other, "Unknown discovery backend, using static");
            }
            Arc::new(StaticDiscovery::from_peers(&cfg.peers))
        }
    }
}

// ---------------------------------------------------------------------------
// Static
// ---------------------------------------------------------------------------

pub struct StaticDiscovery {
    nodes: RwLock<HashMap<String, ServiceNode>>,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            nodes: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn from_peers(peers: &[crate::config::PeerEntry]) -> Self {
        let discovery = Self::new();
        let mut map = HashMap::new();
        for peer in peers {
            map.insert(
                peer.node_id.clone(),
                ServiceNode {
                    node_id: peer.node_id.clone(),
                    address: peer.address.clone(),
                    metadata: HashMap::new(),
                },
            );
        }
        // Also honour PEER_NODES from the environment.
        if let Ok(env_peers) = std::env::var("PEER_NODES") {
            match serde_json::from_str::<Vec<ServiceNode>>(&env_peers) {
                Ok(nodes) => {
                    for node in nodes {
                        map.insert(node.node_id.clone(), node);
                    }
                }
                Err(e) => warn!(error = %e, "Could not parse PEER_NODES"),
            }
        }
        if let Ok(mut guard) = discovery.nodes.try_write() {
            *guard = map;
        }
        discovery
    }
}

impl Default for StaticDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiscoveryBackend for StaticDiscovery {
    async fn register(&self, node: &ServiceNode) -> CoreResult<()> {
        self.nodes
            .write()
            .await
            .insert(node.node_id.clone(), node.clone());
        let _ = self.events.send(DiscoveryEvent::Registered(node.clone()));
        info!(node_id = %node.node_id, address = %node.address, "Peer registered");
        Ok(())
    }

    async fn deregister(&self, node_id: &str) -> CoreResult<()> {
        self.nodes.write().await.remove(node_id);
        let _ = self
            .events
            .send(DiscoveryEvent::Deregistered(node_id.to_string()));
        Ok(())
    }

    async fn discover(&self) -> CoreResult<Vec<ServiceNode>> {
        let mut nodes: Vec<ServiceNode> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    fn watch(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Consul
// ---------------------------------------------------------------------------

pub struct ConsulDiscovery {
    base_url: String,
    service_name: String,
    http: reqwest::Client,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl ConsulDiscovery {
    pub fn new(base_url: &str, service_name: &str) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_name: service_name.to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            events,
        }
    }

    /// Poll membership and broadcast the diff until cancelled.
    pub async fn run_watch_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut known: HashMap<String, ServiceNode> = HashMap::new();
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(Duration::from_secs(10)) => {
                    let Ok(nodes) = self.discover().await else { continue };
                    for node in &nodes {
                        if !known.contains_key(&node.node_id) {
                            let _ = self.events.send(DiscoveryEvent::Registered(node.clone()));
                        }
                    }
                    for node_id in known.keys() {
                        if !nodes.iter().any(|n| &n.node_id == node_id) {
                            let _ = self.events.send(DiscoveryEvent::Deregistered(node_id.clone()));
                        }
                    }
                    known = nodes.into_iter().map(|n| (n.node_id.clone(), n)).collect();
                }
            }
        }
    }
}

#[async_trait]
impl DiscoveryBackend for ConsulDiscovery {
    async fn register(&self, node: &ServiceNode) -> CoreResult<()> {
        let (address, port) = split_address(&node.address);
        let body = serde_json::json!({
            "ID": format!("{}-{}", self.service_name, node.node_id),
            "Name": self.service_name,
            "Address": address,
            "Port": port,
            "Tags": [format!("node_id:{}", node.node_id)],
            "Meta": node.metadata,
            "Check": {
                "HTTP": format!("{}/api/v1/health", node.address),
                "Interval": "10s",
                "Timeout": "2s",
                "DeregisterCriticalServiceAfter": "30s",
            },
        });
        let resp = self
            .http
            .put(format!("{}/v1/agent/service/register", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("consul register: {e}")))?;
        if !resp.status().is_success() {
            return Err(CoreError::Transient(format!(
                "consul register returned {}",
                resp.status()
            )));
        }
        info!(node_id = %node.node_id, "Registered with Consul");
        Ok(())
    }

    async fn deregister(&self, node_id: &str) -> CoreResult<()> {
        let service_id = format!("{}-{}", self.service_name, node_id);
        self.http
            .put(format!(
                "{}/v1/agent/service/deregister/{service_id}",
                self.base_url
            ))
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("consul deregister: {e}")))?;
        Ok(())
    }

    async fn discover(&self) -> CoreResult<Vec<ServiceNode>> {
        #[derive(Deserialize)]
        struct HealthEntry {
            #[serde(rename = "Service")]
            service: HealthService,
        }
        #[derive(Deserialize)]
        struct HealthService {
            #[serde(rename = "Address")]
            address: String,
            #[serde(rename = "Port")]
            port: u16,
            #[serde(rename = "Tags", default)]
            tags: Vec<String>,
        }

        let resp = self
            .http
            .get(format!(
                "{}/v1/health/service/{}?passing=true",
                self.base_url, self.service_name
            ))
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("consul discover: {e}")))?;
        let entries: Vec<HealthEntry> = resp
            .json()
            .await
            .map_err(|e| CoreError::Transient(format!("consul response: {e}")))?;

        let mut nodes = Vec::new();
        for entry in entries {
            let node_id = entry
                .service
                .tags
                .iter()
                .find_map(|t| t.strip_prefix("node_id:"))
                .unwrap_or_default()
                .to_string();
            if node_id.is_empty() {
                continue;
            }
            nodes.push(ServiceNode {
                node_id,
                address: format!("http://{}:{}", entry.service.address, entry.service.port),
                metadata: HashMap::new(),
            });
        }
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    fn watch(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// etcd (v3 JSON gateway)
// ---------------------------------------------------------------------------

pub struct EtcdDiscovery {
    base_url: String,
    prefix: String,
    http: reqwest::Client,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl EtcdDiscovery {
    pub fn new(base_url: &str, service_name: &str) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            prefix: format!("/services/{service_name}/"),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            events,
        }
    }

    fn key_for(&self, node_id: &str) -> String {
        format!("{}{node_id}", self.prefix)
    }

    /// Poll the prefix and broadcast the diff until cancelled.
    pub async fn run_watch_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut known: HashMap<String, ServiceNode> = HashMap::new();
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(Duration::from_secs(10)) => {
                    let Ok(nodes) = self.discover().await else { continue };
                    for node in &nodes {
                        if !known.contains_key(&node.node_id) {
                            let _ = self.events.send(DiscoveryEvent::Registered(node.clone()));
                        }
                    }
                    for node_id in known.keys() {
                        if !nodes.iter().any(|n| &n.node_id == node_id) {
                            let _ = self.events.send(DiscoveryEvent::Deregistered(node_id.clone()));
                        }
                    }
                    known = nodes.into_iter().map(|n| (n.node_id.clone(), n)).collect();
                }
            }
        }
    }
}

#[async_trait]
impl DiscoveryBackend for EtcdDiscovery {
    async fn register(&self, node: &ServiceNode) -> CoreResult<()> {
        let value = serde_json::to_vec(node)?;
        let body = serde_json::json!({
            "key": base64_encode(self.key_for(&node.node_id).as_bytes()),
            "value": base64_encode(&value),
        });
        let resp = self
            .http
            .post(format!("{}/v3/kv/put", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("etcd put: {e}")))?;
        if !resp.status().is_success() {
            return Err(CoreError::Transient(format!(
                "etcd put returned {}",
                resp.status()
            )));
        }
        debug!(node_id = %node.node_id, "Registered with etcd");
        Ok(())
    }

    async fn deregister(&self, node_id: &str) -> CoreResult<()> {
        let body = serde_json::json!({
            "key": base64_encode(self.key_for(node_id).as_bytes()),
        });
        self.http
            .post(format!("{}/v3/kv/deleterange", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("etcd delete: {e}")))?;
        Ok(())
    }

    async fn discover(&self) -> CoreResult<Vec<ServiceNode>> {
        #[derive(Deserialize)]
        struct RangeResponse {
            #[serde(default)]
            kvs: Vec<Kv>,
        }
        #[derive(Deserialize)]
        struct Kv {
            value: String,
        }

        // range_end = prefix with the last byte incremented.
        let mut end = self.prefix.clone().into_bytes();
        if let Some(last) = end.last_mut() {
            *last += 1;
        }
        let body = serde_json::json!({
            "key": base64_encode(self.prefix.as_bytes()),
            "range_end": base64_encode(&end),
        });
        let resp = self
            .http
            .post(format!("{}/v3/kv/range", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("etcd range: {e}")))?;
        let range: RangeResponse = resp
            .json()
            .await
            .map_err(|e| CoreError::Transient(format!("etcd response: {e}")))?;

        let mut nodes = Vec::new();
        for kv in range.kvs {
            if let Some(decoded) = base64_decode(&kv.value) {
                if let Ok(node) = serde_json::from_slice::<ServiceNode>(&decoded) {
                    nodes.push(node);
                }
            }
        }
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    fn watch(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }
}

// The etcd v3 JSON gateway carries keys and values base64-encoded.
fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn base64_decode(input: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input).ok()
}

fn split_address(address: &str) -> (String, u16) {
    let stripped = address
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    match stripped.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(80)),
        None => (stripped.to_string(), 80),
    }
}
