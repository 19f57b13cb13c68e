//! Cluster manager: master/slave mode state machine, membership
//! mutations, heartbeat and key rotation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time;
use tracing::{debug, info, warn};

use crate::addons::{AddonManager, CoreController};
use crate::cluster::crypto;
use crate::cluster::registry::{AddonSummary, ClusterNode, NodeRegistry};
use crate::cluster::state::{slugify, ClusterState, RegisteredNode};
use crate::cluster::transport::ClusterTransport;
use crate::config::SupervisorConfig;
use crate::error::{ClusterError, HearthError, Result};

/// Chance that any accepted sync rotates that node's key. Spreading
/// rotations across heartbeats instead of a fixed schedule keeps all
/// peers from rotating simultaneously; the expected rotation interval is
/// `1 / p` heartbeats.
pub const KEY_ROTATION_PROBABILITY: f64 = 0.2;

/// Internal message types for the background loop.
#[derive(Debug)]
enum ClusterTask {
    RotateMasterKey,
    Heartbeat,
    Shutdown,
}

/// Node summary exposed through the local API.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub slug: String,
    pub name: String,
    pub last_ip: Option<String>,
    pub version: Option<String>,
    pub arch: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub addons: Vec<AddonSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterInfo {
    pub is_master: bool,
    pub is_inited: bool,
    pub node_name: String,
    pub node_slug: String,
    pub master_ip: Option<String>,
    pub nodes: Vec<NodeInfo>,
}

/// Owns all cluster state. Every mutation of the persisted membership
/// table goes through here, holding `write_lock` across the whole
/// read-modify-write so interleaved operations cannot clobber each other,
/// and saving to disk before the operation returns.
pub struct ClusterManager {
    state: RwLock<ClusterState>,
    state_path: PathBuf,
    registry: NodeRegistry,
    transport: ClusterTransport,
    addons: Arc<AddonManager>,
    core: Arc<dyn CoreController>,
    heartbeat_interval: Duration,
    master_key_rotation: Duration,
    time_zone: String,
    write_lock: Mutex<()>,
    quiesce: Arc<AtomicBool>,
    task_tx: mpsc::Sender<ClusterTask>,
}

impl ClusterManager {
    pub async fn new(
        config: &SupervisorConfig,
        addons: Arc<AddonManager>,
        core: Arc<dyn CoreController>,
        quiesce: Arc<AtomicBool>,
    ) -> Result<Arc<Self>> {
        let state_path = config.data_dir.join("cluster.json");
        let mut state = ClusterState::load(&state_path)?;
        if state.node_name.is_empty() {
            state.node_name = config.node_name.clone();
            state.node_slug = slugify(&state.node_name);
            state.save(&state_path)?;
        }

        let registry = NodeRegistry::new();
        registry.load(&state.registered_nodes).await;

        let transport = ClusterTransport::new(
            config.cluster_port,
            Duration::from_secs(config.cluster.request_timeout_secs),
        )?;

        let (task_tx, task_rx) = mpsc::channel(16);
        let manager = Arc::new(Self {
            state: RwLock::new(state),
            state_path,
            registry,
            transport,
            addons,
            core,
            heartbeat_interval: Duration::from_secs(config.cluster.heartbeat_interval_secs),
            master_key_rotation: Duration::from_secs(config.cluster.master_key_rotation_secs),
            time_zone: config.time_zone.clone(),
            write_lock: Mutex::new(()),
            quiesce,
            task_tx,
        });

        let worker = manager.clone();
        tokio::spawn(async move {
            worker.process_tasks(task_rx).await;
        });

        Ok(manager)
    }

    /// Start the periodic feeders: master-key rotation and the slave
    /// heartbeat. Each tick is a message to the single task loop, so
    /// operations never run in parallel with each other.
    pub fn start(self: &Arc<Self>) {
        let tx = self.task_tx.clone();
        let rotation = self.master_key_rotation;
        tokio::spawn(async move {
            let mut interval = time::interval(rotation);
            interval.tick().await; // skip the immediate first tick
            loop {
                interval.tick().await;
                if tx.send(ClusterTask::RotateMasterKey).await.is_err() {
                    break;
                }
            }
        });

        let tx = self.task_tx.clone();
        let heartbeat = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut interval = time::interval(heartbeat);
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx.send(ClusterTask::Heartbeat).await.is_err() {
                    break;
                }
            }
        });
    }

    pub async fn stop(&self) {
        let _ = self.task_tx.send(ClusterTask::Shutdown).await;
    }

    async fn process_tasks(&self, mut task_rx: mpsc::Receiver<ClusterTask>) {
        while let Some(task) = task_rx.recv().await {
            if self.quiesce.load(Ordering::SeqCst) && !matches!(task, ClusterTask::Shutdown) {
                debug!("Background scheduler quiesced, skipping tick");
                continue;
            }
            match task {
                ClusterTask::RotateMasterKey => self.rotate_master_key().await,
                ClusterTask::Heartbeat => {
                    if let Err(e) = self.heartbeat().await {
                        warn!("Heartbeat failed, retrying next tick: {}", e);
                    }
                }
                ClusterTask::Shutdown => break,
            }
        }
    }

    /// Regenerate the rolling session secret used to authenticate new
    /// registrations. In-memory only; registered nodes keep their
    /// individually issued keys.
    async fn rotate_master_key(&self) {
        let mut state = self.state.write().await;
        if !state.is_master {
            return;
        }
        state.master_key = crypto::generate_cluster_key();
        debug!("Rotated master session key");
    }

    /// Slave heartbeat: report status and inventory to the master, adopt
    /// a rotated node key when one comes back.
    async fn heartbeat(&self) -> Result<()> {
        let (master_ip, node_key, node_name) = {
            let state = self.state.read().await;
            if state.is_master {
                return Ok(());
            }
            match (&state.master_ip, &state.node_key) {
                (Some(ip), Some(key)) => (ip.clone(), key.clone(), state.node_name.clone()),
                _ => return Ok(()),
            }
        };

        let addons = self.addons.installed_summaries().await;
        let payload = json!({
            "nonce": Utc::now().timestamp_millis(),
            "version": env!("CARGO_PKG_VERSION"),
            "arch": std::env::consts::ARCH,
            "timezone": self.time_zone,
            "addons": addons,
        });

        let response = self
            .transport
            .post(&master_ip, "/sync", Some(payload), &node_key, Some(&node_name))
            .await?;

        // Key rotation handshake: persist the new key before the next
        // heartbeat can fire.
        if let Some(new_key) = response.get("node_key").and_then(Value::as_str) {
            let mut state = self.state.write().await;
            state.node_key = Some(new_key.to_string());
            state.save(&self.state_path)?;
            info!("Adopted rotated node key from master");
        }
        Ok(())
    }

    /// Master-side registration of a new slave. Re-registration under an
    /// existing slug is always an error; the operator must remove the
    /// stale entry first.
    pub async fn register_node(&self, ip: &str, name: &str) -> Result<(String, Vec<String>)> {
        let _guard = self.write_lock.lock().await;

        let slug = slugify(name);
        if slug.is_empty() {
            return Err(ClusterError::Malformed("empty node name".to_string()).into());
        }
        {
            let state = self.state.read().await;
            if state.registered_nodes.contains_key(&slug) {
                return Err(ClusterError::DuplicateNode(slug).into());
            }
        }

        let key = crypto::generate_cluster_key();
        {
            let mut state = self.state.write().await;
            state.registered_nodes.insert(
                slug.clone(),
                RegisteredNode {
                    name: name.to_string(),
                    key: key.clone(),
                },
            );
            state.save(&self.state_path)?;
        }

        let mut node = ClusterNode::new(slug.clone(), name.to_string(), key.clone());
        node.last_ip = Some(ip.to_string());
        self.registry.add(node).await?;

        info!("Registered cluster node {} from {}", slug, ip);
        Ok((key, self.addons.repositories().await))
    }

    /// Master-side heartbeat handler. Updates liveness and the reported
    /// addon inventory, and with [`KEY_ROTATION_PROBABILITY`] rotates the
    /// node's key, returning the new key for the response.
    pub async fn sync(
        &self,
        slug: &str,
        ip: &str,
        version: &str,
        arch: &str,
        time_zone: &str,
        addons: Vec<AddonSummary>,
    ) -> Result<Option<String>> {
        let _guard = self.write_lock.lock().await;

        let previous = self
            .registry
            .record_sync(
                slug,
                ip.to_string(),
                version.to_string(),
                arch.to_string(),
                time_zone.to_string(),
                addons.clone(),
            )
            .await?;

        for summary in &addons {
            self.addons
                .set_cluster_version(&summary.slug, slug, Some(summary.version.clone()));
        }
        for stale in previous {
            if !addons.iter().any(|a| a.slug == stale) {
                self.addons.set_cluster_version(&stale, slug, None);
            }
        }

        if !rand::rng().random_bool(KEY_ROTATION_PROBABILITY) {
            return Ok(None);
        }

        let new_key = crypto::generate_cluster_key();
        {
            let mut state = self.state.write().await;
            let entry = state
                .registered_nodes
                .get_mut(slug)
                .ok_or_else(|| ClusterError::UnknownNode(slug.to_string()))?;
            entry.key = new_key.clone();
            state.save(&self.state_path)?;
        }
        self.registry.set_key(slug, new_key.clone()).await?;
        debug!("Rotated key for node {}", slug);
        Ok(Some(new_key))
    }

    /// Become the cluster master (or a standalone coordinator of one).
    ///
    /// Returns false when already master. When the transition is
    /// self-initiated (a slave voluntarily leaving), the old master is
    /// notified via `/leave` and the returned bool reports that outcome;
    /// a kick skips the notification.
    pub async fn switch_to_master(&self, is_slave_initiated: bool) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let (old_master_ip, old_node_key, node_name) = {
            let state = self.state.read().await;
            if state.is_master {
                return Ok(false);
            }
            (
                state.master_ip.clone(),
                state.node_key.clone(),
                state.node_name.clone(),
            )
        };

        {
            let mut state = self.state.write().await;
            state.is_master = true;
            state.is_inited = true;
            state.node_key = None;
            state.master_ip = None;
            state.save(&self.state_path)?;
        }
        info!("Switched to cluster master mode");

        if !self.core.is_running().await {
            self.core.start().await?;
        }

        if !is_slave_initiated {
            return Ok(true);
        }

        match (old_master_ip, old_node_key) {
            (Some(ip), Some(key)) => {
                match self
                    .transport
                    .post(&ip, "/leave", None, &key, Some(&node_name))
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(e) => {
                        warn!("Old master did not acknowledge leave: {}", e);
                        Ok(false)
                    }
                }
            }
            _ => Ok(true),
        }
    }

    /// Join another node's cluster as slave. All-or-nothing: if the
    /// registration call fails, no local state changes at all.
    pub async fn switch_to_slave(
        &self,
        master_ip: &str,
        master_key: &str,
        node_name: &str,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        {
            let state = self.state.read().await;
            if state.is_inited && !state.is_master {
                return Ok(false);
            }
        }

        let body = json!({
            "nonce": Utc::now().timestamp_millis(),
            "name": node_name,
        });
        let response = self
            .transport
            .post(master_ip, "/register", Some(body), master_key, Some(node_name))
            .await?;

        let node_key = response
            .get("node_key")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                HearthError::from(ClusterError::Malformed(
                    "registration response missing node_key".to_string(),
                ))
            })?
            .to_string();
        let repositories: Vec<String> = response
            .get("addons_repositories")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        if self.core.is_running().await {
            self.core.stop().await?;
        }

        {
            let mut state = self.state.write().await;
            state.node_name = node_name.to_string();
            state.node_slug = slugify(node_name);
            state.is_master = false;
            state.is_inited = true;
            state.node_key = Some(node_key);
            state.master_ip = Some(master_ip.to_string());
            state.registered_nodes.clear();
            state.save(&self.state_path)?;
        }
        self.registry.load(&BTreeMap::new()).await;

        // Align the addon catalogue with the master's custom repositories
        self.addons.load_repositories(repositories).await?;
        info!("Joined cluster at {} as {}", master_ip, node_name);
        Ok(true)
    }

    /// Drop a node from the membership table. Master-initiated removal
    /// notifies the peer first, best-effort; an unreachable peer never
    /// blocks removal.
    pub async fn remove_node(&self, slug: &str, is_master_initiated: bool) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let node = self
            .registry
            .find(slug)
            .await
            .ok_or_else(|| ClusterError::UnknownNode(slug.to_string()))?;

        if is_master_initiated {
            if let Some(ip) = &node.last_ip {
                if let Err(e) = self.transport.post(ip, "/kick", None, &node.key, None).await {
                    warn!("Node {} unreachable for kick notification: {}", slug, e);
                }
            }
        }

        self.registry.remove(slug).await?;
        {
            let mut state = self.state.write().await;
            state.registered_nodes.remove(slug);
            state.save(&self.state_path)?;
        }
        info!("Removed cluster node {}", slug);
        Ok(())
    }

    /// A slave told us it is leaving on its own.
    pub async fn handle_leave(&self, slug: &str) -> Result<()> {
        self.remove_node(slug, false).await
    }

    /// The master revoked our membership; fall back to running our own
    /// core.
    pub async fn handle_kick(&self) -> Result<bool> {
        self.switch_to_master(false).await
    }

    pub async fn is_master(&self) -> bool {
        self.state.read().await.is_master
    }

    /// Resolve an inbound peer from its presented header token.
    pub async fn resolve_peer(&self, token: &str) -> Option<ClusterNode> {
        self.registry.find_by_token(token).await
    }

    /// Snapshot of the rolling master key used to accept registrations.
    /// None when this node is not a master. Callers verify, decrypt and
    /// seal against this one value so a rotation tick landing mid-request
    /// cannot leave the response sealed under a different key than the
    /// one the request validated against.
    pub async fn registration_key(&self) -> Option<String> {
        let state = self.state.read().await;
        state.is_master.then(|| state.master_key.clone())
    }

    pub async fn master_key(&self) -> String {
        self.state.read().await.master_key.clone()
    }

    /// Slave side: check an inbound token (a master-sent kick) against
    /// our own node key.
    pub async fn verify_own_token(&self, token: &str) -> bool {
        let state = self.state.read().await;
        match &state.node_key {
            Some(key) => crypto::hash_key(key) == token,
            None => false,
        }
    }

    pub async fn own_node_key(&self) -> Option<String> {
        self.state.read().await.node_key.clone()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub async fn info(&self) -> ClusterInfo {
        let state = self.state.read().await;
        let nodes = self.registry.list().await;
        ClusterInfo {
            is_master: state.is_master,
            is_inited: state.is_inited,
            node_name: state.node_name.clone(),
            node_slug: state.node_slug.clone(),
            master_ip: state.master_ip.clone(),
            nodes: nodes
                .into_iter()
                .map(|n| NodeInfo {
                    is_active: n.is_active(self.heartbeat_interval),
                    slug: n.slug,
                    name: n.name,
                    last_ip: n.last_ip,
                    version: n.version,
                    arch: n.arch,
                    last_seen: n.last_seen,
                    addons: n.addons,
                })
                .collect(),
        }
    }
}
