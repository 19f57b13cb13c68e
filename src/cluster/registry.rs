use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::cluster::crypto;
use crate::cluster::state::RegisteredNode;
use crate::error::ClusterError;

/// Installed-addon summary a peer reports in its heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddonSummary {
    pub slug: String,
    pub name: String,
    pub version: String,
}

/// Runtime view of one known peer. Owned by [`NodeRegistry`]; lookups hand
/// out clones, never references into the shared map.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterNode {
    pub slug: String,
    pub name: String,
    /// Current shared secret for this peer.
    #[serde(skip_serializing)]
    pub key: String,
    /// Salted hash of `key`; this is what the wire actually carries.
    #[serde(skip_serializing)]
    pub hashed_key: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_ip: Option<String>,
    pub version: Option<String>,
    pub arch: Option<String>,
    pub time_zone: Option<String>,
    pub addon_slugs: BTreeSet<String>,
    pub addons: Vec<AddonSummary>,
}

impl ClusterNode {
    pub fn new(slug: String, name: String, key: String) -> Self {
        let hashed_key = crypto::hash_key(&key);
        Self {
            slug,
            name,
            key,
            hashed_key,
            last_seen: None,
            last_ip: None,
            version: None,
            arch: None,
            time_zone: None,
            addon_slugs: BTreeSet::new(),
            addons: Vec::new(),
        }
    }

    pub fn set_key(&mut self, key: String) {
        self.hashed_key = crypto::hash_key(&key);
        self.key = key;
    }

    /// Derived liveness: seen within twice the heartbeat interval.
    pub fn is_active(&self, heartbeat_interval: std::time::Duration) -> bool {
        let window = Duration::from_std(heartbeat_interval * 2)
            .unwrap_or_else(|_| Duration::seconds(60));
        match self.last_seen {
            Some(seen) => Utc::now() - seen < window,
            None => false,
        }
    }
}

/// In-memory membership table, rebuilt from the persisted
/// `registered_nodes` map at startup.
///
/// The registry never persists anything itself; `ClusterManager` owns the
/// persisted state and calls back in here after every accepted mutation so
/// there is a single source of truth.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<String, ClusterNode>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Rebuild all nodes from a persisted map. An empty map (first boot)
    /// is fine.
    pub async fn load(&self, persisted: &BTreeMap<String, RegisteredNode>) {
        let mut nodes = self.nodes.write().await;
        nodes.clear();
        for (slug, entry) in persisted {
            nodes.insert(
                slug.clone(),
                ClusterNode::new(slug.clone(), entry.name.clone(), entry.key.clone()),
            );
        }
    }

    pub async fn find(&self, slug: &str) -> Option<ClusterNode> {
        self.nodes.read().await.get(slug).cloned()
    }

    /// Resolve a node from the presented header token.
    ///
    /// Iterates until a node whose stored key validates against the token.
    /// A peer whose rotation response was lost keeps presenting the stale
    /// token and will not resolve; the only recovery path is re-register.
    pub async fn find_by_token(&self, token: &str) -> Option<ClusterNode> {
        let nodes = self.nodes.read().await;
        nodes.values().find(|n| n.hashed_key == token).cloned()
    }

    pub async fn add(&self, node: ClusterNode) -> Result<(), ClusterError> {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&node.slug) {
            return Err(ClusterError::DuplicateNode(node.slug));
        }
        nodes.insert(node.slug.clone(), node);
        Ok(())
    }

    pub async fn remove(&self, slug: &str) -> Result<(), ClusterError> {
        let mut nodes = self.nodes.write().await;
        if nodes.remove(slug).is_none() {
            return Err(ClusterError::UnknownNode(slug.to_string()));
        }
        Ok(())
    }

    /// Rotate a node's shared secret in memory.
    pub async fn set_key(&self, slug: &str, key: String) -> Result<(), ClusterError> {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(slug) {
            Some(node) => {
                node.set_key(key);
                Ok(())
            }
            None => Err(ClusterError::UnknownNode(slug.to_string())),
        }
    }

    /// Record a heartbeat: liveness fields plus the reported addon
    /// inventory. Returns the addon slugs the node reported previously so
    /// the caller can clear stale attributions.
    pub async fn record_sync(
        &self,
        slug: &str,
        ip: String,
        version: String,
        arch: String,
        time_zone: String,
        addons: Vec<AddonSummary>,
    ) -> Result<BTreeSet<String>, ClusterError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(slug)
            .ok_or_else(|| ClusterError::UnknownNode(slug.to_string()))?;

        let previous = std::mem::take(&mut node.addon_slugs);
        node.last_seen = Some(Utc::now());
        node.last_ip = Some(ip);
        node.version = Some(version);
        node.arch = Some(arch);
        node.time_zone = Some(time_zone);
        node.addon_slugs = addons.iter().map(|a| a.slug.clone()).collect();
        node.addons = addons;
        Ok(previous)
    }

    pub async fn list(&self) -> Vec<ClusterNode> {
        let nodes = self.nodes.read().await;
        let mut list: Vec<_> = nodes.values().cloned().collect();
        list.sort_by(|a, b| a.slug.cmp(&b.slug));
        list
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn node(slug: &str, key: &str) -> ClusterNode {
        ClusterNode::new(slug.to_string(), slug.to_string(), key.to_string())
    }

    #[tokio::test]
    async fn test_add_and_duplicate() {
        let registry = NodeRegistry::new();
        registry.add(node("kitchen_pi", "KEY00001")).await.unwrap();

        let err = registry.add(node("kitchen_pi", "KEY00002")).await.unwrap_err();
        assert!(matches!(err, ClusterError::DuplicateNode(_)));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_find_by_token() {
        let registry = NodeRegistry::new();
        registry.add(node("kitchen_pi", "KEY00001")).await.unwrap();

        let token = crypto::hash_key("KEY00001");
        let found = registry.find_by_token(&token).await.unwrap();
        assert_eq!(found.slug, "kitchen_pi");

        assert!(registry.find_by_token(&crypto::hash_key("WRONG")).await.is_none());
    }

    #[tokio::test]
    async fn test_key_rotation_invalidates_old_token() {
        let registry = NodeRegistry::new();
        registry.add(node("kitchen_pi", "KEY00001")).await.unwrap();
        registry.set_key("kitchen_pi", "KEY00002".to_string()).await.unwrap();

        assert!(registry.find_by_token(&crypto::hash_key("KEY00001")).await.is_none());
        assert!(registry.find_by_token(&crypto::hash_key("KEY00002")).await.is_some());
    }

    #[tokio::test]
    async fn test_liveness_window() {
        let interval = StdDuration::from_secs(30);
        let mut n = node("kitchen_pi", "KEY00001");
        assert!(!n.is_active(interval));

        n.last_seen = Some(Utc::now());
        assert!(n.is_active(interval));

        n.last_seen = Some(Utc::now() - Duration::seconds(61));
        assert!(!n.is_active(interval));
    }

    #[tokio::test]
    async fn test_record_sync_returns_previous_inventory() {
        let registry = NodeRegistry::new();
        registry.add(node("kitchen_pi", "KEY00001")).await.unwrap();

        let report = vec![AddonSummary {
            slug: "mqtt_broker".to_string(),
            name: "MQTT Broker".to_string(),
            version: "1.2.0".to_string(),
        }];
        let previous = registry
            .record_sync(
                "kitchen_pi",
                "10.0.0.5".to_string(),
                "0.1.0".to_string(),
                "aarch64".to_string(),
                "UTC".to_string(),
                report,
            )
            .await
            .unwrap();
        assert!(previous.is_empty());

        let previous = registry
            .record_sync(
                "kitchen_pi",
                "10.0.0.5".to_string(),
                "0.1.0".to_string(),
                "aarch64".to_string(),
                "UTC".to_string(),
                vec![],
            )
            .await
            .unwrap();
        assert!(previous.contains("mqtt_broker"));
    }
}
