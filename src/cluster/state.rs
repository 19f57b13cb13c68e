use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cluster::crypto;
use crate::error::{HearthError, Result};

/// Persisted membership entry on the master side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisteredNode {
    pub name: String,
    pub key: String,
}

/// Persisted cluster state for this node.
///
/// Exactly one of the two shapes is meaningful at a time: the master holds
/// `registered_nodes`, a slave holds `node_key` + `master_ip`. The
/// `master_key` is a rolling session secret; it is deliberately not
/// serialized and is regenerated on every boot and on the rotation tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterState {
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub node_slug: String,
    #[serde(skip, default = "crypto::generate_cluster_key")]
    pub master_key: String,
    #[serde(default)]
    pub node_key: Option<String>,
    #[serde(default)]
    pub master_ip: Option<String>,
    #[serde(default)]
    pub registered_nodes: BTreeMap<String, RegisteredNode>,
    #[serde(default)]
    pub is_master: bool,
    #[serde(default)]
    pub is_inited: bool,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            node_slug: String::new(),
            master_key: crypto::generate_cluster_key(),
            node_key: None,
            master_ip: None,
            registered_nodes: BTreeMap::new(),
            is_master: false,
            is_inited: false,
        }
    }
}

/// Derive a filesystem/URL-safe slug from a human-readable node name.
pub fn slugify(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

impl ClusterState {
    /// Load the persisted state, tolerating a missing file (first boot).
    /// A file that fails to parse is logged, replaced with defaults and
    /// rewritten so the next boot is clean.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        match serde_json::from_str::<ClusterState>(&content) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!("Invalid cluster state file {}: {}; resetting to defaults", path.display(), e);
                let state = Self::default();
                state.save(path)?;
                Ok(state)
            }
        }
    }

    /// Persist atomically (tmp + rename). Called after every mutation,
    /// before the mutating operation returns, so in-memory and on-disk
    /// state never diverge across an await point within one operation.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, path)
            .map_err(|e| HearthError::config(format!("Failed to save cluster state: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Kitchen Pi"), "kitchen_pi");
        assert_eq!(slugify("  Living Room Hub "), "living_room_hub");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let state = ClusterState::load(&dir.path().join("cluster.json")).unwrap();
        assert!(!state.is_master);
        assert!(state.registered_nodes.is_empty());
        assert_eq!(state.master_key.len(), 8);
    }

    #[test]
    fn test_roundtrip_without_master_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");

        let mut state = ClusterState::default();
        state.node_name = "Kitchen Pi".to_string();
        state.node_slug = slugify(&state.node_name);
        state.is_master = true;
        state.registered_nodes.insert(
            "hall_pi".to_string(),
            RegisteredNode {
                name: "Hall Pi".to_string(),
                key: "ABCD1234".to_string(),
            },
        );
        state.save(&path).unwrap();

        let reloaded = ClusterState::load(&path).unwrap();
        assert_eq!(reloaded.node_slug, "kitchen_pi");
        assert_eq!(reloaded.registered_nodes.len(), 1);
        // Rolling session secret is regenerated, not restored
        assert_ne!(reloaded.master_key, state.master_key);
    }

    #[test]
    fn test_corrupt_file_is_reset_and_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        fs::write(&path, "{not json").unwrap();

        let state = ClusterState::load(&path).unwrap();
        assert!(!state.is_inited);

        // The file on disk is valid again
        let reloaded = ClusterState::load(&path).unwrap();
        assert!(!reloaded.is_inited);
    }
}
