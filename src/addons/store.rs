use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{HearthError, Result};

/// Addon manifest as shipped by a repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddonManifest {
    pub slug: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Filled from the repository the manifest was merged from.
    #[serde(default)]
    pub repository: String,
    /// Default option values.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
    /// Declared option types: field name -> `bool|int|float|str`.
    #[serde(default)]
    pub schema: BTreeMap<String, String>,
}

/// Persisted per-addon install record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstalledAddon {
    pub version: String,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AddonsData {
    #[serde(default)]
    installed: BTreeMap<String, InstalledAddon>,
    #[serde(default)]
    repositories: Vec<String>,
}

/// Merged addon catalogue plus installed-addon bookkeeping.
///
/// Manifests are merged from the built-in repository, the local addons
/// directory and any configured custom repositories; the first repository
/// to claim a slug wins and later claims are logged and dropped. The
/// installed map and the custom repository list are persisted as JSON with
/// the same atomic-save discipline as the cluster state.
#[derive(Debug)]
pub struct AddonDataStore {
    path: PathBuf,
    core_dir: PathBuf,
    local_dir: PathBuf,
    repos_dir: PathBuf,
    manifests: DashMap<String, AddonManifest>,
    data: RwLock<AddonsData>,
    /// Serializes repository refreshes, the way concurrent git pulls are
    /// kept apart.
    reload_lock: Mutex<()>,
}

impl AddonDataStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let addons_dir = data_dir.join("addons");
        let core_dir = addons_dir.join("core");
        let local_dir = addons_dir.join("local");
        let repos_dir = addons_dir.join("git");
        for dir in [&core_dir, &local_dir, &repos_dir] {
            fs::create_dir_all(dir)?;
        }

        let path = addons_dir.join("addons.json");
        let data = load_data(&path)?;

        Ok(Self {
            path,
            core_dir,
            local_dir,
            repos_dir,
            manifests: DashMap::new(),
            data: RwLock::new(data),
            reload_lock: Mutex::new(()),
        })
    }

    /// Re-merge the manifest cache from all repositories.
    pub async fn reload(&self) -> Result<()> {
        let _guard = self.reload_lock.lock().await;

        let mut sources = vec![
            ("core".to_string(), self.core_dir.clone()),
            ("local".to_string(), self.local_dir.clone()),
        ];
        for url in self.data.read().await.repositories.iter() {
            sources.push((url.clone(), self.repos_dir.join(repo_dir_name(url))));
        }

        self.manifests.clear();
        for (repository, dir) in sources {
            for manifest in read_manifests(&dir) {
                if self.manifests.contains_key(&manifest.slug) {
                    warn!(
                        "Addon {} from {} shadows an earlier repository entry, skipping",
                        manifest.slug, repository
                    );
                    continue;
                }
                let mut manifest = manifest;
                manifest.repository = repository.clone();
                self.manifests.insert(manifest.slug.clone(), manifest);
            }
        }

        debug!("Addon catalogue holds {} manifests", self.manifests.len());
        Ok(())
    }

    pub fn manifest(&self, slug: &str) -> Option<AddonManifest> {
        self.manifests.get(slug).map(|m| m.clone())
    }

    pub fn is_known(&self, slug: &str) -> bool {
        self.manifests.contains_key(slug)
    }

    pub fn manifest_slugs(&self) -> Vec<String> {
        let mut slugs: Vec<_> = self.manifests.iter().map(|m| m.key().clone()).collect();
        slugs.sort();
        slugs
    }

    pub async fn installed(&self, slug: &str) -> Option<InstalledAddon> {
        self.data.read().await.installed.get(slug).cloned()
    }

    pub async fn installed_map(&self) -> BTreeMap<String, InstalledAddon> {
        self.data.read().await.installed.clone()
    }

    pub async fn set_installed(&self, slug: &str, record: InstalledAddon) -> Result<()> {
        let mut data = self.data.write().await;
        data.installed.insert(slug.to_string(), record);
        save_data(&self.path, &data)
    }

    pub async fn remove_installed(&self, slug: &str) -> Result<()> {
        let mut data = self.data.write().await;
        data.installed.remove(slug);
        save_data(&self.path, &data)
    }

    pub async fn repositories(&self) -> Vec<String> {
        self.data.read().await.repositories.clone()
    }

    /// Replace the custom repository set (registration payload from the
    /// master, or an operator edit) and re-merge the catalogue.
    pub async fn load_repositories(&self, urls: Vec<String>) -> Result<()> {
        {
            let mut data = self.data.write().await;
            data.repositories = urls;
            save_data(&self.path, &data)?;
        }
        self.reload().await
    }
}

fn load_data(path: &Path) -> Result<AddonsData> {
    if !path.exists() {
        return Ok(AddonsData::default());
    }
    let content = fs::read_to_string(path)?;
    match serde_json::from_str(&content) {
        Ok(data) => Ok(data),
        Err(e) => {
            warn!("Invalid addons file {}: {}; resetting to defaults", path.display(), e);
            let data = AddonsData::default();
            save_data(path, &data)?;
            Ok(data)
        }
    }
}

fn save_data(path: &Path, data: &AddonsData) -> Result<()> {
    let json = serde_json::to_string_pretty(data)?;
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, json)?;
    fs::rename(&temp_path, path)
        .map_err(|e| HearthError::config(format!("Failed to save addons file: {}", e)))?;
    Ok(())
}

fn read_manifests(dir: &Path) -> Vec<AddonManifest> {
    let mut manifests = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return manifests,
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().map(|ext| ext == "json").unwrap_or(false) {
            match fs::read_to_string(&path).map_err(HearthError::from).and_then(|content| {
                serde_json::from_str::<AddonManifest>(&content).map_err(HearthError::from)
            }) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!("Skipping unreadable addon manifest {}: {}", path.display(), e),
            }
        }
    }
    manifests.sort_by(|a, b| a.slug.cmp(&b.slug));
    manifests
}

/// Directory name a repository URL checks out under.
fn repo_dir_name(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .trim_end_matches(".git")
        .to_lowercase()
        .replace(|c: char| !c.is_ascii_alphanumeric(), "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_manifest(dir: &Path, slug: &str, version: &str) {
        let manifest = json!({
            "slug": slug,
            "name": slug,
            "version": version,
            "description": "test addon",
        });
        fs::write(dir.join(format!("{}.json", slug)), manifest.to_string()).unwrap();
    }

    #[tokio::test]
    async fn test_merge_prefers_earlier_repository() {
        let dir = tempfile::tempdir().unwrap();
        let store = AddonDataStore::new(dir.path()).unwrap();

        write_manifest(&store.core_dir, "mqtt_broker", "1.0.0");
        write_manifest(&store.local_dir, "mqtt_broker", "9.9.9");
        write_manifest(&store.local_dir, "node_red", "2.0.0");
        store.reload().await.unwrap();

        assert_eq!(store.manifest("mqtt_broker").unwrap().version, "1.0.0");
        assert_eq!(store.manifest("mqtt_broker").unwrap().repository, "core");
        assert_eq!(store.manifest("node_red").unwrap().repository, "local");
    }

    #[tokio::test]
    async fn test_installed_bookkeeping_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = AddonDataStore::new(dir.path()).unwrap();
            store
                .set_installed(
                    "node_red",
                    InstalledAddon {
                        version: "2.0.0".to_string(),
                        options: serde_json::Map::new(),
                    },
                )
                .await
                .unwrap();
        }

        let store = AddonDataStore::new(dir.path()).unwrap();
        assert_eq!(store.installed("node_red").await.unwrap().version, "2.0.0");
        store.remove_installed("node_red").await.unwrap();
        assert!(store.installed("node_red").await.is_none());
    }

    #[tokio::test]
    async fn test_load_repositories_replaces_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = AddonDataStore::new(dir.path()).unwrap();

        store
            .load_repositories(vec!["https://example.com/addons.git".to_string()])
            .await
            .unwrap();
        assert_eq!(store.repositories().await.len(), 1);

        store.load_repositories(vec![]).await.unwrap();
        assert!(store.repositories().await.is_empty());
    }

    #[test]
    fn test_repo_dir_name() {
        assert_eq!(repo_dir_name("https://example.com/Hearth-Addons.git"), "hearth_addons");
    }
}
