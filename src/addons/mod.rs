//! Add-on data model and installation state machine.
//!
//! The actual container engine is out of scope; everything that touches it
//! goes through the narrow [`ContainerBackend`] trait so the lifecycle
//! logic stays testable without a daemon socket.

pub mod store;

pub use store::{AddonDataStore, AddonManifest, InstalledAddon};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cluster::registry::AddonSummary;
use crate::error::{HearthError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddonState {
    NotInstalled,
    Installing,
    Installed,
    Starting,
    Started,
    Stopped,
    Updating,
    Uninstalling,
}

/// API view of one addon: manifest plus runtime and cluster bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct Addon {
    pub slug: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub repository: String,
    pub state: AddonState,
    pub version_installed: Option<String>,
    pub is_installed: bool,
    /// Last peer observed running this addon: `(peer_slug, version)`.
    /// Display state only; last writer via sync wins, no merge is
    /// attempted.
    pub cluster_version: Option<(String, Option<String>)>,
}

/// Container lifecycle collaborator (the Docker wrapper in production).
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    async fn install(&self, slug: &str, version: &str) -> Result<()>;
    async fn uninstall(&self, slug: &str) -> Result<()>;
    async fn start(&self, slug: &str) -> Result<()>;
    async fn stop(&self, slug: &str) -> Result<()>;
    async fn update(&self, slug: &str, version: &str) -> Result<()>;
}

/// Core application container control (started when a node becomes
/// master, stopped when it joins a cluster as slave).
#[async_trait]
pub trait CoreController: Send + Sync {
    async fn is_running(&self) -> bool;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

/// Backend that only logs; used for dry runs and tests.
#[derive(Debug, Default)]
pub struct NullBackend;

#[async_trait]
impl ContainerBackend for NullBackend {
    async fn install(&self, slug: &str, version: &str) -> Result<()> {
        info!("container install {} ({})", slug, version);
        Ok(())
    }

    async fn uninstall(&self, slug: &str) -> Result<()> {
        info!("container uninstall {}", slug);
        Ok(())
    }

    async fn start(&self, slug: &str) -> Result<()> {
        info!("container start {}", slug);
        Ok(())
    }

    async fn stop(&self, slug: &str) -> Result<()> {
        info!("container stop {}", slug);
        Ok(())
    }

    async fn update(&self, slug: &str, version: &str) -> Result<()> {
        info!("container update {} -> {}", slug, version);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NullCore {
    running: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl CoreController for NullCore {
    async fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn start(&self) -> Result<()> {
        self.running.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct AddonRuntime {
    state: Option<AddonState>,
    cluster_version: Option<(String, Option<String>)>,
}

/// Installation and lifecycle manager for all addons.
pub struct AddonManager {
    store: Arc<AddonDataStore>,
    backend: Arc<dyn ContainerBackend>,
    data_dir: PathBuf,
    runtime: DashMap<String, AddonRuntime>,
}

impl AddonManager {
    pub fn new(
        store: Arc<AddonDataStore>,
        backend: Arc<dyn ContainerBackend>,
        data_dir: &Path,
    ) -> Result<Self> {
        let data_dir = data_dir.join("addons").join("data");
        fs::create_dir_all(&data_dir)?;
        Ok(Self {
            store,
            backend,
            data_dir,
            runtime: DashMap::new(),
        })
    }

    pub fn store(&self) -> &Arc<AddonDataStore> {
        &self.store
    }

    pub fn data_path(&self, slug: &str) -> PathBuf {
        self.data_dir.join(slug)
    }

    pub fn is_known(&self, slug: &str) -> bool {
        self.store.is_known(slug)
    }

    pub async fn is_installed(&self, slug: &str) -> bool {
        self.store.installed(slug).await.is_some()
    }

    pub async fn get(&self, slug: &str) -> Option<Addon> {
        let manifest = self.store.manifest(slug)?;
        let installed = self.store.installed(slug).await;
        let runtime = self.runtime.get(slug).map(|r| r.clone()).unwrap_or_default();

        let state = runtime.state.unwrap_or(if installed.is_some() {
            AddonState::Installed
        } else {
            AddonState::NotInstalled
        });

        Some(Addon {
            slug: manifest.slug,
            name: manifest.name,
            version: manifest.version,
            description: manifest.description,
            repository: manifest.repository,
            state,
            version_installed: installed.as_ref().map(|i| i.version.clone()),
            is_installed: installed.is_some(),
            cluster_version: runtime.cluster_version,
        })
    }

    pub async fn list(&self) -> Vec<Addon> {
        let mut addons = Vec::new();
        for slug in self.store.manifest_slugs() {
            if let Some(addon) = self.get(&slug).await {
                addons.push(addon);
            }
        }
        addons
    }

    /// Install an addon. Partial failure leaves no persisted record: the
    /// addon stays `NotInstalled` if the container pull fails.
    pub async fn install(&self, slug: &str, version: Option<&str>) -> Result<()> {
        let manifest = self
            .store
            .manifest(slug)
            .ok_or_else(|| HearthError::addon(format!("Unknown addon: {}", slug)))?;
        if self.store.installed(slug).await.is_some() {
            return Err(HearthError::addon(format!("Addon already installed: {}", slug)));
        }

        let target = version.unwrap_or(&manifest.version).to_string();
        self.set_state(slug, AddonState::Installing);
        fs::create_dir_all(self.data_path(slug))?;

        if let Err(e) = self.backend.install(slug, &target).await {
            self.set_state(slug, AddonState::NotInstalled);
            return Err(e);
        }

        self.store
            .set_installed(
                slug,
                InstalledAddon {
                    version: target,
                    options: serde_json::Map::new(),
                },
            )
            .await?;
        self.set_state(slug, AddonState::Installed);
        info!("Installed addon {}", slug);
        Ok(())
    }

    /// Uninstall an addon. The install record and data directory are only
    /// cleared after the container backend confirms removal.
    pub async fn uninstall(&self, slug: &str) -> Result<()> {
        if self.store.installed(slug).await.is_none() {
            return Err(HearthError::addon(format!("Addon not installed: {}", slug)));
        }

        self.set_state(slug, AddonState::Uninstalling);
        if let Err(e) = self.backend.uninstall(slug).await {
            self.set_state(slug, AddonState::Installed);
            return Err(e);
        }

        self.store.remove_installed(slug).await?;
        let data = self.data_path(slug);
        if data.exists() {
            fs::remove_dir_all(&data)?;
        }
        self.set_state(slug, AddonState::NotInstalled);
        info!("Uninstalled addon {}", slug);
        Ok(())
    }

    /// Start an addon: write the merged, schema-validated options file,
    /// then delegate to the container backend. Validation failure refuses
    /// the start.
    pub async fn start(&self, slug: &str) -> Result<()> {
        let manifest = self
            .store
            .manifest(slug)
            .ok_or_else(|| HearthError::addon(format!("Unknown addon: {}", slug)))?;
        let installed = self
            .store
            .installed(slug)
            .await
            .ok_or_else(|| HearthError::addon(format!("Addon not installed: {}", slug)))?;

        let merged = merge_options(&manifest.options, &installed.options);
        validate_options(slug, &manifest.schema, &merged)?;

        let options_path = self.data_path(slug).join("options.json");
        fs::create_dir_all(self.data_path(slug))?;
        fs::write(&options_path, serde_json::to_string_pretty(&merged)?)?;

        self.set_state(slug, AddonState::Starting);
        match self.backend.start(slug).await {
            Ok(()) => {
                self.set_state(slug, AddonState::Started);
                Ok(())
            }
            Err(e) => {
                self.set_state(slug, AddonState::Stopped);
                Err(e)
            }
        }
    }

    pub async fn stop(&self, slug: &str) -> Result<()> {
        if self.store.installed(slug).await.is_none() {
            return Err(HearthError::addon(format!("Addon not installed: {}", slug)));
        }
        self.backend.stop(slug).await?;
        self.set_state(slug, AddonState::Stopped);
        Ok(())
    }

    /// Update to a target version (latest known when not given); the
    /// backend is expected to pull the new image and swap atomically.
    pub async fn update(&self, slug: &str, version: Option<&str>) -> Result<()> {
        let manifest = self
            .store
            .manifest(slug)
            .ok_or_else(|| HearthError::addon(format!("Unknown addon: {}", slug)))?;
        let installed = self
            .store
            .installed(slug)
            .await
            .ok_or_else(|| HearthError::addon(format!("Addon not installed: {}", slug)))?;

        let target = version.unwrap_or(&manifest.version).to_string();
        self.set_state(slug, AddonState::Updating);
        if let Err(e) = self.backend.update(slug, &target).await {
            self.set_state(slug, AddonState::Installed);
            return Err(e);
        }

        self.store
            .set_installed(
                slug,
                InstalledAddon {
                    version: target,
                    options: installed.options,
                },
            )
            .await?;
        self.set_state(slug, AddonState::Installed);
        Ok(())
    }

    /// Locally installed inventory for heartbeat payloads.
    pub async fn installed_summaries(&self) -> Vec<AddonSummary> {
        let mut summaries = Vec::new();
        for (slug, record) in self.store.installed_map().await {
            let name = self
                .store
                .manifest(&slug)
                .map(|m| m.name)
                .unwrap_or_else(|| slug.clone());
            summaries.push(AddonSummary {
                slug,
                name,
                version: record.version,
            });
        }
        summaries
    }

    pub async fn installed_slugs(&self) -> Vec<String> {
        self.store.installed_map().await.keys().cloned().collect()
    }

    /// Record (or clear, with `version = None`) the peer attribution for
    /// an addon. Skips unknown slugs with a warning; peers never create
    /// local addon records.
    pub fn set_cluster_version(&self, slug: &str, peer: &str, version: Option<String>) {
        if !self.store.is_known(slug) {
            warn!("Peer {} reports unknown addon {}, skipping", peer, slug);
            return;
        }
        self.runtime.entry(slug.to_string()).or_default().cluster_version =
            Some((peer.to_string(), version));
    }

    pub async fn load_repositories(&self, urls: Vec<String>) -> Result<()> {
        self.store.load_repositories(urls).await
    }

    pub async fn repositories(&self) -> Vec<String> {
        self.store.repositories().await
    }

    fn set_state(&self, slug: &str, state: AddonState) {
        self.runtime.entry(slug.to_string()).or_default().state = Some(state);
    }
}

fn merge_options(
    defaults: &serde_json::Map<String, serde_json::Value>,
    user: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    let mut merged = defaults.clone();
    for (key, value) in user {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

fn validate_options(
    slug: &str,
    schema: &BTreeMap<String, String>,
    options: &serde_json::Map<String, serde_json::Value>,
) -> Result<()> {
    for key in options.keys() {
        if !schema.contains_key(key) {
            return Err(HearthError::addon(format!(
                "Addon {}: option {} is not in the schema",
                slug, key
            )));
        }
    }
    for (key, kind) in schema {
        let value = options.get(key).ok_or_else(|| {
            HearthError::addon(format!("Addon {}: missing option {}", slug, key))
        })?;
        let ok = match kind.as_str() {
            "bool" => value.is_boolean(),
            "int" => value.is_i64() || value.is_u64(),
            "float" => value.is_number(),
            "str" => value.is_string(),
            other => {
                return Err(HearthError::addon(format!(
                    "Addon {}: unknown schema type {} for {}",
                    slug, other, key
                )))
            }
        };
        if !ok {
            return Err(HearthError::addon(format!(
                "Addon {}: option {} does not match declared type {}",
                slug, key, kind
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Backend whose install/start calls can be made to fail.
    #[derive(Default)]
    struct FlakyBackend {
        fail_install: AtomicBool,
    }

    #[async_trait]
    impl ContainerBackend for FlakyBackend {
        async fn install(&self, _slug: &str, _version: &str) -> Result<()> {
            if self.fail_install.load(Ordering::SeqCst) {
                return Err(HearthError::addon("image pull failed"));
            }
            Ok(())
        }

        async fn uninstall(&self, _slug: &str) -> Result<()> {
            Ok(())
        }

        async fn start(&self, _slug: &str) -> Result<()> {
            Ok(())
        }

        async fn stop(&self, _slug: &str) -> Result<()> {
            Ok(())
        }

        async fn update(&self, _slug: &str, _version: &str) -> Result<()> {
            Ok(())
        }
    }

    async fn manager_with_addon(
        dir: &Path,
        backend: Arc<dyn ContainerBackend>,
        schema: serde_json::Value,
        options: serde_json::Value,
    ) -> AddonManager {
        let store = Arc::new(AddonDataStore::new(dir).unwrap());
        let manifest = json!({
            "slug": "mqtt_broker",
            "name": "MQTT Broker",
            "version": "1.2.0",
            "description": "test addon",
            "options": options,
            "schema": schema,
        });
        fs::write(
            dir.join("addons/local/mqtt_broker.json"),
            manifest.to_string(),
        )
        .unwrap();
        store.reload().await.unwrap();
        AddonManager::new(store, backend, dir).unwrap()
    }

    #[tokio::test]
    async fn test_install_uninstall_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            manager_with_addon(dir.path(), Arc::new(NullBackend), json!({}), json!({})).await;

        manager.install("mqtt_broker", None).await.unwrap();
        assert!(manager.is_installed("mqtt_broker").await);
        assert!(manager.data_path("mqtt_broker").exists());

        let err = manager.install("mqtt_broker", None).await.unwrap_err();
        assert!(err.to_string().contains("already installed"));

        manager.uninstall("mqtt_broker").await.unwrap();
        assert!(!manager.is_installed("mqtt_broker").await);
        assert!(!manager.data_path("mqtt_broker").exists());
    }

    #[tokio::test]
    async fn test_failed_install_leaves_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FlakyBackend::default());
        backend.fail_install.store(true, Ordering::SeqCst);
        let manager =
            manager_with_addon(dir.path(), backend.clone(), json!({}), json!({})).await;

        assert!(manager.install("mqtt_broker", None).await.is_err());
        assert!(!manager.is_installed("mqtt_broker").await);
        assert_eq!(
            manager.get("mqtt_broker").await.unwrap().state,
            AddonState::NotInstalled
        );
    }

    #[tokio::test]
    async fn test_start_validates_options() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_addon(
            dir.path(),
            Arc::new(NullBackend),
            json!({"port": "int", "ssl": "bool"}),
            json!({"port": 1883, "ssl": false}),
        )
        .await;
        manager.install("mqtt_broker", None).await.unwrap();

        manager.start("mqtt_broker").await.unwrap();
        assert_eq!(
            manager.get("mqtt_broker").await.unwrap().state,
            AddonState::Started
        );

        // A bad override must refuse the start
        manager
            .store
            .set_installed(
                "mqtt_broker",
                InstalledAddon {
                    version: "1.2.0".to_string(),
                    options: json!({"port": "not a number"})
                        .as_object()
                        .unwrap()
                        .clone(),
                },
            )
            .await
            .unwrap();
        let err = manager.start("mqtt_broker").await.unwrap_err();
        assert!(err.to_string().contains("does not match declared type"));
    }

    #[tokio::test]
    async fn test_update_bumps_installed_version() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            manager_with_addon(dir.path(), Arc::new(NullBackend), json!({}), json!({})).await;
        manager.install("mqtt_broker", Some("1.0.0")).await.unwrap();

        manager.update("mqtt_broker", None).await.unwrap();
        assert_eq!(
            manager.get("mqtt_broker").await.unwrap().version_installed,
            Some("1.2.0".to_string())
        );
    }

    #[tokio::test]
    async fn test_cluster_version_skips_unknown_slug() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            manager_with_addon(dir.path(), Arc::new(NullBackend), json!({}), json!({})).await;

        manager.set_cluster_version("foo_bar", "kitchen_pi", Some("1.0".to_string()));
        assert!(manager.get("foo_bar").await.is_none());

        manager.set_cluster_version("mqtt_broker", "kitchen_pi", Some("1.0".to_string()));
        assert_eq!(
            manager.get("mqtt_broker").await.unwrap().cluster_version,
            Some(("kitchen_pi".to_string(), Some("1.0".to_string())))
        );
    }
}
