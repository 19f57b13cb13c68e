//! Snapshot (backup) subsystem.
//!
//! Captures addon data and system folders into a staged temporary
//! directory that is sealed into a tar file only on success; any failure
//! drops the staging directory and leaves the backup directory untouched.
//! At most one snapshot or restore runs system-wide, and while one does
//! the background scheduler is quiesced.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, warn};

use crate::addons::{AddonManager, AddonState};
use crate::cluster::crypto;
use crate::error::{HearthError, Result};

/// Plaintext sealed into protected snapshots so a restore can verify the
/// password before touching any data.
const PASSWORD_PROBE: &[u8] = b"hearth-snapshot-v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotType {
    Full,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotAddon {
    pub slug: String,
    pub name: String,
    pub version: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub slug: String,
    pub name: String,
    pub date: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: SnapshotType,
    pub protected: bool,
    pub addons: Vec<SnapshotAddon>,
    pub folders: Vec<String>,
    pub repositories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    probe: Option<String>,
}

/// Held for the duration of one snapshot/restore operation. Dropping it
/// releases the process-wide lock and resumes the background scheduler.
#[derive(Debug)]
pub struct OperationGuard {
    _permit: OwnedMutexGuard<()>,
    quiesce: Arc<AtomicBool>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.quiesce.store(false, Ordering::SeqCst);
    }
}

pub struct SnapshotManager {
    backup_dir: PathBuf,
    config_dir: PathBuf,
    data_dir: PathBuf,
    meta_path: PathBuf,
    addons: Arc<AddonManager>,
    lock: Arc<Mutex<()>>,
    quiesce: Arc<AtomicBool>,
    metas: RwLock<Vec<SnapshotMeta>>,
}

impl SnapshotManager {
    pub fn new(
        data_dir: &Path,
        addons: Arc<AddonManager>,
        quiesce: Arc<AtomicBool>,
    ) -> Result<Self> {
        let backup_dir = data_dir.join("backup");
        let config_dir = data_dir.join("config");
        fs::create_dir_all(&backup_dir)?;
        fs::create_dir_all(&config_dir)?;

        let meta_path = backup_dir.join("snapshots.json");
        let metas = load_metas(&meta_path)?;

        Ok(Self {
            backup_dir,
            config_dir,
            data_dir: data_dir.to_path_buf(),
            meta_path,
            addons,
            lock: Arc::new(Mutex::new(())),
            quiesce,
            metas: RwLock::new(metas),
        })
    }

    /// Acquire the process-wide snapshot lock. Fails immediately when an
    /// operation is already in flight; callers are expected to retry
    /// later, nothing queues.
    pub fn try_begin(&self) -> Result<OperationGuard> {
        let permit = self
            .lock
            .clone()
            .try_lock_owned()
            .map_err(|_| HearthError::snapshot("operation already in progress"))?;
        self.quiesce.store(true, Ordering::SeqCst);
        Ok(OperationGuard {
            _permit: permit,
            quiesce: self.quiesce.clone(),
        })
    }

    pub async fn list(&self) -> Vec<SnapshotMeta> {
        self.metas.read().await.clone()
    }

    pub async fn get(&self, slug: &str) -> Option<SnapshotMeta> {
        self.metas.read().await.iter().find(|m| m.slug == slug).cloned()
    }

    pub async fn remove(&self, slug: &str) -> Result<()> {
        // Deleting a tar out from under a running restore is not allowed
        let _guard = self.try_begin()?;
        let mut metas = self.metas.write().await;
        let before = metas.len();
        metas.retain(|m| m.slug != slug);
        if metas.len() == before {
            return Err(HearthError::snapshot(format!("Unknown snapshot: {}", slug)));
        }
        save_metas(&self.meta_path, &metas)?;
        let tar = self.backup_dir.join(format!("{}.tar.gz", slug));
        if tar.exists() {
            fs::remove_file(tar)?;
        }
        Ok(())
    }

    pub async fn do_snapshot_full(
        &self,
        name: &str,
        password: Option<&str>,
    ) -> Result<SnapshotMeta> {
        let guard = self.try_begin()?;
        let addons = self.addons.installed_slugs().await;
        let folders = vec!["config".to_string()];
        self.snapshot(guard, name, SnapshotType::Full, addons, folders, password)
            .await
    }

    pub async fn do_snapshot_partial(
        &self,
        name: &str,
        addons: Vec<String>,
        folders: Vec<String>,
        password: Option<&str>,
    ) -> Result<SnapshotMeta> {
        let guard = self.try_begin()?;
        self.snapshot(guard, name, SnapshotType::Partial, addons, folders, password)
            .await
    }

    pub async fn do_restore_full(&self, slug: &str, password: Option<&str>) -> Result<()> {
        let guard = self.try_begin()?;
        let meta = self
            .get(slug)
            .await
            .ok_or_else(|| HearthError::snapshot(format!("Unknown snapshot: {}", slug)))?;
        let addons = meta.addons.iter().map(|a| a.slug.clone()).collect();
        let folders = meta.folders.clone();
        self.restore(guard, meta, addons, folders, password).await
    }

    pub async fn do_restore_partial(
        &self,
        slug: &str,
        addons: Vec<String>,
        folders: Vec<String>,
        password: Option<&str>,
    ) -> Result<()> {
        let guard = self.try_begin()?;
        let meta = self
            .get(slug)
            .await
            .ok_or_else(|| HearthError::snapshot(format!("Unknown snapshot: {}", slug)))?;
        self.restore(guard, meta, addons, folders, password).await
    }

    async fn snapshot(
        &self,
        _guard: OperationGuard,
        name: &str,
        kind: SnapshotType,
        addon_slugs: Vec<String>,
        folders: Vec<String>,
        password: Option<&str>,
    ) -> Result<SnapshotMeta> {
        let date = Utc::now();
        let slug = snapshot_slug(name, &date);
        let key = password.map(crypto::derive_snapshot_key);

        // Scoped staging: dropped (removed) on any error path, sealed on
        // success.
        let staging = tempfile::TempDir::new_in(&self.backup_dir)?;
        let addons_dir = staging.path().join("addons");
        fs::create_dir_all(&addons_dir)?;

        let mut meta = SnapshotMeta {
            slug: slug.clone(),
            name: name.to_string(),
            date,
            kind,
            protected: key.is_some(),
            addons: Vec::new(),
            folders: folders.clone(),
            repositories: self.addons.repositories().await,
            probe: match &key {
                Some(k) => Some(crypto::encrypt_bytes(PASSWORD_PROBE, k)?),
                None => None,
            },
        };

        for folder in &folders {
            let src = self.data_dir.join(folder);
            if !src.is_dir() {
                return Err(HearthError::snapshot(format!("Unknown folder: {}", folder)));
            }
            let dest = staging.path().join(folder);
            copy_dir(&src, &dest)?;
        }

        let summaries = self.addons.installed_summaries().await;
        for slug in &addon_slugs {
            let summary = summaries
                .iter()
                .find(|s| &s.slug == slug)
                .ok_or_else(|| HearthError::snapshot(format!("Addon not installed: {}", slug)))?;

            let was_started = matches!(
                self.addons.get(slug).await.map(|a| a.state),
                Some(AddonState::Started)
            );
            if was_started {
                self.addons.stop(slug).await?;
            }

            let capture = self.capture_addon(slug, &addons_dir, key.as_ref()).await;

            if was_started {
                if let Err(e) = self.addons.start(slug).await {
                    warn!("Failed to resume addon {} after capture: {}", slug, e);
                }
            }

            meta.addons.push(SnapshotAddon {
                slug: slug.clone(),
                name: summary.name.clone(),
                version: summary.version.clone(),
                size: capture?,
            });
        }

        fs::write(
            staging.path().join("snapshot.json"),
            serde_json::to_string_pretty(&meta)?,
        )?;

        // Seal: archive the staging directory, then move the finished tar
        // into place so a crash mid-write never leaves a partial file.
        let tar_path = self.backup_dir.join(format!("{}.tar.gz", slug));
        let temp_tar = self.backup_dir.join(format!(".{}.tar.gz.tmp", slug));
        let src = staging.path().to_path_buf();
        let dest = temp_tar.clone();
        tokio::task::spawn_blocking(move || archive_dir(&src, &dest))
            .await
            .map_err(|e| HearthError::internal(format!("archive task failed: {}", e)))??;
        fs::rename(&temp_tar, &tar_path)?;

        {
            let mut metas = self.metas.write().await;
            metas.push(meta.clone());
            save_metas(&self.meta_path, &metas)?;
        }
        info!("Snapshot {} ({}) sealed", meta.slug, meta.name);
        Ok(meta)
    }

    async fn capture_addon(
        &self,
        slug: &str,
        addons_dir: &Path,
        key: Option<&[u8; 32]>,
    ) -> Result<u64> {
        let data = self.addons.data_path(slug);
        if !data.is_dir() {
            return Err(HearthError::snapshot(format!(
                "Addon {} has no data directory",
                slug
            )));
        }

        let archive = addons_dir.join(format!("{}.tar.gz", slug));
        let src = data.clone();
        let dest = archive.clone();
        tokio::task::spawn_blocking(move || archive_dir(&src, &dest))
            .await
            .map_err(|e| HearthError::internal(format!("archive task failed: {}", e)))??;

        if let Some(key) = key {
            let sealed = crypto::encrypt_bytes(&fs::read(&archive)?, key)
                .map_err(HearthError::Cluster)?;
            fs::write(&archive, sealed)?;
        }
        Ok(fs::metadata(&archive)?.len())
    }

    async fn restore(
        &self,
        _guard: OperationGuard,
        meta: SnapshotMeta,
        addon_slugs: Vec<String>,
        folders: Vec<String>,
        password: Option<&str>,
    ) -> Result<()> {
        let key = match (meta.protected, password) {
            (true, Some(password)) => {
                let key = crypto::derive_snapshot_key(password);
                let probe = meta
                    .probe
                    .as_deref()
                    .ok_or_else(|| HearthError::snapshot("snapshot has no password probe"))?;
                let opened = crypto::decrypt_bytes(probe, &key)
                    .map_err(|_| HearthError::snapshot("invalid snapshot password"))?;
                if opened != PASSWORD_PROBE {
                    return Err(HearthError::snapshot("invalid snapshot password"));
                }
                Some(key)
            }
            (true, None) => return Err(HearthError::snapshot("snapshot password required")),
            (false, _) => None,
        };

        let tar_path = self.backup_dir.join(format!("{}.tar.gz", meta.slug));
        if !tar_path.exists() {
            return Err(HearthError::snapshot(format!(
                "Snapshot file missing: {}",
                meta.slug
            )));
        }

        // Unpack into staging first; nothing is applied until the whole
        // archive opened cleanly.
        let staging = tempfile::TempDir::new_in(&self.backup_dir)?;
        let src = tar_path.clone();
        let dest = staging.path().to_path_buf();
        tokio::task::spawn_blocking(move || unpack_archive(&src, &dest))
            .await
            .map_err(|e| HearthError::internal(format!("unpack task failed: {}", e)))??;

        for folder in &folders {
            let src = staging.path().join(folder);
            if !src.is_dir() {
                return Err(HearthError::snapshot(format!(
                    "Snapshot has no folder {}",
                    folder
                )));
            }
            let dest = self.data_dir.join(folder);
            if dest.exists() {
                fs::remove_dir_all(&dest)?;
            }
            copy_dir(&src, &dest)?;
        }

        for slug in &addon_slugs {
            if !self.addons.is_installed(slug).await {
                warn!("Snapshot addon {} is not installed locally, skipping", slug);
                continue;
            }
            let archive = staging.path().join("addons").join(format!("{}.tar.gz", slug));
            if !archive.exists() {
                return Err(HearthError::snapshot(format!(
                    "Snapshot has no data for addon {}",
                    slug
                )));
            }

            if let Some(key) = &key {
                let content = fs::read_to_string(&archive)?;
                let opened = crypto::decrypt_bytes(&content, key)
                    .map_err(|_| HearthError::snapshot("invalid snapshot password"))?;
                fs::write(&archive, opened)?;
            }

            let was_started = matches!(
                self.addons.get(slug).await.map(|a| a.state),
                Some(AddonState::Started)
            );
            self.addons.stop(slug).await.ok();
            let data = self.addons.data_path(slug);
            if data.exists() {
                fs::remove_dir_all(&data)?;
            }
            fs::create_dir_all(&data)?;
            let src = archive.clone();
            tokio::task::spawn_blocking(move || unpack_archive(&src, &data))
                .await
                .map_err(|e| HearthError::internal(format!("unpack task failed: {}", e)))??;

            if was_started {
                if let Err(e) = self.addons.start(slug).await {
                    warn!("Failed to resume addon {} after restore: {}", slug, e);
                }
            }
        }

        if !meta.repositories.is_empty() {
            self.addons.load_repositories(meta.repositories.clone()).await?;
        }
        info!("Restored snapshot {}", meta.slug);
        Ok(())
    }
}

/// Content-derived snapshot identifier: truncated hex SHA-256 of name and
/// timestamp.
fn snapshot_slug(name: &str, date: &DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(date.to_rfc3339().as_bytes());
    hex::encode(hasher.finalize())[..8].to_string()
}

fn load_metas(path: &Path) -> Result<Vec<SnapshotMeta>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    match serde_json::from_str(&content) {
        Ok(metas) => Ok(metas),
        Err(e) => {
            warn!("Invalid snapshots file {}: {}; resetting", path.display(), e);
            let metas = Vec::new();
            save_metas(path, &metas)?;
            Ok(metas)
        }
    }
}

fn save_metas(path: &Path, metas: &[SnapshotMeta]) -> Result<()> {
    let json = serde_json::to_string_pretty(metas)?;
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, json)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

fn archive_dir(src: &Path, dest: &Path) -> Result<()> {
    let file = File::create(dest)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", src)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

fn unpack_archive(src: &Path, dest: &Path) -> Result<()> {
    let file = File::open(src)?;
    let decoder = GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dest)?;
    Ok(())
}

fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
