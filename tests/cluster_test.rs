//! End-to-end tests for cluster membership through the public
//! `ClusterManager` API, against a real persisted state directory.

use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use hearth_core::addons::{AddonDataStore, AddonManager, NullBackend, NullCore};
use hearth_core::cluster::{crypto, AddonSummary, ClusterManager};
use hearth_core::config::SupervisorConfig;
use hearth_core::error::{ClusterError, HearthError};

async fn manager(dir: &Path) -> (Arc<ClusterManager>, Arc<AddonManager>) {
    let mut config = SupervisorConfig::default();
    config.data_dir = dir.to_path_buf();
    // Port 1 is never listening; peer notifications fail fast
    config.cluster_port = 1;
    config.cluster.request_timeout_secs = 1;

    let store = Arc::new(AddonDataStore::new(dir).unwrap());
    store.reload().await.unwrap();
    let addons = Arc::new(AddonManager::new(store, Arc::new(NullBackend), dir).unwrap());
    let cluster = ClusterManager::new(
        &config,
        addons.clone(),
        Arc::new(NullCore::default()),
        Arc::new(AtomicBool::new(false)),
    )
    .await
    .unwrap();
    (cluster, addons)
}

#[tokio::test]
async fn test_register_persists_and_rejects_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let (cluster, _) = manager(dir.path()).await;

    let (key, repositories) = cluster.register_node("10.0.0.5", "Kitchen Pi").await.unwrap();
    assert_eq!(key.len(), 8);
    assert!(repositories.is_empty());

    // The issued key survives a restart via the persisted state file
    let persisted = fs::read_to_string(dir.path().join("cluster.json")).unwrap();
    assert!(persisted.contains("kitchen_pi"));
    assert!(persisted.contains(&key));

    let err = cluster.register_node("10.0.0.6", "kitchen PI").await.unwrap_err();
    assert!(matches!(
        err,
        HearthError::Cluster(ClusterError::DuplicateNode(_))
    ));
    assert_eq!(cluster.info().await.nodes.len(), 1);
}

#[tokio::test]
async fn test_sync_unknown_node_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (cluster, _) = manager(dir.path()).await;

    let err = cluster
        .sync("ghost", "10.0.0.9", "0.1.0", "x86_64", "UTC", vec![])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HearthError::Cluster(ClusterError::UnknownNode(_))
    ));
}

#[tokio::test]
async fn test_sync_updates_liveness_and_inventory() {
    let dir = tempfile::tempdir().unwrap();
    let (cluster, addons) = manager(dir.path()).await;
    cluster.register_node("10.0.0.5", "Kitchen Pi").await.unwrap();

    let report = vec![AddonSummary {
        slug: "ghost_addon".to_string(),
        name: "Ghost".to_string(),
        version: "1.0.0".to_string(),
    }];
    cluster
        .sync("kitchen_pi", "10.0.0.5", "0.1.0", "aarch64", "UTC", report)
        .await
        .unwrap();

    let info = cluster.info().await;
    let node = &info.nodes[0];
    assert!(node.is_active);
    assert_eq!(node.version.as_deref(), Some("0.1.0"));
    assert_eq!(node.addons.len(), 1);

    // A peer reporting an addon we do not know must not create a record
    assert!(addons.get("ghost_addon").await.is_none());
}

#[tokio::test]
async fn test_key_rotation_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (cluster, _) = manager(dir.path()).await;
    let (key, _) = cluster.register_node("10.0.0.5", "Kitchen Pi").await.unwrap();
    let old_token = crypto::hash_key(&key);

    // Rotation is probabilistic per sync; 500 attempts without one is
    // beyond astronomically unlikely
    let mut rotated = None;
    for _ in 0..500 {
        if let Some(new_key) = cluster
            .sync("kitchen_pi", "10.0.0.5", "0.1.0", "x86_64", "UTC", vec![])
            .await
            .unwrap()
        {
            rotated = Some(new_key);
            break;
        }
    }
    let new_key = rotated.expect("no rotation in 500 heartbeats");
    assert_ne!(new_key, key);

    // Old token is dead, new one resolves, and the rotation is persisted
    assert!(cluster.resolve_peer(&old_token).await.is_none());
    let node = cluster.resolve_peer(&crypto::hash_key(&new_key)).await.unwrap();
    assert_eq!(node.slug, "kitchen_pi");
    let persisted = fs::read_to_string(dir.path().join("cluster.json")).unwrap();
    assert!(persisted.contains(&new_key));
    assert!(!persisted.contains(&key));
}

#[tokio::test]
async fn test_switch_to_slave_failure_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (cluster, _) = manager(dir.path()).await;
    cluster.register_node("10.0.0.5", "Hall Pi").await.unwrap();

    // Nothing listens on the configured port, so registration must fail
    let err = cluster
        .switch_to_slave("127.0.0.1", "ABCD1234", "Kitchen Pi")
        .await
        .unwrap_err();
    assert!(matches!(err, HearthError::Cluster(ref e) if e.is_retryable()));

    let info = cluster.info().await;
    assert!(!info.is_inited);
    assert!(info.master_ip.is_none());
    assert_eq!(info.nodes.len(), 1);
}

#[tokio::test]
async fn test_remove_node_clears_membership() {
    let dir = tempfile::tempdir().unwrap();
    let (cluster, _) = manager(dir.path()).await;
    let (key, _) = cluster.register_node("10.0.0.5", "Hall Pi").await.unwrap();

    cluster.remove_node("hall_pi", false).await.unwrap();
    assert!(cluster.info().await.nodes.is_empty());
    assert!(cluster.resolve_peer(&crypto::hash_key(&key)).await.is_none());
    let persisted = fs::read_to_string(dir.path().join("cluster.json")).unwrap();
    assert!(!persisted.contains("hall_pi"));

    let err = cluster.remove_node("hall_pi", false).await.unwrap_err();
    assert!(matches!(
        err,
        HearthError::Cluster(ClusterError::UnknownNode(_))
    ));
}

#[tokio::test]
async fn test_kick_removes_even_when_peer_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let (cluster, _) = manager(dir.path()).await;
    cluster.register_node("10.0.0.5", "Hall Pi").await.unwrap();
    cluster
        .sync("hall_pi", "127.0.0.1", "0.1.0", "x86_64", "UTC", vec![])
        .await
        .unwrap();

    // Master-initiated removal notifies best-effort; the dead peer must
    // not block it
    cluster.remove_node("hall_pi", true).await.unwrap();
    assert!(cluster.info().await.nodes.is_empty());
}

#[tokio::test]
async fn test_handle_kick_falls_back_to_master() {
    let dir = tempfile::tempdir().unwrap();
    let (cluster, _) = manager(dir.path()).await;
    assert!(!cluster.is_master().await);

    assert!(cluster.handle_kick().await.unwrap());
    let info = cluster.info().await;
    assert!(info.is_master);
    assert!(info.is_inited);

    // Already master: a second transition is a no-op
    assert!(!cluster.switch_to_master(false).await.unwrap());
}
