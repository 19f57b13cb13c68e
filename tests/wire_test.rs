//! Two supervisors talking over the real encrypted wire protocol: a
//! master serving the peer router on a loopback port and a slave joining
//! it through `switch_to_slave`.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use hearth_core::addons::{AddonDataStore, AddonManager, NullBackend, NullCore};
use hearth_core::api::{peer::peer_router, ApiContext};
use hearth_core::cluster::ClusterManager;
use hearth_core::config::SupervisorConfig;
use hearth_core::error::{ClusterError, HearthError};
use hearth_core::snapshot::SnapshotManager;

async fn supervisor(dir: &Path, cluster_port: u16) -> Arc<ApiContext> {
    let mut config = SupervisorConfig::default();
    config.data_dir = dir.to_path_buf();
    config.cluster_port = cluster_port;
    config.cluster.request_timeout_secs = 2;

    let store = Arc::new(AddonDataStore::new(dir).unwrap());
    store.reload().await.unwrap();
    let addons = Arc::new(AddonManager::new(store, Arc::new(NullBackend), dir).unwrap());
    let quiesce = Arc::new(AtomicBool::new(false));
    let cluster = ClusterManager::new(
        &config,
        addons.clone(),
        Arc::new(NullCore::default()),
        quiesce.clone(),
    )
    .await
    .unwrap();
    let snapshots = Arc::new(SnapshotManager::new(dir, addons.clone(), quiesce).unwrap());
    Arc::new(ApiContext {
        cluster,
        addons,
        snapshots,
    })
}

/// Serve the peer router on an ephemeral loopback port.
async fn serve_peer(ctx: Arc<ApiContext>) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = peer_router(ctx);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    port
}

#[test_log::test(tokio::test)]
async fn test_slave_joins_master_over_the_wire() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();

    let master = supervisor(master_dir.path(), 1).await;
    master.cluster.switch_to_master(false).await.unwrap();
    let port = serve_peer(master.clone()).await;
    let master_key = master.cluster.master_key().await;

    let slave = supervisor(slave_dir.path(), port).await;
    assert!(slave
        .cluster
        .switch_to_slave("127.0.0.1", &master_key, "Kitchen Pi")
        .await
        .unwrap());

    let info = slave.cluster.info().await;
    assert!(info.is_inited);
    assert!(!info.is_master);
    assert_eq!(info.master_ip.as_deref(), Some("127.0.0.1"));

    let nodes = master.cluster.info().await.nodes;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].slug, "kitchen_pi");

    // Same name again: the master refuses the duplicate registration and
    // the second joiner keeps its standalone state
    let other_dir = tempfile::tempdir().unwrap();
    let other = supervisor(other_dir.path(), port).await;
    let err = other
        .cluster
        .switch_to_slave("127.0.0.1", &master_key, "kitchen pi")
        .await
        .unwrap_err();
    assert!(matches!(err, HearthError::Cluster(_)));
    assert!(!other.cluster.info().await.is_inited);
}

#[test_log::test(tokio::test)]
async fn test_wrong_master_key_is_rejected() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();

    let master = supervisor(master_dir.path(), 1).await;
    master.cluster.switch_to_master(false).await.unwrap();
    let port = serve_peer(master).await;

    let slave = supervisor(slave_dir.path(), port).await;
    let err = slave
        .cluster
        .switch_to_slave("127.0.0.1", "WRONGKEY", "Kitchen Pi")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HearthError::Cluster(ClusterError::AuthFailed)
    ));
    assert!(!slave.cluster.info().await.is_inited);
}

#[test_log::test(tokio::test)]
async fn test_non_master_refuses_registration() {
    let target_dir = tempfile::tempdir().unwrap();
    let joiner_dir = tempfile::tempdir().unwrap();

    // Never promoted to master, so it must not hand out node keys even
    // to a caller presenting its own current session key
    let target = supervisor(target_dir.path(), 1).await;
    let session_key = target.cluster.master_key().await;
    let port = serve_peer(target).await;

    let joiner = supervisor(joiner_dir.path(), port).await;
    let err = joiner
        .cluster
        .switch_to_slave("127.0.0.1", &session_key, "Kitchen Pi")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HearthError::Cluster(ClusterError::AuthFailed)
    ));
    assert!(!joiner.cluster.info().await.is_inited);
}

#[test_log::test(tokio::test)]
async fn test_voluntary_leave_notifies_master() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();

    let master = supervisor(master_dir.path(), 1).await;
    master.cluster.switch_to_master(false).await.unwrap();
    let port = serve_peer(master.clone()).await;
    let master_key = master.cluster.master_key().await;

    let slave = supervisor(slave_dir.path(), port).await;
    slave
        .cluster
        .switch_to_slave("127.0.0.1", &master_key, "Kitchen Pi")
        .await
        .unwrap();
    assert_eq!(master.cluster.info().await.nodes.len(), 1);

    // Leaving flips the slave back to master and drops it from the old
    // master's membership table
    assert!(slave.cluster.switch_to_master(true).await.unwrap());
    assert!(slave.cluster.info().await.is_master);
    assert!(master.cluster.info().await.nodes.is_empty());
}
