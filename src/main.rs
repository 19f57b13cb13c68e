use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use axum::serve;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

use hearth_core::addons::{AddonDataStore, AddonManager, NullBackend, NullCore};
use hearth_core::api::{local_router, peer::peer_router, ApiContext};
use hearth_core::cluster::ClusterManager;
use hearth_core::config::SupervisorConfig;
use hearth_core::logging;
use hearth_core::snapshot::SnapshotManager;

#[derive(Parser)]
#[command(name = "hearthd", version, about = "Hearth supervisor daemon")]
struct Cli {
    /// Path to the configuration file (defaults to the search path)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor (default)
    Start,
    /// Print the resolved configuration and exit
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SupervisorConfig::load_from_file(path)?,
        None => SupervisorConfig::load()?,
    };

    if let Some(Commands::Info) = cli.command {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let log_dir = if config.logging.dir.is_absolute() {
        config.logging.dir.clone()
    } else {
        config.data_dir.join(&config.logging.dir)
    };
    logging::init(log_dir, &config.logging.level, config.logging.console)
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let store = Arc::new(AddonDataStore::new(&config.data_dir)?);
    store.reload().await?;

    let addons = Arc::new(AddonManager::new(
        store,
        Arc::new(NullBackend),
        &config.data_dir,
    )?);
    let quiesce = Arc::new(AtomicBool::new(false));
    let cluster = ClusterManager::new(
        &config,
        addons.clone(),
        Arc::new(NullCore::default()),
        quiesce.clone(),
    )
    .await?;
    let snapshots = Arc::new(SnapshotManager::new(&config.data_dir, addons.clone(), quiesce)?);

    let ctx = Arc::new(ApiContext {
        cluster: cluster.clone(),
        addons,
        snapshots,
    });

    let local_app = local_router(ctx.clone())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        );
    let local_addr = format!("{}:{}", config.api_host, config.api_port);
    let local_listener = TcpListener::bind(&local_addr)
        .await
        .with_context(|| format!("binding local API to {}", local_addr))?;
    info!("Local API listening on {}", local_addr);
    tokio::spawn(async move {
        if let Err(e) = serve(local_listener, local_app).await {
            tracing::error!("Local API server error: {}", e);
        }
    });

    // Peer endpoints need the remote address to attribute syncs, hence
    // the connect-info service.
    let peer_app = peer_router(ctx).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
    );
    let peer_addr = format!("0.0.0.0:{}", config.cluster_port);
    let peer_listener = TcpListener::bind(&peer_addr)
        .await
        .with_context(|| format!("binding cluster port {}", peer_addr))?;
    info!("Cluster wire protocol listening on {}", peer_addr);
    tokio::spawn(async move {
        if let Err(e) = serve(
            peer_listener,
            peer_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            tracing::error!("Cluster server error: {}", e);
        }
    });

    cluster.start();
    info!("Hearth supervisor {} started", env!("CARGO_PKG_VERSION"));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");
    cluster.stop().await;
    Ok(())
}
