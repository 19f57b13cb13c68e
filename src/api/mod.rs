//! Local REST API: thin request/response marshaling over the managers.
//!
//! Every response uses the uniform envelope
//! `{"result": "ok"|"error", "data"|"message"}`.

pub mod peer;

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::addons::AddonManager;
use crate::cluster::ClusterManager;
use crate::error::HearthError;
use crate::snapshot::SnapshotManager;

/// Shared handler state.
pub struct ApiContext {
    pub cluster: Arc<ClusterManager>,
    pub addons: Arc<AddonManager>,
    pub snapshots: Arc<SnapshotManager>,
}

pub fn api_ok(data: impl Serialize) -> Response {
    Json(json!({ "result": "ok", "data": data })).into_response()
}

pub fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "result": "error", "message": message.into() })),
    )
        .into_response()
}

fn error_response(e: HearthError) -> Response {
    api_error(StatusCode::BAD_REQUEST, e.to_string())
}

#[derive(Debug, Deserialize)]
pub struct SwitchToSlaveRequest {
    pub master_ip: String,
    pub master_key: String,
    pub node_name: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterNodeRequest {
    pub ip_address: String,
    pub node_name: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct VersionRequest {
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NewSnapshotRequest {
    pub name: String,
    #[serde(default)]
    pub addons: Vec<String>,
    #[serde(default)]
    pub folders: Vec<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RestoreRequest {
    #[serde(default)]
    pub addons: Vec<String>,
    #[serde(default)]
    pub folders: Vec<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Router for the local control surface.
pub fn local_router(ctx: Arc<ApiContext>) -> Router {
    Router::new()
        .route("/cluster/info", get(cluster_info))
        .route("/cluster/switch_to_master", post(switch_to_master))
        .route("/cluster/switch_to_slave", post(switch_to_slave))
        .route("/cluster/register", post(register_node))
        .route("/cluster/unregister", post(unregister))
        .route("/cluster/{node}/kick", post(kick_node))
        .route("/addons", get(list_addons))
        .route("/addons/reload", post(reload_addons))
        .route("/addons/{slug}", get(get_addon))
        .route("/addons/{slug}/install", post(install_addon))
        .route("/addons/{slug}/uninstall", post(uninstall_addon))
        .route("/addons/{slug}/start", post(start_addon))
        .route("/addons/{slug}/stop", post(stop_addon))
        .route("/addons/{slug}/update", post(update_addon))
        .route("/snapshots", get(list_snapshots))
        .route("/snapshots/new/full", post(snapshot_full))
        .route("/snapshots/new/partial", post(snapshot_partial))
        .route("/snapshots/{slug}/restore/full", post(restore_full))
        .route("/snapshots/{slug}/restore/partial", post(restore_partial))
        .route("/snapshots/{slug}/remove", post(remove_snapshot))
        .with_state(ctx)
}

async fn cluster_info(State(ctx): State<Arc<ApiContext>>) -> Response {
    api_ok(ctx.cluster.info().await)
}

async fn switch_to_master(State(ctx): State<Arc<ApiContext>>) -> Response {
    match ctx.cluster.switch_to_master(true).await {
        Ok(leave_acknowledged) => api_ok(json!({ "leave_acknowledged": leave_acknowledged })),
        Err(e) => error_response(e),
    }
}

async fn switch_to_slave(
    State(ctx): State<Arc<ApiContext>>,
    Json(req): Json<SwitchToSlaveRequest>,
) -> Response {
    match ctx
        .cluster
        .switch_to_slave(&req.master_ip, &req.master_key, &req.node_name)
        .await
    {
        Ok(true) => api_ok(json!({ "master_ip": req.master_ip })),
        Ok(false) => api_error(StatusCode::BAD_REQUEST, "already running as slave"),
        Err(e) => error_response(e),
    }
}

/// Master-side manual registration, mostly for provisioning tooling.
async fn register_node(
    State(ctx): State<Arc<ApiContext>>,
    Json(req): Json<RegisterNodeRequest>,
) -> Response {
    match ctx.cluster.register_node(&req.ip_address, &req.node_name).await {
        Ok((node_key, _)) => api_ok(json!({ "node_key": node_key })),
        Err(e) => error_response(e),
    }
}

/// Leave the cluster this node is currently a slave in.
async fn unregister(State(ctx): State<Arc<ApiContext>>) -> Response {
    match ctx.cluster.switch_to_master(true).await {
        Ok(true) => api_ok(json!({ "left": true })),
        Ok(false) => api_error(StatusCode::BAD_REQUEST, "not part of a cluster"),
        Err(e) => error_response(e),
    }
}

async fn kick_node(State(ctx): State<Arc<ApiContext>>, Path(node): Path<String>) -> Response {
    match ctx.cluster.remove_node(&node, true).await {
        Ok(()) => api_ok(json!({ "removed": node })),
        Err(e) => error_response(e),
    }
}

async fn list_addons(State(ctx): State<Arc<ApiContext>>) -> Response {
    api_ok(ctx.addons.list().await)
}

async fn reload_addons(State(ctx): State<Arc<ApiContext>>) -> Response {
    match ctx.addons.store().reload().await {
        Ok(()) => api_ok(json!({ "addons": ctx.addons.list().await.len() })),
        Err(e) => error_response(e),
    }
}

async fn get_addon(State(ctx): State<Arc<ApiContext>>, Path(slug): Path<String>) -> Response {
    match ctx.addons.get(&slug).await {
        Some(addon) => api_ok(addon),
        None => api_error(StatusCode::NOT_FOUND, format!("Unknown addon: {}", slug)),
    }
}

async fn install_addon(
    State(ctx): State<Arc<ApiContext>>,
    Path(slug): Path<String>,
    Json(req): Json<VersionRequest>,
) -> Response {
    match ctx.addons.install(&slug, req.version.as_deref()).await {
        Ok(()) => api_ok(json!({ "installed": slug })),
        Err(e) => error_response(e),
    }
}

async fn uninstall_addon(State(ctx): State<Arc<ApiContext>>, Path(slug): Path<String>) -> Response {
    match ctx.addons.uninstall(&slug).await {
        Ok(()) => api_ok(json!({ "uninstalled": slug })),
        Err(e) => error_response(e),
    }
}

async fn start_addon(State(ctx): State<Arc<ApiContext>>, Path(slug): Path<String>) -> Response {
    match ctx.addons.start(&slug).await {
        Ok(()) => api_ok(json!({ "started": slug })),
        Err(e) => error_response(e),
    }
}

async fn stop_addon(State(ctx): State<Arc<ApiContext>>, Path(slug): Path<String>) -> Response {
    match ctx.addons.stop(&slug).await {
        Ok(()) => api_ok(json!({ "stopped": slug })),
        Err(e) => error_response(e),
    }
}

async fn update_addon(
    State(ctx): State<Arc<ApiContext>>,
    Path(slug): Path<String>,
    Json(req): Json<VersionRequest>,
) -> Response {
    match ctx.addons.update(&slug, req.version.as_deref()).await {
        Ok(()) => api_ok(json!({ "updated": slug })),
        Err(e) => error_response(e),
    }
}

async fn list_snapshots(State(ctx): State<Arc<ApiContext>>) -> Response {
    api_ok(ctx.snapshots.list().await)
}

async fn snapshot_full(
    State(ctx): State<Arc<ApiContext>>,
    Json(req): Json<NewSnapshotRequest>,
) -> Response {
    match ctx
        .snapshots
        .do_snapshot_full(&req.name, req.password.as_deref())
        .await
    {
        Ok(meta) => api_ok(meta),
        Err(e) => error_response(e),
    }
}

async fn snapshot_partial(
    State(ctx): State<Arc<ApiContext>>,
    Json(req): Json<NewSnapshotRequest>,
) -> Response {
    match ctx
        .snapshots
        .do_snapshot_partial(&req.name, req.addons, req.folders, req.password.as_deref())
        .await
    {
        Ok(meta) => api_ok(meta),
        Err(e) => error_response(e),
    }
}

async fn restore_full(
    State(ctx): State<Arc<ApiContext>>,
    Path(slug): Path<String>,
    Json(req): Json<RestoreRequest>,
) -> Response {
    match ctx
        .snapshots
        .do_restore_full(&slug, req.password.as_deref())
        .await
    {
        Ok(()) => api_ok(json!({ "restored": slug })),
        Err(e) => error_response(e),
    }
}

async fn restore_partial(
    State(ctx): State<Arc<ApiContext>>,
    Path(slug): Path<String>,
    Json(req): Json<RestoreRequest>,
) -> Response {
    match ctx
        .snapshots
        .do_restore_partial(&slug, req.addons, req.folders, req.password.as_deref())
        .await
    {
        Ok(()) => api_ok(json!({ "restored": slug })),
        Err(e) => error_response(e),
    }
}

async fn remove_snapshot(State(ctx): State<Arc<ApiContext>>, Path(slug): Path<String>) -> Response {
    match ctx.snapshots.remove(&slug).await {
        Ok(()) => api_ok(json!({ "removed": slug })),
        Err(e) => error_response(e),
    }
}
