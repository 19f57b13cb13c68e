//! Public cluster wire endpoints, served on the cluster port.
//!
//! Request bodies and responses are sealed with the per-node shared key;
//! the `X-Node-Key` header token resolves the sender. Any request without
//! a resolvable node gets the same generic authentication error, no
//! matter whether the key expired, rotated away or never existed.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::warn;

use super::{api_error, ApiContext};
use crate::cluster::{crypto, AddonSummary, NODE_KEY_HEADER};

pub fn peer_router(ctx: Arc<ApiContext>) -> Router {
    Router::new()
        .route("/cluster/register", post(register))
        .route("/cluster/sync", post(sync))
        .route("/cluster/leave", post(leave))
        .route("/cluster/kick", post(kick))
        .with_state(ctx)
}

fn auth_error() -> Response {
    api_error(StatusCode::UNAUTHORIZED, "authentication failed")
}

fn header_token(headers: &HeaderMap) -> Option<&str> {
    headers.get(NODE_KEY_HEADER)?.to_str().ok()
}

fn sealed_body(body: &Value) -> Option<&str> {
    body.get("data")?.as_str()
}

fn seal_response(payload: &Value, key: &str) -> Response {
    match crypto::encrypt_json(payload, key) {
        Ok(sealed) => Json(json!({ "data": sealed })).into_response(),
        Err(e) => {
            warn!("Failed to seal cluster response: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// Bootstrap registration: authenticated with the master's current
/// rolling session key.
async fn register(
    State(ctx): State<Arc<ApiContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let token = match header_token(&headers) {
        Some(token) => token,
        None => return auth_error(),
    };
    // One key snapshot for the whole request: token check, body, and
    // response all use the same rotation generation
    let master_key = match ctx.cluster.registration_key().await {
        Some(key) => key,
        None => return auth_error(),
    };
    if crypto::hash_key(&master_key) != token {
        return auth_error();
    }

    let inner = match sealed_body(&body).map(|s| crypto::decrypt_json(s, &master_key)) {
        Some(Ok(inner)) => inner,
        _ => return auth_error(),
    };
    let name = match inner.get("name").and_then(Value::as_str) {
        Some(name) => name,
        None => return api_error(StatusCode::BAD_REQUEST, "missing node name"),
    };

    match ctx.cluster.register_node(&addr.ip().to_string(), name).await {
        Ok((node_key, repositories)) => seal_response(
            &json!({
                "node_key": node_key,
                "addons_repositories": repositories,
            }),
            &master_key,
        ),
        Err(e) => api_error(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// Heartbeat: liveness, inventory, and the rotation handshake.
async fn sync(
    State(ctx): State<Arc<ApiContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let node = match header_token(&headers) {
        Some(token) => match ctx.cluster.resolve_peer(token).await {
            Some(node) => node,
            None => return auth_error(),
        },
        None => return auth_error(),
    };

    let inner = match sealed_body(&body).map(|s| crypto::decrypt_json(s, &node.key)) {
        Some(Ok(inner)) => inner,
        _ => return auth_error(),
    };

    let version = inner.get("version").and_then(Value::as_str).unwrap_or("");
    let arch = inner.get("arch").and_then(Value::as_str).unwrap_or("");
    let time_zone = inner.get("timezone").and_then(Value::as_str).unwrap_or("");
    let addons: Vec<AddonSummary> = match inner.get("addons") {
        Some(value) => match serde_json::from_value(value.clone()) {
            Ok(addons) => addons,
            Err(_) => return api_error(StatusCode::BAD_REQUEST, "malformed addon inventory"),
        },
        None => Vec::new(),
    };

    match ctx
        .cluster
        .sync(&node.slug, &addr.ip().to_string(), version, arch, time_zone, addons)
        .await
    {
        Ok(rotated) => {
            let mut payload = json!({ "result": true });
            if let Some(new_key) = rotated {
                payload["node_key"] = Value::String(new_key);
            }
            // Sealed with the pre-rotation key the peer still holds
            seal_response(&payload, &node.key)
        }
        Err(e) => api_error(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// A slave announces its voluntary departure.
async fn leave(
    State(ctx): State<Arc<ApiContext>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let node = match header_token(&headers) {
        Some(token) => match ctx.cluster.resolve_peer(token).await {
            Some(node) => node,
            None => return auth_error(),
        },
        None => return auth_error(),
    };

    if !matches!(
        sealed_body(&body).map(|s| crypto::decrypt_json(s, &node.key)),
        Some(Ok(_))
    ) {
        return auth_error();
    }

    match ctx.cluster.handle_leave(&node.slug).await {
        Ok(()) => seal_response(&json!({ "result": true }), &node.key),
        Err(e) => api_error(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// The master revokes this node's membership.
async fn kick(
    State(ctx): State<Arc<ApiContext>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let token = match header_token(&headers) {
        Some(token) => token,
        None => return auth_error(),
    };
    if !ctx.cluster.verify_own_token(token).await {
        return auth_error();
    }
    let key = match ctx.cluster.own_node_key().await {
        Some(key) => key,
        None => return auth_error(),
    };

    if !matches!(
        sealed_body(&body).map(|s| crypto::decrypt_json(s, &key)),
        Some(Ok(_))
    ) {
        return auth_error();
    }

    match ctx.cluster.handle_kick().await {
        Ok(_) => seal_response(&json!({ "result": true }), &key),
        Err(e) => api_error(StatusCode::BAD_REQUEST, e.to_string()),
    }
}
