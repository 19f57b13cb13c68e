use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::cluster::crypto;
use crate::cluster::{NODE_KEY_HEADER, NODE_NAME_HEADER};
use crate::error::{ClusterError, HearthError};

/// One authenticated request/response cycle to a peer's cluster endpoint.
///
/// Outgoing bodies are sealed with the shared per-node key; the salted key
/// hash rides along as the header token so the receiver can resolve the
/// sender without ever seeing the raw key. Failures never mutate any
/// state; the caller decides whether an error is fatal to its operation.
#[derive(Debug, Clone)]
pub struct ClusterTransport {
    client: Client,
    cluster_port: u16,
}

impl ClusterTransport {
    pub fn new(cluster_port: u16, timeout: Duration) -> Result<Self, HearthError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HearthError::internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, cluster_port })
    }

    /// POST to `http://{ip}:{cluster_port}/cluster{path}`.
    ///
    /// An empty body defaults to a nonce-only payload. The response body is
    /// opened with the same key and returned parsed.
    pub async fn post(
        &self,
        ip: &str,
        path: &str,
        body: Option<Value>,
        key: &str,
        node_name: Option<&str>,
    ) -> Result<Value, ClusterError> {
        let url = format!("http://{}:{}/cluster{}", ip, self.cluster_port, path);
        let body = body.unwrap_or_else(|| json!({ "nonce": Utc::now().timestamp_millis() }));
        let sealed = crypto::encrypt_json(&body, key)?;

        debug!("Cluster request to {}", url);
        let mut request = self
            .client
            .post(&url)
            .header(NODE_KEY_HEADER, crypto::hash_key(key))
            .json(&json!({ "data": sealed }));
        if let Some(name) = node_name {
            request = request.header(NODE_NAME_HEADER, name);
        }

        let response = request.send().await.map_err(map_send_error)?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ClusterError::AuthFailed);
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| ClusterError::Malformed(format!("response is not JSON: {}", e)))?;

        if !status.is_success() {
            let message = envelope
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(ClusterError::Connect(format!("HTTP {}: {}", status, message)));
        }

        let sealed = envelope
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| ClusterError::Malformed("response missing data field".to_string()))?;
        crypto::decrypt_json(sealed, key)
    }
}

fn map_send_error(e: reqwest::Error) -> ClusterError {
    if e.is_timeout() {
        ClusterError::Timeout
    } else {
        ClusterError::Connect(e.to_string())
    }
}
