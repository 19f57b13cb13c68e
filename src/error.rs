use thiserror::Error;

/// Failure modes of the cluster protocol.
///
/// Transport and crypto layers return these instead of collapsing every
/// failure into a sentinel, so callers can tell "retry next tick" apart
/// from "permanently rejected".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("node already registered: {0}")]
    DuplicateNode(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),
}

impl ClusterError {
    /// True for failures that are expected to clear on a later attempt,
    /// as opposed to rejections that need operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::Timeout | ClusterError::Connect(_))
    }
}

#[derive(Debug, Error)]
pub enum HearthError {
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("addon error: {0}")]
    Addon(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, HearthError>;

impl HearthError {
    pub fn config(msg: impl Into<String>) -> Self {
        HearthError::Config(msg.into())
    }

    pub fn addon(msg: impl Into<String>) -> Self {
        HearthError::Addon(msg.into())
    }

    pub fn snapshot(msg: impl Into<String>) -> Self {
        HearthError::Snapshot(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        HearthError::Internal(msg.into())
    }
}

impl From<&str> for HearthError {
    fn from(s: &str) -> Self {
        HearthError::Internal(s.to_string())
    }
}

impl From<String> for HearthError {
    fn from(s: String) -> Self {
        HearthError::Internal(s)
    }
}
