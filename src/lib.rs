pub mod addons;
pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod logging;
pub mod snapshot;

// Re-export common types
pub use addons::AddonManager;
pub use cluster::ClusterManager;
pub use config::SupervisorConfig;
pub use error::{ClusterError, HearthError};
pub use snapshot::SnapshotManager;
