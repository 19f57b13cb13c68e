//! Cluster coordination and node membership.
//!
//! One node in a fleet is the master: it owns the authoritative
//! `registered_nodes` table and issues a rotating shared secret to every
//! slave. Slaves heartbeat to the master on a fixed interval; the
//! heartbeat doubles as the key-rotation handshake. There is no quorum or
//! consensus here; the master is a single point of truth by design.

pub mod crypto;
pub mod manager;
pub mod registry;
pub mod state;
pub mod transport;

pub use manager::{ClusterInfo, ClusterManager, NodeInfo, KEY_ROTATION_PROBABILITY};
pub use registry::{AddonSummary, ClusterNode, NodeRegistry};
pub use state::{slugify, ClusterState, RegisteredNode};
pub use transport::ClusterTransport;

/// Header carrying the salted hash of the sender's shared key.
pub const NODE_KEY_HEADER: &str = "X-Node-Key";
/// Header carrying the sender's human-readable node name.
pub const NODE_NAME_HEADER: &str = "X-Node-Name";
