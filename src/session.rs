//! The session tuple that fixes a controller's entire lifetime.

use serde::{Deserialize, Serialize};

use crate::params::Params;

/// Everything that identifies one proof-of-work session.
///
/// A session is fixed at controller construction and shared by all its
/// workers; switching any field requires a full teardown and re-init.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub block_hash: String,
    pub block_height: u64,
    pub public_key: String,
    pub batch_size: usize,
    pub r_target: f64,
    pub fraud_threshold: f64,
    pub params: Params,
}

/// This node's slot in the network-wide nonce partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTopology {
    pub node_id: u32,
    pub node_count: u32,
}

impl Default for NodeTopology {
    fn default() -> Self {
        Self {
            node_id: 0,
            node_count: 1,
        }
    }
}
