//! Mesh planning errors.

use grid_client::{InventoryError, RpcError};
use grid_core::{ConfigError, NodeId};
use ipnet::Ipv4Net;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network ip range {0} must be a /16")]
    InvalidRange(Ipv4Net),

    #[error("no free /24 left in {0}")]
    SubnetsExhausted(Ipv4Net),

    #[error("no wireguard port available on node {node}")]
    NoFreePort { node: NodeId },

    #[error("a relay is required but none is available: {reason}")]
    NoRelay { reason: String },

    #[error("node {node}: {source}")]
    Rpc {
        node: NodeId,
        #[source]
        source: RpcError,
    },

    #[error("relay discovery failed: {0}")]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid wireguard key: {0}")]
    InvalidKey(String),

    #[error("node {node}: network workload {name:?} is inconsistent: {reason}")]
    Inconsistent {
        node: NodeId,
        name: String,
        reason: String,
    },
}

pub type NetworkResult<T> = Result<T, NetworkError>;
