//! Errors reported by the ledger, node RPC and inventory collaborators.

use grid_core::{ContractId, FarmId, NodeId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("contract {0} not found")]
    ContractNotFound(ContractId),

    #[error("ledger rejected the call: {0}")]
    Rejected(String),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

impl LedgerError {
    /// Whether the contract is already gone. Cancellation paths treat this
    /// as success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LedgerError::ContractNotFound(_))
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("node {node} is unreachable")]
    Unreachable { node: NodeId },

    #[error("node {node}: {method} timed out")]
    Timeout { node: NodeId, method: String },

    #[error("node {node}: {what} not found")]
    NotFound { node: NodeId, what: String },

    #[error("node {node}: {method} failed: {message}")]
    Remote {
        node: NodeId,
        method: String,
        message: String,
    },

    #[error("node {node}: unknown method {method}")]
    UnknownMethod { node: NodeId, method: String },

    #[error("malformed rpc payload: {0}")]
    Codec(#[from] serde_json::Error),
}

impl RpcError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RpcError::NotFound { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InventoryError {
    #[error("node {0} not found in inventory")]
    NodeNotFound(NodeId),

    #[error("farm {0} not found in inventory")]
    FarmNotFound(FarmId),

    #[error("no public node available")]
    NoPublicNode,

    #[error("inventory unavailable: {0}")]
    Unavailable(String),
}
