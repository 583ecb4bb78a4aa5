//! Ledger-side view of node contracts.

use serde::{Deserialize, Serialize};

use crate::types::{ContractId, NodeId, TwinId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractState {
    #[default]
    Created,
    GracePeriod,
    Deleted,
}

/// A node contract: the billing record a deployment lives under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub contract_id: ContractId,
    pub node_id: NodeId,
    pub twin_id: TwinId,
    /// Hex challenge hash of the deployment the contract currently covers.
    pub deployment_hash: String,
    #[serde(default)]
    pub deployment_data: String,
    /// Public IPv4 addresses reserved at creation. Updates cannot raise it.
    pub public_ips: u32,
    #[serde(default)]
    pub state: ContractState,
    #[serde(default)]
    pub solution_provider: Option<u64>,
}

impl Contract {
    pub fn is_active(&self) -> bool {
        self.state != ContractState::Deleted
    }
}
