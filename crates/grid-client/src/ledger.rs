//! Ledger (blockchain) interface for node contracts and balances.

use async_trait::async_trait;
use grid_core::{Contract, ContractId, Identity, NodeId};

use crate::error::LedgerError;

/// The authoritative record of which contracts exist.
///
/// Every call is a synchronous chain round trip from the caller's point of
/// view. Writes are signed by `identity`.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Open a node contract for a deployment with challenge hash `hash`.
    async fn create_node_contract(
        &self,
        identity: &dyn Identity,
        node_id: NodeId,
        metadata: &str,
        hash: &str,
        public_ips: u32,
        solution_provider: Option<u64>,
    ) -> Result<ContractId, LedgerError>;

    /// Point an existing contract at a new deployment hash.
    async fn update_node_contract(
        &self,
        identity: &dyn Identity,
        contract_id: ContractId,
        metadata: &str,
        hash: &str,
    ) -> Result<ContractId, LedgerError>;

    async fn cancel_contract(
        &self,
        identity: &dyn Identity,
        contract_id: ContractId,
    ) -> Result<(), LedgerError>;

    async fn get_contract(&self, contract_id: ContractId) -> Result<Contract, LedgerError>;

    /// Free balance of the account behind `identity`.
    async fn get_balance(&self, identity: &dyn Identity) -> Result<u64, LedgerError>;
}
