//! Deployer error types.

use std::collections::BTreeMap;
use std::time::Duration;

use grid_client::{LedgerError, RpcError};
use grid_core::{
    Capacity, ContractId, Deployment, FarmId, NodeId, ResultState, SigningError, ValidationError,
};
use thiserror::Error;

/// Errors produced while reconciling deployments.
#[derive(Debug, Error)]
pub enum DeployerError {
    #[error("node {node}: invalid deployment: {source}")]
    Invalid {
        node: NodeId,
        #[source]
        source: ValidationError,
    },

    #[error("node {node}: failed to sign deployment: {source}")]
    Signing {
        node: NodeId,
        #[source]
        source: SigningError,
    },

    #[error("node {node}: failed to hash deployment: {source}")]
    Encoding {
        node: NodeId,
        #[source]
        source: serde_json::Error,
    },

    #[error("node {node}: failed to {action} node contract: {source}")]
    Ledger {
        node: NodeId,
        action: &'static str,
        #[source]
        source: LedgerError,
    },

    #[error("failed to cancel contract {contract_id}: {source}")]
    Cancel {
        contract_id: ContractId,
        #[source]
        source: LedgerError,
    },

    #[error("node {node}: {method} for contract {contract_id} failed: {source}")]
    Rpc {
        node: NodeId,
        contract_id: ContractId,
        method: &'static str,
        #[source]
        source: RpcError,
    },

    #[error("node {node}: {method} for contract {contract_id} timed out after {timeout:?}")]
    Timeout {
        node: NodeId,
        contract_id: ContractId,
        method: &'static str,
        timeout: Duration,
    },

    #[error("node {node}: deployment rejected, contract {contract_id} was canceled: {source}")]
    Rejected {
        node: NodeId,
        contract_id: ContractId,
        #[source]
        source: Box<DeployerError>,
    },

    #[error(
        "node {node}: deployment rejected ({source}) and canceling its contract failed ({cancel}), \
         you must cancel it manually (contract id {contract_id})"
    )]
    DanglingContract {
        node: NodeId,
        contract_id: ContractId,
        #[source]
        source: Box<DeployerError>,
        cancel: LedgerError,
    },

    #[error(
        "node {node}: workload {workload:?} of deployment {contract_id} is in state {state}: {message}"
    )]
    WorkloadFailed {
        node: NodeId,
        contract_id: ContractId,
        workload: String,
        state: ResultState,
        message: String,
    },

    #[error(
        "node {node}: deployment {contract_id} made no progress for {window:?} ({ok}/{total} workloads ok)"
    )]
    Stalled {
        node: NodeId,
        contract_id: ContractId,
        window: Duration,
        ok: usize,
        total: usize,
    },

    #[error("node {node}: deployment {contract_id} did not converge within {budget:?}")]
    DeadlineExceeded {
        node: NodeId,
        contract_id: ContractId,
        budget: Duration,
    },

    #[error(transparent)]
    Feasibility(#[from] FeasibilityError),

    #[error("failed to read account balance: {0}")]
    Balance(#[source] LedgerError),

    #[error("balance {balance} is below the required minimum of {required}")]
    InsufficientBalance { balance: u64, required: u64 },

    #[error("{original}; could not revert: the previous deployments could not be fetched")]
    RevertUnavailable { original: Box<DeployerError> },

    #[error("failed to revert deployments: {revert}; original error: {original}")]
    RevertFailed {
        original: Box<DeployerError>,
        revert: Box<DeployerError>,
    },
}

impl DeployerError {
    /// Node the error refers to, when it refers to a single one.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            DeployerError::Invalid { node, .. }
            | DeployerError::Signing { node, .. }
            | DeployerError::Encoding { node, .. }
            | DeployerError::Ledger { node, .. }
            | DeployerError::Rpc { node, .. }
            | DeployerError::Timeout { node, .. }
            | DeployerError::Rejected { node, .. }
            | DeployerError::DanglingContract { node, .. }
            | DeployerError::WorkloadFailed { node, .. }
            | DeployerError::Stalled { node, .. }
            | DeployerError::DeadlineExceeded { node, .. } => Some(*node),
            _ => None,
        }
    }
}

pub type DeployerResult<T> = Result<T, DeployerError>;

/// Some nodes could not be fetched. Successful fetches are kept.
#[derive(Debug, Error)]
#[error("failed to fetch deployments from {}", describe_failures(.failures))]
pub struct FetchError {
    pub fetched: BTreeMap<NodeId, Deployment>,
    pub failures: BTreeMap<NodeId, RpcError>,
}

fn describe_failures(failures: &BTreeMap<NodeId, RpcError>) -> String {
    failures
        .iter()
        .map(|(node, err)| format!("node {node} ({err})"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A pre-flight check found the desired state cannot fit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeasibilityError {
    #[error("farm {farm_id} doesn't have enough public ips: {missing} more needed")]
    NotEnoughPublicIps { farm_id: FarmId, missing: u32 },

    #[error(
        "node {node}: not possible to increase public ips of contract {contract_id} from {reserved} to {requested}"
    )]
    PublicIpIncrease {
        node: NodeId,
        contract_id: ContractId,
        reserved: u32,
        requested: u32,
    },

    #[error("node {node} can't host a fqdn gateway: it has no public ipv4")]
    NoPublicIpv4 { node: NodeId },

    #[error("node {node} can't host a name gateway: it has no domain")]
    NoDomain { node: NodeId },

    #[error("node {node} doesn't have enough resources. needed: {needed}, free: {free}")]
    InsufficientCapacity {
        node: NodeId,
        needed: Capacity,
        free: Capacity,
    },
}
