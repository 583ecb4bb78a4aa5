//! grid-core — shared types for grid deployments.
//!
//! Workloads, deployments and contracts as the ledger and the nodes see
//! them, plus the hashing and signing that bind a deployment to its
//! contract, and the `grid.toml` configuration consumed by the engine.

pub mod config;
pub mod contract;
pub mod deployment;
pub mod error;
pub mod identity;
pub mod types;
pub mod workload;

pub use config::{DeployerConfig, GridConfig, NetworkConfig, PollConfig, parse_duration};
pub use contract::{Contract, ContractState};
pub use deployment::{Deployment, Signature, SignatureRequest, SignatureRequirement};
pub use error::{ConfigError, SigningError, ValidationError};
pub use identity::{Ed25519Identity, Identity};
pub use types::{Capacity, ContractId, FarmId, GIB, MIB, NodeId, TwinId};
pub use workload::{ResultState, Workload, WorkloadData, WorkloadResult, WorkloadType};
