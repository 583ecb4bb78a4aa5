//! grid-client — the collaborators a grid deployment talks to.
//!
//! - [`LedgerClient`]: node contracts and account balance on the chain.
//! - [`NodeTransport`]: named RPC calls to a node, wrapped by [`NodeClient`].
//! - [`InventoryClient`]: read-only node/farm discovery.
//!
//! [`memory`] provides in-process implementations of all three.

pub mod error;
pub mod inventory;
pub mod ledger;
pub mod memory;
pub mod node;
pub mod types;

pub use error::{InventoryError, LedgerError, RpcError};
pub use inventory::InventoryClient;
pub use ledger::LedgerClient;
pub use memory::{MemoryInventory, MemoryLedger, MemoryNodes, Provisioning};
pub use node::{NodeClient, NodeTransport};
pub use types::{Farm, FarmFilter, FarmPublicIp, NodeInfo, PublicConfig};
