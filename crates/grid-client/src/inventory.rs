//! Read-only inventory / discovery service.

use async_trait::async_trait;
use grid_core::NodeId;

use crate::error::InventoryError;
use crate::types::{Farm, FarmFilter, NodeInfo};

#[async_trait]
pub trait InventoryClient: Send + Sync {
    async fn node(&self, node_id: NodeId) -> Result<NodeInfo, InventoryError>;

    async fn farms(&self, filter: &FarmFilter) -> Result<Vec<Farm>, InventoryError>;

    /// A node with a public IPv4 configuration that is not in `exclude`.
    async fn pick_public_node(&self, exclude: &[NodeId]) -> Result<NodeId, InventoryError>;
}
