//! Node RPC: a generic transport plus a typed client on top of it.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use grid_core::{ContractId, Deployment, NodeId, Workload};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::RpcError;
use crate::types::PublicConfig;

pub const DEPLOYMENT_DEPLOY: &str = "deployment.deploy";
pub const DEPLOYMENT_UPDATE: &str = "deployment.update";
pub const DEPLOYMENT_GET: &str = "deployment.get";
pub const DEPLOYMENT_CHANGES: &str = "deployment.changes";
pub const NETWORK_LIST_WG_PORTS: &str = "network.list_wg_ports";
pub const NETWORK_PUBLIC_CONFIG: &str = "network.public_config";
pub const NETWORK_INTERFACES: &str = "network.interfaces";

/// Calls a named method on a node and returns its JSON result.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn call(&self, node: NodeId, method: &str, payload: Value) -> Result<Value, RpcError>;
}

/// Payload addressing a deployment by its contract.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContractRef {
    pub contract_id: ContractId,
}

/// Typed view of one node's RPC surface.
#[derive(Clone)]
pub struct NodeClient {
    node: NodeId,
    transport: Arc<dyn NodeTransport>,
}

impl NodeClient {
    pub fn new(node: NodeId, transport: Arc<dyn NodeTransport>) -> Self {
        Self { node, transport }
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, payload: Value) -> Result<T, RpcError> {
        let value = self.transport.call(self.node, method, payload).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn deployment_deploy(&self, deployment: &Deployment) -> Result<(), RpcError> {
        self.call(DEPLOYMENT_DEPLOY, serde_json::to_value(deployment)?)
            .await
    }

    pub async fn deployment_update(&self, deployment: &Deployment) -> Result<(), RpcError> {
        self.call(DEPLOYMENT_UPDATE, serde_json::to_value(deployment)?)
            .await
    }

    pub async fn deployment_get(&self, contract_id: ContractId) -> Result<Deployment, RpcError> {
        self.call(DEPLOYMENT_GET, json!(ContractRef { contract_id }))
            .await
    }

    /// Workloads of the deployment with their latest reported results.
    pub async fn deployment_changes(
        &self,
        contract_id: ContractId,
    ) -> Result<Vec<Workload>, RpcError> {
        self.call(DEPLOYMENT_CHANGES, json!(ContractRef { contract_id }))
            .await
    }

    /// Wireguard listen ports already taken on the node.
    pub async fn network_list_wg_ports(&self) -> Result<Vec<u16>, RpcError> {
        self.call(NETWORK_LIST_WG_PORTS, Value::Null).await
    }

    pub async fn network_public_config(&self) -> Result<PublicConfig, RpcError> {
        self.call(NETWORK_PUBLIC_CONFIG, Value::Null).await
    }

    /// Addresses per interface name.
    pub async fn network_interfaces(&self) -> Result<BTreeMap<String, Vec<IpAddr>>, RpcError> {
        self.call(NETWORK_INTERFACES, Value::Null).await
    }
}

impl std::fmt::Debug for NodeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeClient").field("node", &self.node).finish()
    }
}
