//! In-process ledger, node fleet and inventory.
//!
//! These implement the same traits as the real backends and keep all state
//! in memory. Faults are injected per node or per contract: unreachable
//! nodes, rejected submissions, workloads that never converge or fail,
//! ledger rejections and unavailable services.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use grid_core::{
    Contract, ContractId, ContractState, Deployment, FarmId, Identity, NodeId, ResultState,
    TwinId, WorkloadData,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{InventoryError, LedgerError, RpcError};
use crate::inventory::InventoryClient;
use crate::ledger::LedgerClient;
use crate::node::{self, ContractRef, NodeTransport};
use crate::types::{Farm, FarmFilter, NodeInfo, PublicConfig};

// ── Ledger ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct LedgerState {
    next_id: ContractId,
    contracts: BTreeMap<ContractId, Contract>,
    preset_ids: BTreeMap<NodeId, VecDeque<ContractId>>,
    reject_creates: BTreeSet<NodeId>,
    failing_cancels: BTreeSet<ContractId>,
    vanishing: BTreeSet<ContractId>,
    unavailable: bool,
    balance: u64,
    creates: usize,
    updates: usize,
    canceled: Vec<ContractId>,
}

/// A ledger owned by a single twin.
#[derive(Debug)]
pub struct MemoryLedger {
    twin_id: TwinId,
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new(twin_id: TwinId) -> Self {
        Self {
            twin_id,
            state: Mutex::new(LedgerState {
                next_id: 1,
                balance: 1_000_000,
                ..LedgerState::default()
            }),
        }
    }

    pub fn with_balance(mut self, balance: u64) -> Self {
        self.state.get_mut().balance = balance;
        self
    }

    /// The next contract created for `node_id` gets `contract_id`.
    pub fn with_contract_id(mut self, node_id: NodeId, contract_id: ContractId) -> Self {
        self.state
            .get_mut()
            .preset_ids
            .entry(node_id)
            .or_default()
            .push_back(contract_id);
        self
    }

    pub fn with_rejected_creates(mut self, node_id: NodeId) -> Self {
        self.state.get_mut().reject_creates.insert(node_id);
        self
    }

    pub async fn fail_cancel(&self, contract_id: ContractId) {
        self.state.lock().await.failing_cancels.insert(contract_id);
    }

    /// Make `contract_id` disappear right before it is canceled, so the
    /// cancel reports it as not found.
    pub async fn vanish_before_cancel(&self, contract_id: ContractId) {
        self.state.lock().await.vanishing.insert(contract_id);
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Seed an existing contract.
    pub async fn insert_contract(&self, contract: Contract) {
        let mut state = self.state.lock().await;
        state.next_id = state.next_id.max(contract.contract_id + 1);
        state.contracts.insert(contract.contract_id, contract);
    }

    pub async fn contract(&self, contract_id: ContractId) -> Option<Contract> {
        self.state.lock().await.contracts.get(&contract_id).cloned()
    }

    /// Contracts not yet canceled.
    pub async fn active_contracts(&self) -> Vec<Contract> {
        self.state
            .lock()
            .await
            .contracts
            .values()
            .filter(|c| c.is_active())
            .cloned()
            .collect()
    }

    pub async fn canceled(&self) -> Vec<ContractId> {
        self.state.lock().await.canceled.clone()
    }

    pub async fn create_count(&self) -> usize {
        self.state.lock().await.creates
    }

    pub async fn update_count(&self) -> usize {
        self.state.lock().await.updates
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn create_node_contract(
        &self,
        _identity: &dyn Identity,
        node_id: NodeId,
        metadata: &str,
        hash: &str,
        public_ips: u32,
        solution_provider: Option<u64>,
    ) -> Result<ContractId, LedgerError> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(LedgerError::Unavailable("ledger offline".to_string()));
        }
        if state.reject_creates.contains(&node_id) {
            return Err(LedgerError::Rejected(format!(
                "node {node_id} does not accept contracts"
            )));
        }

        let preset = state
            .preset_ids
            .get_mut(&node_id)
            .and_then(VecDeque::pop_front);
        let contract_id = match preset {
            Some(id) => id,
            None => {
                let mut id = state.next_id;
                while state.contracts.contains_key(&id) {
                    id += 1;
                }
                id
            }
        };
        state.next_id = state.next_id.max(contract_id + 1);
        state.creates += 1;
        state.contracts.insert(
            contract_id,
            Contract {
                contract_id,
                node_id,
                twin_id: self.twin_id,
                deployment_hash: hash.to_string(),
                deployment_data: metadata.to_string(),
                public_ips,
                state: ContractState::Created,
                solution_provider,
            },
        );
        debug!(contract_id, node_id, "memory ledger: contract created");
        Ok(contract_id)
    }

    async fn update_node_contract(
        &self,
        _identity: &dyn Identity,
        contract_id: ContractId,
        metadata: &str,
        hash: &str,
    ) -> Result<ContractId, LedgerError> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(LedgerError::Unavailable("ledger offline".to_string()));
        }
        let contract = state
            .contracts
            .get_mut(&contract_id)
            .filter(|c| c.is_active())
            .ok_or(LedgerError::ContractNotFound(contract_id))?;
        contract.deployment_hash = hash.to_string();
        contract.deployment_data = metadata.to_string();
        state.updates += 1;
        Ok(contract_id)
    }

    async fn cancel_contract(
        &self,
        _identity: &dyn Identity,
        contract_id: ContractId,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(LedgerError::Unavailable("ledger offline".to_string()));
        }
        if state.failing_cancels.contains(&contract_id) {
            return Err(LedgerError::Rejected(format!(
                "cancel of contract {contract_id} failed"
            )));
        }
        if state.vanishing.remove(&contract_id) {
            if let Some(contract) = state.contracts.get_mut(&contract_id) {
                contract.state = ContractState::Deleted;
            }
        }
        let contract = state
            .contracts
            .get_mut(&contract_id)
            .filter(|c| c.is_active())
            .ok_or(LedgerError::ContractNotFound(contract_id))?;
        contract.state = ContractState::Deleted;
        state.canceled.push(contract_id);
        debug!(contract_id, "memory ledger: contract canceled");
        Ok(())
    }

    async fn get_contract(&self, contract_id: ContractId) -> Result<Contract, LedgerError> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(LedgerError::Unavailable("ledger offline".to_string()));
        }
        state
            .contracts
            .get(&contract_id)
            .cloned()
            .ok_or(LedgerError::ContractNotFound(contract_id))
    }

    async fn get_balance(&self, _identity: &dyn Identity) -> Result<u64, LedgerError> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(LedgerError::Unavailable("ledger offline".to_string()));
        }
        Ok(state.balance)
    }
}

// ── Nodes ──────────────────────────────────────────────────────────

/// How a node provisions workloads whose version changed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Provisioning {
    /// Workloads report `ok` immediately.
    #[default]
    Instant,
    /// Workloads stay `init` forever.
    Stuck,
    /// Workloads report `ok` after this many change-feed polls.
    AfterPolls(u32),
    /// One workload turns `ok` per change-feed poll.
    OnePerPoll,
    /// The named workload lands in `error`, the rest report `ok`.
    Fail { workload: String, message: String },
}

#[derive(Debug, Default)]
struct NodeState {
    deployments: BTreeMap<ContractId, Deployment>,
    pending_polls: BTreeMap<ContractId, u32>,
    wg_ports: Vec<u16>,
    public_config: Option<PublicConfig>,
    interfaces: BTreeMap<String, Vec<IpAddr>>,
    provisioning: Provisioning,
    reject: Option<String>,
    down: bool,
    latency: Option<Duration>,
}

impl NodeState {
    fn used_ports(&self) -> Vec<u16> {
        let mut ports: BTreeSet<u16> = self.wg_ports.iter().copied().collect();
        for dl in self.deployments.values() {
            for w in &dl.workloads {
                if let WorkloadData::Network(net) = &w.data {
                    ports.insert(net.wireguard_listen_port);
                }
            }
        }
        ports.into_iter().collect()
    }

    /// Set results for workloads whose version differs from `previous`.
    fn provision(&mut self, deployment: &mut Deployment, previous: Option<&Deployment>) {
        for w in &mut deployment.workloads {
            let prior = previous.and_then(|p| p.workload(&w.name));
            if let Some(prior) = prior.filter(|p| p.version == w.version) {
                w.result = prior.result.clone();
                continue;
            }
            w.result.error.clear();
            w.result.state = match &self.provisioning {
                Provisioning::Instant => ResultState::Ok,
                Provisioning::Fail { workload, message } if *workload == w.name => {
                    w.result.error = message.clone();
                    ResultState::Error
                }
                Provisioning::Fail { .. } => ResultState::Ok,
                Provisioning::Stuck | Provisioning::AfterPolls(_) | Provisioning::OnePerPoll => {
                    ResultState::Init
                }
            };
        }
        if let Provisioning::AfterPolls(n) = self.provisioning {
            self.pending_polls.insert(deployment.contract_id, n);
        }
    }

    /// Advance provisioning on a change-feed poll.
    fn progress(&mut self, contract_id: ContractId) {
        let Some(dl) = self.deployments.get_mut(&contract_id) else {
            return;
        };
        match self.provisioning {
            Provisioning::AfterPolls(_) => {
                let remaining = self.pending_polls.entry(contract_id).or_insert(0);
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    for w in &mut dl.workloads {
                        if w.result.state == ResultState::Init {
                            w.result.state = ResultState::Ok;
                        }
                    }
                }
            }
            Provisioning::OnePerPoll => {
                if let Some(w) = dl
                    .workloads
                    .iter_mut()
                    .find(|w| w.result.state == ResultState::Init)
                {
                    w.result.state = ResultState::Ok;
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Default)]
struct FleetState {
    nodes: BTreeMap<NodeId, NodeState>,
    calls: Vec<(NodeId, String)>,
}

/// A fleet of simulated nodes reachable through [`NodeTransport`].
///
/// With a ledger attached, nodes check that every submitted deployment is
/// covered by an active contract on that node whose hash matches the
/// deployment's challenge, and they drop deployments whose contract was
/// canceled.
#[derive(Debug, Default)]
pub struct MemoryNodes {
    ledger: Option<Arc<MemoryLedger>>,
    state: Mutex<FleetState>,
}

impl MemoryNodes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ledger(mut self, ledger: Arc<MemoryLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    fn node_mut(&mut self, node_id: NodeId) -> &mut NodeState {
        self.state.get_mut().nodes.entry(node_id).or_default()
    }

    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_mut(node_id);
        self
    }

    pub fn with_public_config(mut self, node_id: NodeId, config: PublicConfig) -> Self {
        self.node_mut(node_id).public_config = Some(config);
        self
    }

    pub fn with_interfaces(
        mut self,
        node_id: NodeId,
        interfaces: BTreeMap<String, Vec<IpAddr>>,
    ) -> Self {
        self.node_mut(node_id).interfaces = interfaces;
        self
    }

    pub fn with_wg_ports(mut self, node_id: NodeId, ports: Vec<u16>) -> Self {
        self.node_mut(node_id).wg_ports = ports;
        self
    }

    pub fn with_latency(mut self, node_id: NodeId, latency: Duration) -> Self {
        self.node_mut(node_id).latency = Some(latency);
        self
    }

    pub async fn set_down(&self, node_id: NodeId, down: bool) {
        let mut state = self.state.lock().await;
        state.nodes.entry(node_id).or_default().down = down;
    }

    /// Make deploy and update calls on `node_id` fail with `message`.
    pub async fn reject_deployments(&self, node_id: NodeId, message: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.nodes.entry(node_id).or_default().reject = Some(message.into());
    }

    pub async fn set_provisioning(&self, node_id: NodeId, provisioning: Provisioning) {
        let mut state = self.state.lock().await;
        state.nodes.entry(node_id).or_default().provisioning = provisioning;
    }

    /// Seed a deployment as if it had been submitted earlier.
    pub async fn insert_deployment(&self, node_id: NodeId, deployment: Deployment) {
        let mut state = self.state.lock().await;
        state
            .nodes
            .entry(node_id)
            .or_default()
            .deployments
            .insert(deployment.contract_id, deployment);
    }

    pub async fn deployment(&self, node_id: NodeId, contract_id: ContractId) -> Option<Deployment> {
        let state = self.state.lock().await;
        state.nodes.get(&node_id)?.deployments.get(&contract_id).cloned()
    }

    /// Number of calls to `method` across the fleet.
    pub async fn call_count(&self, method: &str) -> usize {
        let state = self.state.lock().await;
        state.calls.iter().filter(|(_, m)| m == method).count()
    }

    pub async fn calls_to(&self, node_id: NodeId, method: &str) -> usize {
        let state = self.state.lock().await;
        state
            .calls
            .iter()
            .filter(|(n, m)| *n == node_id && m == method)
            .count()
    }

    /// Check the contract backing `deployment` on `node_id`.
    async fn check_contract(&self, node_id: NodeId, deployment: &Deployment) -> Result<(), String> {
        let Some(ledger) = &self.ledger else {
            return Ok(());
        };
        let contract = ledger
            .contract(deployment.contract_id)
            .await
            .filter(Contract::is_active)
            .ok_or_else(|| format!("contract {} is not active", deployment.contract_id))?;
        if contract.node_id != node_id {
            return Err(format!(
                "contract {} belongs to node {}",
                contract.contract_id, contract.node_id
            ));
        }
        let hash = deployment.challenge_hash_hex().map_err(|e| e.to_string())?;
        if contract.deployment_hash != hash {
            return Err("deployment hash does not match contract".to_string());
        }
        Ok(())
    }

    async fn is_canceled(&self, contract_id: ContractId) -> bool {
        match &self.ledger {
            Some(ledger) => !ledger
                .contract(contract_id)
                .await
                .is_some_and(|c| c.is_active()),
            None => false,
        }
    }

    async fn submit(
        &self,
        node_id: NodeId,
        method: &str,
        mut deployment: Deployment,
    ) -> Result<Value, RpcError> {
        let remote = |message: String| RpcError::Remote {
            node: node_id,
            method: method.to_string(),
            message,
        };
        deployment
            .validate()
            .map_err(|e| remote(e.to_string()))?;
        if deployment.signature_requirement.signatures.is_empty() {
            return Err(remote("deployment is not signed".to_string()));
        }
        self.check_contract(node_id, &deployment)
            .await
            .map_err(remote)?;

        let mut state = self.state.lock().await;
        let node = state
            .nodes
            .get_mut(&node_id)
            .ok_or(RpcError::Unreachable { node: node_id })?;
        if let Some(message) = &node.reject {
            return Err(remote(message.clone()));
        }

        let previous = node.deployments.get(&deployment.contract_id).cloned();
        match (method, &previous) {
            (node::DEPLOYMENT_DEPLOY, Some(_)) => {
                return Err(remote(format!(
                    "deployment {} already exists",
                    deployment.contract_id
                )));
            }
            (node::DEPLOYMENT_UPDATE, None) => {
                return Err(RpcError::NotFound {
                    node: node_id,
                    what: format!("deployment {}", deployment.contract_id),
                });
            }
            (node::DEPLOYMENT_UPDATE, Some(prev)) if deployment.version <= prev.version => {
                return Err(remote(format!(
                    "version {} must be greater than {}",
                    deployment.version, prev.version
                )));
            }
            _ => {}
        }

        node.provision(&mut deployment, previous.as_ref());
        node.deployments.insert(deployment.contract_id, deployment);
        Ok(Value::Null)
    }

    async fn lookup(&self, node_id: NodeId, contract_id: ContractId) -> Result<Deployment, RpcError> {
        let not_found = || RpcError::NotFound {
            node: node_id,
            what: format!("deployment {contract_id}"),
        };
        if self.is_canceled(contract_id).await {
            let mut state = self.state.lock().await;
            if let Some(node) = state.nodes.get_mut(&node_id) {
                node.deployments.remove(&contract_id);
            }
            return Err(not_found());
        }
        let state = self.state.lock().await;
        state
            .nodes
            .get(&node_id)
            .and_then(|n| n.deployments.get(&contract_id))
            .cloned()
            .ok_or_else(not_found)
    }
}

#[async_trait]
impl NodeTransport for MemoryNodes {
    async fn call(&self, node_id: NodeId, method: &str, payload: Value) -> Result<Value, RpcError> {
        let latency = {
            let mut state = self.state.lock().await;
            state.calls.push((node_id, method.to_string()));
            match state.nodes.get(&node_id) {
                Some(node) if !node.down => node.latency,
                _ => return Err(RpcError::Unreachable { node: node_id }),
            }
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        match method {
            node::DEPLOYMENT_DEPLOY | node::DEPLOYMENT_UPDATE => {
                let deployment: Deployment = serde_json::from_value(payload)?;
                self.submit(node_id, method, deployment).await
            }
            node::DEPLOYMENT_GET => {
                let ContractRef { contract_id } = serde_json::from_value(payload)?;
                let deployment = self.lookup(node_id, contract_id).await?;
                Ok(serde_json::to_value(deployment)?)
            }
            node::DEPLOYMENT_CHANGES => {
                let ContractRef { contract_id } = serde_json::from_value(payload)?;
                self.lookup(node_id, contract_id).await?;
                let mut state = self.state.lock().await;
                let node = state
                    .nodes
                    .get_mut(&node_id)
                    .ok_or(RpcError::Unreachable { node: node_id })?;
                node.progress(contract_id);
                let workloads = node
                    .deployments
                    .get(&contract_id)
                    .map(|dl| dl.workloads.clone())
                    .unwrap_or_default();
                Ok(serde_json::to_value(workloads)?)
            }
            node::NETWORK_LIST_WG_PORTS => {
                let state = self.state.lock().await;
                let ports = state
                    .nodes
                    .get(&node_id)
                    .map(NodeState::used_ports)
                    .unwrap_or_default();
                Ok(serde_json::to_value(ports)?)
            }
            node::NETWORK_PUBLIC_CONFIG => {
                let state = self.state.lock().await;
                match state.nodes.get(&node_id).and_then(|n| n.public_config.clone()) {
                    Some(config) => Ok(serde_json::to_value(config)?),
                    None => Err(RpcError::NotFound {
                        node: node_id,
                        what: "public config".to_string(),
                    }),
                }
            }
            node::NETWORK_INTERFACES => {
                let state = self.state.lock().await;
                let interfaces = state
                    .nodes
                    .get(&node_id)
                    .map(|n| n.interfaces.clone())
                    .unwrap_or_default();
                Ok(serde_json::to_value(interfaces)?)
            }
            other => Err(RpcError::UnknownMethod {
                node: node_id,
                method: other.to_string(),
            }),
        }
    }
}

// ── Inventory ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct InventoryState {
    nodes: BTreeMap<NodeId, NodeInfo>,
    farms: BTreeMap<FarmId, Farm>,
    unavailable: bool,
}

#[derive(Debug, Default)]
pub struct MemoryInventory {
    state: Mutex<InventoryState>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, node: NodeInfo) -> Self {
        self.state.get_mut().nodes.insert(node.node_id, node);
        self
    }

    pub fn with_farm(mut self, farm: Farm) -> Self {
        self.state.get_mut().farms.insert(farm.farm_id, farm);
        self
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    pub async fn remove_node(&self, node_id: NodeId) {
        self.state.lock().await.nodes.remove(&node_id);
    }
}

#[async_trait]
impl InventoryClient for MemoryInventory {
    async fn node(&self, node_id: NodeId) -> Result<NodeInfo, InventoryError> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(InventoryError::Unavailable("inventory offline".to_string()));
        }
        state
            .nodes
            .get(&node_id)
            .cloned()
            .ok_or(InventoryError::NodeNotFound(node_id))
    }

    async fn farms(&self, filter: &FarmFilter) -> Result<Vec<Farm>, InventoryError> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(InventoryError::Unavailable("inventory offline".to_string()));
        }
        Ok(state
            .farms
            .values()
            .filter(|f| filter.matches(f))
            .cloned()
            .collect())
    }

    async fn pick_public_node(&self, exclude: &[NodeId]) -> Result<NodeId, InventoryError> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(InventoryError::Unavailable("inventory offline".to_string()));
        }
        state
            .nodes
            .values()
            .filter(|n| n.online && !exclude.contains(&n.node_id))
            .find(|n| n.public_config.as_ref().is_some_and(PublicConfig::has_ipv4))
            .map(|n| n.node_id)
            .ok_or(InventoryError::NoPublicNode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeClient;
    use grid_core::workload::ZMount;
    use grid_core::{Capacity, Ed25519Identity, GIB, Workload};

    fn identity() -> Ed25519Identity {
        Ed25519Identity::from_seed([5; 32])
    }

    fn deployment(contract_id: ContractId) -> Deployment {
        let mut dl = Deployment::new(
            280,
            vec![
                Workload::new("a", WorkloadData::ZMount(ZMount { size: GIB })),
                Workload::new("b", WorkloadData::ZMount(ZMount { size: 2 * GIB })),
            ],
        );
        dl.contract_id = contract_id;
        dl.sign(280, &identity()).unwrap();
        dl
    }

    async fn fleet() -> (Arc<MemoryLedger>, Arc<MemoryNodes>) {
        let ledger = Arc::new(MemoryLedger::new(280).with_contract_id(10, 100));
        let nodes = Arc::new(MemoryNodes::new().with_ledger(ledger.clone()).with_node(10));
        (ledger, nodes)
    }

    #[tokio::test]
    async fn preset_contract_ids_are_used_then_sequence_resumes() {
        let ledger = MemoryLedger::new(1).with_contract_id(10, 100);
        let id = identity();
        assert_eq!(ledger.create_node_contract(&id, 10, "", "h", 0, None).await.unwrap(), 100);
        assert_eq!(ledger.create_node_contract(&id, 10, "", "h", 0, None).await.unwrap(), 101);
        assert_eq!(ledger.create_node_contract(&id, 20, "", "h", 0, None).await.unwrap(), 102);
        assert_eq!(ledger.create_count().await, 3);
    }

    #[tokio::test]
    async fn cancel_twice_is_not_found() {
        let ledger = MemoryLedger::new(1);
        let id = identity();
        let c = ledger.create_node_contract(&id, 1, "", "h", 0, None).await.unwrap();
        ledger.cancel_contract(&id, c).await.unwrap();
        let err = ledger.cancel_contract(&id, c).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(ledger.canceled().await, vec![c]);
        assert!(ledger.active_contracts().await.is_empty());
    }

    #[tokio::test]
    async fn node_accepts_deployment_matching_contract() {
        let (ledger, nodes) = fleet().await;
        let mut dl = deployment(0);
        let hash = dl.challenge_hash_hex().unwrap();
        let c = ledger
            .create_node_contract(&identity(), 10, "", &hash, 0, None)
            .await
            .unwrap();
        dl.contract_id = c;
        dl.sign(280, &identity()).unwrap();

        let client = NodeClient::new(10, nodes.clone());
        client.deployment_deploy(&dl).await.unwrap();

        let changes = client.deployment_changes(c).await.unwrap();
        assert!(changes.iter().all(|w| w.result.state == ResultState::Ok));
        assert_eq!(nodes.call_count(node::DEPLOYMENT_DEPLOY).await, 1);
    }

    #[tokio::test]
    async fn node_rejects_hash_mismatch() {
        let (ledger, nodes) = fleet().await;
        let c = ledger
            .create_node_contract(&identity(), 10, "", "not-the-hash", 0, None)
            .await
            .unwrap();
        let err = NodeClient::new(10, nodes)
            .deployment_deploy(&deployment(c))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote { .. }));
    }

    #[tokio::test]
    async fn canceled_contract_hides_deployment() {
        let (ledger, nodes) = fleet().await;
        ledger
            .insert_contract(Contract {
                contract_id: 7,
                node_id: 10,
                twin_id: 280,
                deployment_hash: String::new(),
                deployment_data: String::new(),
                public_ips: 0,
                state: ContractState::Created,
                solution_provider: None,
            })
            .await;
        nodes.insert_deployment(10, deployment(7)).await;
        let client = NodeClient::new(10, nodes.clone());
        client.deployment_get(7).await.unwrap();

        ledger.cancel_contract(&identity(), 7).await.unwrap();
        assert!(client.deployment_get(7).await.unwrap_err().is_not_found());
        assert!(nodes.deployment(10, 7).await.is_none());
    }

    #[tokio::test]
    async fn provisioning_modes_progress_on_polls() {
        let nodes = Arc::new(MemoryNodes::new().with_node(1));
        nodes.set_provisioning(1, Provisioning::OnePerPoll).await;
        nodes
            .call(1, node::DEPLOYMENT_DEPLOY, serde_json::to_value(deployment(3)).unwrap())
            .await
            .unwrap();
        let client = NodeClient::new(1, nodes.clone());

        fn ok(ws: &[Workload]) -> usize {
            ws.iter().filter(|w| w.result.state == ResultState::Ok).count()
        }
        assert_eq!(ok(&client.deployment_changes(3).await.unwrap()), 1);
        assert_eq!(ok(&client.deployment_changes(3).await.unwrap()), 2);
    }

    #[tokio::test]
    async fn down_node_is_unreachable() {
        let nodes = MemoryNodes::new().with_node(4);
        nodes.set_down(4, true).await;
        let err = nodes.call(4, node::NETWORK_LIST_WG_PORTS, Value::Null).await.unwrap_err();
        assert!(matches!(err, RpcError::Unreachable { node: 4 }));
        let err = nodes.call(5, node::NETWORK_LIST_WG_PORTS, Value::Null).await.unwrap_err();
        assert!(matches!(err, RpcError::Unreachable { node: 5 }));
    }

    #[tokio::test]
    async fn wg_ports_lists_configured_ports() {
        let nodes = Arc::new(MemoryNodes::new().with_wg_ports(2, vec![3000]));
        let ports = NodeClient::new(2, nodes).network_list_wg_ports().await.unwrap();
        assert_eq!(ports, vec![3000]);
    }

    #[tokio::test]
    async fn inventory_picks_lowest_public_node_not_excluded() {
        let info = |id: NodeId, public: bool| NodeInfo {
            node_id: id,
            farm_id: 1,
            twin_id: id,
            total: Capacity::default(),
            used: Capacity::default(),
            public_config: public.then(|| PublicConfig {
                ipv4: Some("185.1.1.1/24".parse().unwrap()),
                ..PublicConfig::default()
            }),
            online: true,
        };
        let inv = MemoryInventory::new()
            .with_node(info(1, false))
            .with_node(info(2, true))
            .with_node(info(3, true));
        assert_eq!(inv.pick_public_node(&[]).await.unwrap(), 2);
        assert_eq!(inv.pick_public_node(&[2]).await.unwrap(), 3);
        assert_eq!(
            inv.pick_public_node(&[2, 3]).await.unwrap_err(),
            InventoryError::NoPublicNode
        );
        inv.set_unavailable(true).await;
        assert!(matches!(inv.node(1).await, Err(InventoryError::Unavailable(_))));
    }
}
