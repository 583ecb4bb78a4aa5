//! Mesh planning.
//!
//! Given the previous mesh and a set of target nodes, produce one network
//! workload per participant such that every member can reach every other:
//!
//! - accessible nodes peer with each other directly,
//! - hidden nodes get a single peer, the relay, routing the whole range,
//! - the relay also accepts the external member when access is requested.
//!
//! Existing members keep their subnet, key and port across passes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use grid_client::{InventoryClient, InventoryError, NodeClient, NodeTransport};
use grid_core::workload::{Peer, WorkloadData};
use grid_core::{Deployment, NetworkConfig, NodeId, TwinId, Workload};
use ipnet::Ipv4Net;
use tracing::{debug, info, warn};

use crate::allocate::{SubnetAllocator, carrier_ip, pick_port};
use crate::error::{NetworkError, NetworkResult};
use crate::keys::WgKeyPair;
use crate::mesh::{ExternalMember, MeshState, NodeMember, network_data};
use crate::reachability::{self, Reachability};
use crate::wgquick::{self, WgQuick};

/// Public nodes tried from the inventory before giving up on a relay.
const RELAY_CANDIDATES: usize = 5;

/// Result of one planning pass.
#[derive(Debug, Clone)]
pub struct MeshPlan {
    pub state: MeshState,
    /// Network workload per participating node.
    pub workloads: BTreeMap<NodeId, Workload>,
    /// Previous members no longer part of the mesh.
    pub removed: BTreeSet<NodeId>,
    /// wg-quick config for the external member, when requested.
    pub external_config: Option<String>,
}

impl MeshPlan {
    /// One deployment per participant carrying only its network workload.
    pub fn deployments(&self, twin_id: TwinId) -> BTreeMap<NodeId, Deployment> {
        self.workloads
            .iter()
            .map(|(&node, w)| (node, Deployment::new(twin_id, vec![w.clone()])))
            .collect()
    }

    /// Put each network workload into `desired`, replacing any workload of
    /// the same name and creating deployments for nodes without one.
    pub fn merge_into(&self, desired: &mut BTreeMap<NodeId, Deployment>, twin_id: TwinId) {
        for (&node, workload) in &self.workloads {
            let deployment = desired
                .entry(node)
                .or_insert_with(|| Deployment::new(twin_id, Vec::new()));
            match deployment.workloads.iter_mut().find(|w| w.name == workload.name) {
                Some(existing) => *existing = workload.clone(),
                None => deployment.workloads.push(workload.clone()),
            }
        }
    }
}

pub struct MeshPlanner {
    transport: Arc<dyn NodeTransport>,
    inventory: Option<Arc<dyn InventoryClient>>,
    config: NetworkConfig,
    probe_timeout: Duration,
}

impl MeshPlanner {
    pub fn new(transport: Arc<dyn NodeTransport>) -> Self {
        Self {
            transport,
            inventory: None,
            config: NetworkConfig::default(),
            probe_timeout: Duration::from_secs(10),
        }
    }

    /// Discovery used when no target can serve as relay.
    pub fn with_inventory(mut self, inventory: Arc<dyn InventoryClient>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn with_config(mut self, config: NetworkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub async fn plan(
        &self,
        previous: &MeshState,
        targets: &BTreeSet<NodeId>,
        external_access: bool,
    ) -> NetworkResult<MeshPlan> {
        let ip_range = previous.ip_range;
        let carrier = self.config.carrier_range()?;
        let mut allocator = SubnetAllocator::new(ip_range)?;

        let mut reach = BTreeMap::new();
        for &node in targets {
            reach.insert(node, self.probe(node).await);
        }
        let hidden = reach.values().filter(|r| r.is_hidden()).count();
        let needs_relay = external_access || (hidden > 0 && targets.len() > 1);
        let relay = if needs_relay {
            Some(self.choose_relay(previous, targets, &mut reach).await?)
        } else {
            None
        };

        let mut participants = targets.clone();
        participants.extend(relay);

        for node in &participants {
            if let Some(member) = previous.member(*node) {
                allocator.reserve(member.subnet);
            }
        }

        if let Some(prev) = &previous.external {
            allocator.reserve(prev.subnet);
        }

        let external = match (external_access, previous.external.as_ref()) {
            (false, _) => None,
            (true, Some(prev)) => {
                let keys = match &prev.private_key {
                    Some(sk) => WgKeyPair::from_private(sk)?,
                    None => {
                        warn!(subnet = %prev.subnet, "external private key unknown, generating a new one");
                        WgKeyPair::generate()
                    }
                };
                Some(external_member(prev.subnet, keys))
            }
            (true, None) => Some(external_member(allocator.allocate()?, WgKeyPair::generate())),
        };

        let mut members = BTreeMap::new();
        let mut chosen_ports = BTreeSet::new();
        for &node in &participants {
            let member = match previous.member(node) {
                Some(member) if ip_range.contains(&member.subnet) => member.clone(),
                _ => {
                    let subnet = allocator.allocate()?;
                    let member = self.new_member(node, subnet, &chosen_ports).await?;
                    debug!(node, %subnet, port = member.port, "new mesh member");
                    member
                }
            };
            chosen_ports.insert(member.port);
            members.insert(node, member);
        }

        let topology = Topology {
            ip_range,
            carrier,
            members: &members,
            reach: &reach,
            relay,
            external: external.as_ref(),
        };

        let workloads = participants
            .iter()
            .map(|&node| {
                let member = &members[&node];
                let data = network_data(ip_range, member, topology.peers_of(node));
                (node, Workload::new(previous.name.clone(), WorkloadData::Network(data)))
            })
            .collect();

        let external_config = match (&external, relay) {
            (Some(ext), Some(relay)) => Some(topology.external_config(ext, relay, self.config.keepalive)?),
            _ => None,
        };

        let removed: BTreeSet<NodeId> = previous.node_ids().difference(&participants).copied().collect();

        info!(
            network = %previous.name,
            members = members.len(),
            hidden,
            relay = ?relay,
            removed = removed.len(),
            "mesh planned"
        );

        Ok(MeshPlan {
            state: MeshState {
                name: previous.name.clone(),
                ip_range,
                nodes: members,
                relay,
                external,
            },
            workloads,
            removed,
            external_config,
        })
    }

    async fn probe(&self, node: NodeId) -> Reachability {
        let client = NodeClient::new(node, self.transport.clone());
        reachability::probe(&client, self.probe_timeout).await
    }

    /// Previous relay if still public over IPv4, else the lowest public
    /// IPv4 target, else a public node from the inventory.
    async fn choose_relay(
        &self,
        previous: &MeshState,
        targets: &BTreeSet<NodeId>,
        reach: &mut BTreeMap<NodeId, Reachability>,
    ) -> NetworkResult<NodeId> {
        if let Some(prev) = previous.relay {
            let found = match reach.get(&prev) {
                Some(found) => *found,
                None => self.probe(prev).await,
            };
            if found.is_ipv4() {
                reach.insert(prev, found);
                return Ok(prev);
            }
            warn!(node = prev, "previous relay lost its public ipv4");
        }

        if let Some((&node, _)) = reach
            .iter()
            .find(|(node, found)| targets.contains(*node) && found.is_ipv4())
        {
            return Ok(node);
        }

        let Some(inventory) = &self.inventory else {
            return Err(NetworkError::NoRelay {
                reason: "no target has a public ipv4 and no inventory is configured".to_string(),
            });
        };
        let mut exclude: Vec<NodeId> = targets.iter().copied().collect();
        exclude.extend(previous.relay);
        for _ in 0..RELAY_CANDIDATES {
            let candidate = inventory.pick_public_node(&exclude).await.map_err(|e| match e {
                InventoryError::NoPublicNode => NetworkError::NoRelay {
                    reason: "inventory has no public node left".to_string(),
                },
                other => other.into(),
            })?;
            let found = self.probe(candidate).await;
            if found.is_ipv4() {
                info!(node = candidate, "using inventory node as relay");
                reach.insert(candidate, found);
                return Ok(candidate);
            }
            warn!(node = candidate, "relay candidate has no public ipv4");
            exclude.push(candidate);
        }
        Err(NetworkError::NoRelay {
            reason: format!("none of {RELAY_CANDIDATES} inventory candidates is reachable over ipv4"),
        })
    }

    async fn new_member(
        &self,
        node: NodeId,
        subnet: Ipv4Net,
        chosen: &BTreeSet<u16>,
    ) -> NetworkResult<NodeMember> {
        let client = NodeClient::new(node, self.transport.clone());
        let used: BTreeSet<u16> = client
            .network_list_wg_ports()
            .await
            .map_err(|source| NetworkError::Rpc { node, source })?
            .into_iter()
            .collect();
        let port = pick_port(&used, chosen, self.config.wg_port_min, self.config.wg_port_max)
            .ok_or(NetworkError::NoFreePort { node })?;
        let keys = WgKeyPair::generate();
        Ok(NodeMember {
            subnet,
            private_key: keys.private_key,
            public_key: keys.public_key,
            port,
        })
    }
}

fn external_member(subnet: Ipv4Net, keys: WgKeyPair) -> ExternalMember {
    ExternalMember {
        subnet,
        public_key: keys.public_key,
        private_key: Some(keys.private_key),
    }
}

// ── Peer graph ─────────────────────────────────────────────────────

struct Topology<'a> {
    ip_range: Ipv4Net,
    carrier: Ipv4Net,
    members: &'a BTreeMap<NodeId, NodeMember>,
    reach: &'a BTreeMap<NodeId, Reachability>,
    relay: Option<NodeId>,
    external: Option<&'a ExternalMember>,
}

impl Topology<'_> {
    fn reach(&self, node: NodeId) -> Reachability {
        self.reach.get(&node).copied().unwrap_or(Reachability::Hidden)
    }

    fn endpoint(&self, node: NodeId) -> String {
        let port = self.members[&node].port;
        self.reach(node).endpoint(port).unwrap_or_default()
    }

    fn hidden(&self) -> impl Iterator<Item = (NodeId, &NodeMember)> + '_ {
        self.members
            .iter()
            .filter(move |(node, _)| self.reach(**node).is_hidden())
            .map(|(&node, member)| (node, member))
    }

    /// A member subnet plus its carrier address.
    fn routes(&self, subnet: Ipv4Net) -> Vec<Ipv4Net> {
        vec![subnet, carrier_ip(self.carrier, subnet)]
    }

    fn peers_of(&self, node: NodeId) -> Vec<Peer> {
        if self.reach(node).is_hidden() {
            return match self.relay {
                Some(relay) if relay != node => {
                    let member = &self.members[&relay];
                    vec![Peer {
                        subnet: member.subnet,
                        wireguard_public_key: member.public_key.clone(),
                        allowed_ips: vec![self.ip_range, self.carrier],
                        endpoint: self.endpoint(relay),
                    }]
                }
                _ => Vec::new(),
            };
        }

        let mut peers = Vec::new();
        for (&other, member) in self.members {
            if other == node || self.reach(other).is_hidden() {
                continue;
            }
            let mut allowed_ips = self.routes(member.subnet);
            if Some(other) == self.relay {
                for (_, hidden) in self.hidden() {
                    allowed_ips.extend(self.routes(hidden.subnet));
                }
                if let Some(ext) = self.external {
                    allowed_ips.extend(self.routes(ext.subnet));
                }
            }
            peers.push(Peer {
                subnet: member.subnet,
                wireguard_public_key: member.public_key.clone(),
                allowed_ips,
                endpoint: self.endpoint(other),
            });
        }

        if Some(node) == self.relay {
            for (_, hidden) in self.hidden() {
                peers.push(Peer {
                    subnet: hidden.subnet,
                    wireguard_public_key: hidden.public_key.clone(),
                    allowed_ips: self.routes(hidden.subnet),
                    endpoint: String::new(),
                });
            }
            if let Some(ext) = self.external {
                peers.push(Peer {
                    subnet: ext.subnet,
                    wireguard_public_key: ext.public_key.clone(),
                    allowed_ips: self.routes(ext.subnet),
                    endpoint: String::new(),
                });
            }
        }
        peers
    }

    fn external_config(
        &self,
        external: &ExternalMember,
        relay: NodeId,
        keepalive: u32,
    ) -> NetworkResult<String> {
        let member = &self.members[&relay];
        let private_key = external.private_key.as_deref().ok_or_else(|| {
            NetworkError::InvalidKey("external member has no private key".to_string())
        })?;
        Ok(wgquick::render(&WgQuick {
            address: carrier_ip(self.carrier, external.subnet),
            private_key,
            relay_public_key: &member.public_key,
            relay_endpoint: &self.endpoint(relay),
            allowed_ips: &[self.ip_range, self.carrier],
            keepalive,
        }))
    }
}
