//! Mesh membership: who holds which subnet, key and port.

use std::collections::{BTreeMap, BTreeSet};

use grid_core::workload::{Network, WorkloadData};
use grid_core::{Deployment, NodeId};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, NetworkResult};
use crate::keys;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMember {
    pub subnet: Ipv4Net,
    pub private_key: String,
    pub public_key: String,
    pub port: u16,
}

/// A user machine joining through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalMember {
    pub subnet: Ipv4Net,
    pub public_key: String,
    /// Only known to whoever generated the key; never stored on nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

/// The mesh as last planned or observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshState {
    pub name: String,
    pub ip_range: Ipv4Net,
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, NodeMember>,
    #[serde(default)]
    pub relay: Option<NodeId>,
    #[serde(default)]
    pub external: Option<ExternalMember>,
}

impl MeshState {
    pub fn new(name: impl Into<String>, ip_range: Ipv4Net) -> Self {
        Self {
            name: name.into(),
            ip_range,
            nodes: BTreeMap::new(),
            relay: None,
            external: None,
        }
    }

    /// Rebuild the mesh from the network workloads named `name` in a
    /// fetched fleet.
    ///
    /// The relay is the node holding peers without an endpoint (they dial
    /// in). A relay peer whose subnet belongs to no node is the external
    /// member.
    pub fn observe(
        name: impl Into<String>,
        ip_range: Ipv4Net,
        fleet: &BTreeMap<NodeId, Deployment>,
    ) -> NetworkResult<Self> {
        let mut state = Self::new(name, ip_range);
        let mut networks = BTreeMap::new();

        for (&node, deployment) in fleet {
            let Some(network) = deployment.workloads.iter().find_map(|w| match &w.data {
                WorkloadData::Network(net) if w.name == state.name => Some(net),
                _ => None,
            }) else {
                continue;
            };
            if network.ip_range != ip_range {
                return Err(NetworkError::Inconsistent {
                    node,
                    name: state.name.clone(),
                    reason: format!("ip range {} differs from {ip_range}", network.ip_range),
                });
            }
            let keys = keys::WgKeyPair::from_private(&network.wireguard_private_key)?;
            state.nodes.insert(
                node,
                NodeMember {
                    subnet: network.subnet,
                    private_key: keys.private_key,
                    public_key: keys.public_key,
                    port: network.wireguard_listen_port,
                },
            );
            networks.insert(node, network);
        }

        let subnets: BTreeSet<Ipv4Net> = state.nodes.values().map(|m| m.subnet).collect();
        for (&node, network) in &networks {
            let dialing_in: Vec<_> = network.peers.iter().filter(|p| p.endpoint.is_empty()).collect();
            if dialing_in.is_empty() {
                continue;
            }
            state.relay = Some(node);
            if let Some(peer) = dialing_in.iter().find(|p| !subnets.contains(&p.subnet)) {
                state.external = Some(ExternalMember {
                    subnet: peer.subnet,
                    public_key: peer.wireguard_public_key.clone(),
                    private_key: None,
                });
            }
            break;
        }
        Ok(state)
    }

    /// Attach the external member's private key, kept outside the grid.
    pub fn with_external_private_key(mut self, private_key: impl Into<String>) -> Self {
        if let Some(external) = self.external.as_mut() {
            external.private_key = Some(private_key.into());
        }
        self
    }

    pub fn member(&self, node: NodeId) -> Option<&NodeMember> {
        self.nodes.get(&node)
    }

    pub fn node_ids(&self) -> BTreeSet<NodeId> {
        self.nodes.keys().copied().collect()
    }
}

/// Network workload for a member, as carried by its deployment.
pub(crate) fn network_data(
    ip_range: Ipv4Net,
    member: &NodeMember,
    peers: Vec<grid_core::workload::Peer>,
) -> Network {
    Network {
        ip_range,
        subnet: member.subnet,
        wireguard_private_key: member.private_key.clone(),
        wireguard_listen_port: member.port,
        peers,
    }
}

#[cfg(test)]
mod tests {
    use grid_core::Workload;
    use grid_core::workload::Peer;

    use super::*;
    use crate::keys::WgKeyPair;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn deployment(name: &str, subnet: &str, key: &WgKeyPair, peers: Vec<Peer>) -> Deployment {
        let network = Network {
            ip_range: net("10.20.0.0/16"),
            subnet: net(subnet),
            wireguard_private_key: key.private_key.clone(),
            wireguard_listen_port: 4000,
            peers,
        };
        Deployment::new(7, vec![Workload::new(name, WorkloadData::Network(network))])
    }

    fn peer(subnet: &str, key: &str, endpoint: &str) -> Peer {
        Peer {
            subnet: net(subnet),
            wireguard_public_key: key.to_string(),
            allowed_ips: vec![net(subnet)],
            endpoint: endpoint.to_string(),
        }
    }

    #[test]
    fn observe_recovers_members_relay_and_external() {
        let relay_key = WgKeyPair::generate();
        let hidden_key = WgKeyPair::generate();
        let user = WgKeyPair::generate();

        let fleet = BTreeMap::from([
            (
                1,
                deployment(
                    "net",
                    "10.20.3.0/24",
                    &relay_key,
                    vec![
                        peer("10.20.4.0/24", &hidden_key.public_key, ""),
                        peer("10.20.2.0/24", &user.public_key, ""),
                    ],
                ),
            ),
            (
                2,
                deployment(
                    "net",
                    "10.20.4.0/24",
                    &hidden_key,
                    vec![peer("10.20.3.0/24", &relay_key.public_key, "185.1.1.1:4000")],
                ),
            ),
            (3, deployment("other", "10.20.9.0/24", &user, Vec::new())),
        ]);

        let state = MeshState::observe("net", net("10.20.0.0/16"), &fleet).unwrap();
        assert_eq!(state.node_ids(), BTreeSet::from([1, 2]));
        assert_eq!(state.relay, Some(1));
        assert_eq!(state.member(1).unwrap().public_key, relay_key.public_key);

        let external = state.external.clone().unwrap();
        assert_eq!(external.subnet, net("10.20.2.0/24"));
        assert_eq!(external.public_key, user.public_key);
        assert!(external.private_key.is_none());

        let state = state.with_external_private_key(user.private_key.clone());
        assert_eq!(state.external.unwrap().private_key, Some(user.private_key));
    }

    #[test]
    fn mismatched_range_is_inconsistent() {
        let key = WgKeyPair::generate();
        let fleet = BTreeMap::from([(1, deployment("net", "10.20.3.0/24", &key, Vec::new()))]);
        let err = MeshState::observe("net", net("10.30.0.0/16"), &fleet).unwrap_err();
        assert!(matches!(err, NetworkError::Inconsistent { node: 1, .. }));
    }

    #[test]
    fn state_serializes_without_unknown_external_key() {
        let mut state = MeshState::new("net", net("10.20.0.0/16"));
        state.external = Some(ExternalMember {
            subnet: net("10.20.2.0/24"),
            public_key: "pk".to_string(),
            private_key: None,
        });
        let json = serde_json::to_string(&state).unwrap();
        assert!(!json.contains("private_key"));
        let back: MeshState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
