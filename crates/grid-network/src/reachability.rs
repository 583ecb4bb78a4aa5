//! How a node can be reached from outside the mesh.
//!
//! A node is accessible when it exposes a public IPv4 or IPv6 address,
//! either through its public config or on its `zos` interface. Every
//! other node is hidden and needs a relay to join the mesh.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use grid_client::NodeClient;
use tracing::debug;

/// Interface carrying the node's own uplink addresses.
pub const UPLINK_INTERFACE: &str = "zos";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Hidden,
}

impl Reachability {
    pub fn is_hidden(&self) -> bool {
        matches!(self, Reachability::Hidden)
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self, Reachability::Ipv4(_))
    }

    /// Wireguard endpoint on `port`; `[v6]:port` for IPv6.
    pub fn endpoint(&self, port: u16) -> Option<String> {
        let ip = match *self {
            Reachability::Ipv4(ip) => IpAddr::V4(ip),
            Reachability::Ipv6(ip) => IpAddr::V6(ip),
            Reachability::Hidden => return None,
        };
        Some(SocketAddr::new(ip, port).to_string())
    }

    fn from_ip(ip: IpAddr) -> Option<Self> {
        match ip {
            IpAddr::V4(v4) if is_public_v4(v4) => Some(Reachability::Ipv4(v4)),
            IpAddr::V6(v6) if is_public_v6(v6) => Some(Reachability::Ipv6(v6)),
            _ => None,
        }
    }
}

/// Probe a node. Failed or timed out calls count as "no address".
pub async fn probe(client: &NodeClient, timeout: Duration) -> Reachability {
    let node = client.node_id();

    match tokio::time::timeout(timeout, client.network_public_config()).await {
        Ok(Ok(config)) => {
            let v4 = config.ipv4.map(|net| IpAddr::V4(net.addr()));
            let v6 = config.ipv6.map(|net| IpAddr::V6(net.addr()));
            if let Some(found) = v4.into_iter().chain(v6).find_map(Reachability::from_ip) {
                debug!(node, reachability = ?found, "public config");
                return found;
            }
        }
        Ok(Err(e)) => debug!(node, error = %e, "no public config"),
        Err(_) => debug!(node, "public config timed out"),
    }

    match tokio::time::timeout(timeout, client.network_interfaces()).await {
        Ok(Ok(interfaces)) => {
            let uplink = interfaces.get(UPLINK_INTERFACE).map(Vec::as_slice).unwrap_or_default();
            let v4 = uplink.iter().filter(|ip| ip.is_ipv4());
            let v6 = uplink.iter().filter(|ip| ip.is_ipv6());
            if let Some(found) = v4.chain(v6).copied().find_map(Reachability::from_ip) {
                debug!(node, reachability = ?found, "uplink interface");
                return found;
            }
        }
        Ok(Err(e)) => debug!(node, error = %e, "interfaces unavailable"),
        Err(_) => debug!(node, "interfaces timed out"),
    }

    Reachability::Hidden
}

pub fn is_public_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    let shared = a == 100 && (64..128).contains(&b);
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || shared)
}

pub fn is_public_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = first & 0xfe00 == 0xfc00;
    let link_local = first & 0xffc0 == 0xfe80;
    !(ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() || unique_local || link_local)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use grid_client::{MemoryNodes, PublicConfig};

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn client(nodes: MemoryNodes, node: u32) -> NodeClient {
        NodeClient::new(node, Arc::new(nodes))
    }

    #[test]
    fn address_classes() {
        assert!(is_public_v4("185.69.166.10".parse().unwrap()));
        assert!(!is_public_v4("10.1.2.3".parse().unwrap()));
        assert!(!is_public_v4("192.168.1.1".parse().unwrap()));
        assert!(!is_public_v4("100.64.3.2".parse().unwrap()));
        assert!(!is_public_v4("169.254.0.1".parse().unwrap()));
        assert!(is_public_v6("2a02:1802:5e::10".parse().unwrap()));
        assert!(!is_public_v6("fd00::1".parse().unwrap()));
        assert!(!is_public_v6("fe80::1".parse().unwrap()));
        assert!(!is_public_v6("::1".parse().unwrap()));
    }

    #[test]
    fn endpoints_bracket_ipv6() {
        let v4 = Reachability::Ipv4("185.69.166.10".parse().unwrap());
        let v6 = Reachability::Ipv6("2a02:1802:5e::10".parse().unwrap());
        assert_eq!(v4.endpoint(5000).as_deref(), Some("185.69.166.10:5000"));
        assert_eq!(v6.endpoint(5000).as_deref(), Some("[2a02:1802:5e::10]:5000"));
        assert_eq!(Reachability::Hidden.endpoint(5000), None);
    }

    #[tokio::test]
    async fn public_config_ipv4_wins() {
        let nodes = MemoryNodes::new().with_public_config(
            1,
            PublicConfig {
                ipv4: Some("185.69.166.10/24".parse().unwrap()),
                ipv6: Some("2a02:1802:5e::10/64".parse().unwrap()),
                ..Default::default()
            },
        );
        let found = probe(&client(nodes, 1), TIMEOUT).await;
        assert_eq!(found, Reachability::Ipv4("185.69.166.10".parse().unwrap()));
    }

    #[tokio::test]
    async fn uplink_interface_is_the_fallback() {
        let interfaces = BTreeMap::from([
            ("zos".to_string(), vec!["10.0.0.5".parse().unwrap(), "2a02:1802:5e::7".parse().unwrap()]),
            ("npub6".to_string(), vec!["185.1.1.1".parse().unwrap()]),
        ]);
        let nodes = MemoryNodes::new().with_interfaces(2, interfaces);
        let found = probe(&client(nodes, 2), TIMEOUT).await;
        assert_eq!(found, Reachability::Ipv6("2a02:1802:5e::7".parse().unwrap()));
    }

    #[tokio::test]
    async fn private_addresses_only_means_hidden() {
        let interfaces = BTreeMap::from([("zos".to_string(), vec!["192.168.1.20".parse().unwrap()])]);
        let nodes = MemoryNodes::new().with_interfaces(3, interfaces);
        assert!(probe(&client(nodes, 3), TIMEOUT).await.is_hidden());
    }

    #[tokio::test]
    async fn unreachable_node_is_hidden() {
        let nodes = MemoryNodes::new().with_node(4);
        nodes.set_down(4, true).await;
        assert!(probe(&client(nodes, 4), TIMEOUT).await.is_hidden());
    }
}
