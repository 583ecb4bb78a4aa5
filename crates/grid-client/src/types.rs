//! Records returned by the inventory service and the node network API.

use std::net::{Ipv4Addr, Ipv6Addr};

use grid_core::{Capacity, ContractId, FarmId, NodeId, TwinId};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

/// A node's public network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PublicConfig {
    pub ipv4: Option<Ipv4Net>,
    pub gw4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Net>,
    pub gw6: Option<Ipv6Addr>,
    pub domain: Option<String>,
}

impl PublicConfig {
    pub fn has_ipv4(&self) -> bool {
        self.ipv4.is_some()
    }

    pub fn has_domain(&self) -> bool {
        self.domain.as_deref().is_some_and(|d| !d.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub farm_id: FarmId,
    pub twin_id: TwinId,
    pub total: Capacity,
    pub used: Capacity,
    #[serde(default)]
    pub public_config: Option<PublicConfig>,
    #[serde(default = "default_online")]
    pub online: bool,
}

fn default_online() -> bool {
    true
}

impl NodeInfo {
    /// Resources still available. Storage is overcommitted twofold.
    pub fn free(&self) -> Capacity {
        Capacity {
            cru: self.total.cru.saturating_sub(self.used.cru),
            mru: self.total.mru.saturating_sub(self.used.mru),
            sru: (2 * self.total.sru).saturating_sub(self.used.sru),
            hru: self.total.hru.saturating_sub(self.used.hru),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmPublicIp {
    pub ip: Ipv4Net,
    pub gateway: Ipv4Addr,
    /// Contract holding the address, `0` when free.
    #[serde(default)]
    pub contract_id: ContractId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Farm {
    pub farm_id: FarmId,
    pub name: String,
    #[serde(default)]
    pub public_ips: Vec<FarmPublicIp>,
}

impl Farm {
    pub fn free_public_ips(&self) -> u32 {
        self.public_ips.iter().filter(|ip| ip.contract_id == 0).count() as u32
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmFilter {
    pub farm_id: Option<FarmId>,
    pub name: Option<String>,
    /// Only farms with at least this many free public IPs.
    pub free_ips: Option<u32>,
}

impl FarmFilter {
    pub fn by_id(farm_id: FarmId) -> Self {
        Self {
            farm_id: Some(farm_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, farm: &Farm) -> bool {
        self.farm_id.is_none_or(|id| id == farm.farm_id)
            && self.name.as_deref().is_none_or(|n| n == farm.name)
            && self.free_ips.is_none_or(|n| farm.free_public_ips() >= n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grid_core::GIB;

    fn ip(last: u8, contract_id: ContractId) -> FarmPublicIp {
        FarmPublicIp {
            ip: format!("185.69.166.{last}/24").parse().unwrap(),
            gateway: Ipv4Addr::new(185, 69, 166, 1),
            contract_id,
        }
    }

    #[test]
    fn free_capacity_doubles_ssd() {
        let node = NodeInfo {
            node_id: 1,
            farm_id: 1,
            twin_id: 5,
            total: Capacity::new(8, 16 * GIB, 100 * GIB, 1000 * GIB),
            used: Capacity::new(2, 4 * GIB, 150 * GIB, 0),
            public_config: None,
            online: true,
        };
        assert_eq!(
            node.free(),
            Capacity::new(6, 12 * GIB, 50 * GIB, 1000 * GIB)
        );
    }

    #[test]
    fn farm_filter_on_free_ips() {
        let farm = Farm {
            farm_id: 3,
            name: "freefarm".to_string(),
            public_ips: vec![ip(10, 0), ip(11, 7), ip(12, 0)],
        };
        assert_eq!(farm.free_public_ips(), 2);
        assert!(FarmFilter::by_id(3).matches(&farm));
        assert!(!FarmFilter::by_id(4).matches(&farm));
        let wants_three = FarmFilter {
            free_ips: Some(3),
            ..FarmFilter::default()
        };
        assert!(!wants_three.matches(&farm));
    }

    #[test]
    fn public_config_parses_cidr_with_host_bits() {
        let cfg: PublicConfig = serde_json::from_str(
            r#"{"ipv4": "185.69.166.20/24", "gw4": "185.69.166.1", "domain": "gw.example.com"}"#,
        )
        .unwrap();
        assert_eq!(cfg.ipv4.unwrap().addr(), Ipv4Addr::new(185, 69, 166, 20));
        assert!(cfg.has_domain());
        assert!(cfg.ipv6.is_none());
    }
}
