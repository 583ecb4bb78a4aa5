//! Capacity/feasibility validator.
//!
//! Best effort: inventory outages and nodes or farms the inventory cannot
//! resolve are skipped with a warning. The node enforces the real limits
//! at submission time.

use std::collections::BTreeMap;
use std::sync::Arc;

use grid_client::{FarmFilter, InventoryClient, NodeInfo};
use grid_core::{Capacity, Deployment, FarmId, NodeId, WorkloadType};
use tracing::{debug, warn};

use crate::error::FeasibilityError;

pub struct FeasibilityValidator {
    inventory: Arc<dyn InventoryClient>,
}

impl FeasibilityValidator {
    pub fn new(inventory: Arc<dyn InventoryClient>) -> Self {
        Self { inventory }
    }

    /// Check that `new` fits once `old` is replaced.
    ///
    /// Resources and public IPs held by `old` deployments are credited back
    /// before the `new` ones are debited.
    pub async fn validate(
        &self,
        old: &BTreeMap<NodeId, Deployment>,
        new: &BTreeMap<NodeId, Deployment>,
    ) -> Result<(), FeasibilityError> {
        let nodes = self.node_infos(old.keys().chain(new.keys())).await;
        let mut free_ips = self.farm_free_ips(nodes.values().map(|n| n.farm_id)).await;

        for (node, dl) in old {
            if let Some(free) = nodes.get(node).and_then(|n| free_ips.get_mut(&n.farm_id)) {
                *free += i64::from(dl.public_ipv4_count());
            }
        }

        for (&node, dl) in new {
            let Some(info) = nodes.get(&node) else {
                continue;
            };
            let previous = old.get(&node);
            let requested = dl.public_ipv4_count();

            if let Some(previous) = previous {
                let reserved = previous.public_ipv4_count();
                if requested > reserved {
                    return Err(FeasibilityError::PublicIpIncrease {
                        node,
                        contract_id: previous.contract_id,
                        reserved,
                        requested,
                    });
                }
            }

            if let Some(free) = free_ips.get_mut(&info.farm_id) {
                *free -= i64::from(requested);
                if *free < 0 {
                    return Err(FeasibilityError::NotEnoughPublicIps {
                        farm_id: info.farm_id,
                        missing: u32::try_from(-*free).unwrap_or(u32::MAX),
                    });
                }
            }

            check_gateways(info, dl)?;

            let mut free = info.free();
            if let Some(previous) = previous {
                free += previous.capacity();
            }
            let needed = dl.capacity();
            if !fits(&needed, &free) {
                return Err(FeasibilityError::InsufficientCapacity { node, needed, free });
            }
        }
        Ok(())
    }

    async fn node_infos<'a>(
        &self,
        ids: impl Iterator<Item = &'a NodeId>,
    ) -> BTreeMap<NodeId, NodeInfo> {
        let mut infos = BTreeMap::new();
        for &id in ids {
            if infos.contains_key(&id) {
                continue;
            }
            match self.inventory.node(id).await {
                Ok(info) => {
                    infos.insert(id, info);
                }
                Err(e) => warn!(node = id, error = %e, "skipping feasibility checks for node"),
            }
        }
        infos
    }

    async fn farm_free_ips(&self, farms: impl Iterator<Item = FarmId>) -> BTreeMap<FarmId, i64> {
        let mut free = BTreeMap::new();
        for farm_id in farms {
            if free.contains_key(&farm_id) {
                continue;
            }
            match self.inventory.farms(&FarmFilter::by_id(farm_id)).await {
                Ok(farms) => match farms.first() {
                    Some(farm) => {
                        debug!(farm_id, free = farm.free_public_ips(), "farm public ips");
                        free.insert(farm_id, i64::from(farm.free_public_ips()));
                    }
                    None => warn!(farm_id, "farm not found, skipping public ip checks"),
                },
                Err(e) => warn!(farm_id, error = %e, "skipping public ip checks for farm"),
            }
        }
        free
    }
}

fn check_gateways(info: &NodeInfo, dl: &Deployment) -> Result<(), FeasibilityError> {
    let config = info.public_config.as_ref();
    if dl.has_workload_type(WorkloadType::GatewayFqdn) && !config.is_some_and(|c| c.has_ipv4()) {
        return Err(FeasibilityError::NoPublicIpv4 { node: info.node_id });
    }
    if dl.has_workload_type(WorkloadType::GatewayName) && !config.is_some_and(|c| c.has_domain()) {
        return Err(FeasibilityError::NoDomain { node: info.node_id });
    }
    Ok(())
}

fn fits(needed: &Capacity, free: &Capacity) -> bool {
    needed.cru <= free.cru && needed.mru <= free.mru && needed.sru <= free.sru && needed.hru <= free.hru
}

#[cfg(test)]
mod tests {
    use super::*;
    use grid_client::{Farm, FarmPublicIp, MemoryInventory, PublicConfig};
    use grid_core::workload::*;
    use grid_core::{GIB, Workload, WorkloadData};

    fn node(id: NodeId, farm_id: FarmId, public: Option<PublicConfig>) -> NodeInfo {
        NodeInfo {
            node_id: id,
            farm_id,
            twin_id: 1000 + id,
            total: Capacity::new(4, 8 * GIB, 100 * GIB, 500 * GIB),
            used: Capacity::new(1, 2 * GIB, 20 * GIB, 0),
            public_config: public,
            online: true,
        }
    }

    fn farm(farm_id: FarmId, free: u8, taken: u8) -> Farm {
        let ip = |last: u8, contract_id| FarmPublicIp {
            ip: format!("185.206.122.{last}/24").parse().unwrap(),
            gateway: "185.206.122.1".parse().unwrap(),
            contract_id,
        };
        Farm {
            farm_id,
            name: format!("farm{farm_id}"),
            public_ips: (0..free)
                .map(|i| ip(10 + i, 0))
                .chain((0..taken).map(|i| ip(100 + i, 55)))
                .collect(),
        }
    }

    fn ips(count: usize) -> Deployment {
        let workloads = (0..count)
            .map(|i| {
                Workload::new(
                    format!("ip{i}"),
                    WorkloadData::PublicIp(PublicIp { v4: true, v6: false }),
                )
            })
            .collect();
        Deployment::new(1, workloads)
    }

    fn disk(size: u64) -> Deployment {
        Deployment::new(1, vec![Workload::new("disk", WorkloadData::ZMount(ZMount { size }))])
    }

    fn fqdn_gateway() -> Deployment {
        Deployment::new(
            1,
            vec![Workload::new(
                "gw",
                WorkloadData::GatewayFqdn(GatewayFqdnProxy {
                    fqdn: "app.example.com".to_string(),
                    tls_passthrough: false,
                    backends: vec!["http://10.20.2.2:8080".to_string()],
                }),
            )],
        )
    }

    fn validator(inventory: MemoryInventory) -> FeasibilityValidator {
        FeasibilityValidator::new(Arc::new(inventory))
    }

    #[tokio::test]
    async fn not_enough_public_ips() {
        let v = validator(MemoryInventory::new().with_node(node(1, 7, None)).with_farm(farm(7, 1, 3)));
        let new = BTreeMap::from([(1, ips(2))]);
        assert_eq!(
            v.validate(&BTreeMap::new(), &new).await,
            Err(FeasibilityError::NotEnoughPublicIps { farm_id: 7, missing: 1 })
        );
    }

    #[tokio::test]
    async fn released_ips_are_credited_back() {
        let v = validator(
            MemoryInventory::new()
                .with_node(node(1, 7, None))
                .with_node(node(2, 7, None))
                .with_farm(farm(7, 0, 2)),
        );
        let old = BTreeMap::from([(1, ips(1))]);
        let new = BTreeMap::from([(2, ips(1))]);
        v.validate(&old, &new).await.unwrap();
    }

    #[tokio::test]
    async fn public_ips_cannot_grow_on_update() {
        let v = validator(MemoryInventory::new().with_node(node(1, 7, None)).with_farm(farm(7, 5, 0)));
        let mut previous = ips(1);
        previous.contract_id = 42;
        let old = BTreeMap::from([(1, previous)]);
        let new = BTreeMap::from([(1, ips(2))]);
        assert!(matches!(
            v.validate(&old, &new).await,
            Err(FeasibilityError::PublicIpIncrease { contract_id: 42, reserved: 1, requested: 2, .. })
        ));
    }

    #[tokio::test]
    async fn ssd_is_overcommitted_twice() {
        let v = validator(MemoryInventory::new().with_node(node(1, 7, None)));
        // free sru = 2 * 100 - 20 = 180 GiB
        let fits = BTreeMap::from([(1, disk(180 * GIB))]);
        v.validate(&BTreeMap::new(), &fits).await.unwrap();

        let too_big = BTreeMap::from([(1, disk(181 * GIB))]);
        let err = v.validate(&BTreeMap::new(), &too_big).await.unwrap_err();
        assert!(err.to_string().starts_with("node 1 doesn't have enough resources. needed:"));
    }

    #[tokio::test]
    async fn update_credits_back_old_capacity() {
        let v = validator(MemoryInventory::new().with_node(node(1, 7, None)));
        let old = BTreeMap::from([(1, disk(100 * GIB))]);
        let new = BTreeMap::from([(1, disk(250 * GIB))]);
        v.validate(&old, &new).await.unwrap();
    }

    #[tokio::test]
    async fn fqdn_gateway_needs_public_ipv4() {
        let v = validator(MemoryInventory::new().with_node(node(1, 7, None)));
        let new = BTreeMap::from([(1, fqdn_gateway())]);
        assert_eq!(
            v.validate(&BTreeMap::new(), &new).await,
            Err(FeasibilityError::NoPublicIpv4 { node: 1 })
        );

        let public = PublicConfig {
            ipv4: Some("185.206.122.33/24".parse().unwrap()),
            ..PublicConfig::default()
        };
        let v = validator(MemoryInventory::new().with_node(node(1, 7, Some(public))));
        v.validate(&BTreeMap::new(), &new).await.unwrap();
    }

    #[tokio::test]
    async fn name_gateway_needs_domain() {
        let v = validator(MemoryInventory::new().with_node(node(3, 7, Some(PublicConfig::default()))));
        let gw = Deployment::new(
            1,
            vec![Workload::new(
                "gw",
                WorkloadData::GatewayName(GatewayNameProxy {
                    name: "myapp".to_string(),
                    tls_passthrough: false,
                    backends: vec!["http://10.20.2.2:8080".to_string()],
                }),
            )],
        );
        assert_eq!(
            v.validate(&BTreeMap::new(), &BTreeMap::from([(3, gw)])).await,
            Err(FeasibilityError::NoDomain { node: 3 })
        );
    }

    #[tokio::test]
    async fn unknown_nodes_and_outages_are_skipped() {
        let v = validator(MemoryInventory::new());
        let new = BTreeMap::from([(9, disk(10_000 * GIB))]);
        v.validate(&BTreeMap::new(), &new).await.unwrap();

        let inventory = MemoryInventory::new().with_node(node(1, 7, None));
        inventory.set_unavailable(true).await;
        let v = validator(inventory);
        let new = BTreeMap::from([(1, disk(10_000 * GIB))]);
        v.validate(&BTreeMap::new(), &new).await.unwrap();
    }
}
