//! Workloads — the typed units that make up a deployment.
//!
//! A workload's identity is its name. Its payload is a closed sum type over
//! every kind of workload a node understands, so conversions and checks are
//! exhaustive matches rather than dynamic type lookups.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ValidationError;
use crate::types::{Capacity, MIB};

/// Smallest memory a virtual machine may request.
pub const MIN_VM_MEMORY: u64 = 250 * MIB;

/// Memory reserved on the node for a QSFS daemon.
const QSFS_MEMORY: u64 = 256 * MIB;

const MAX_NAME_LEN: usize = 50;

/// Discriminant of [`WorkloadData`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadType {
    ZMachine,
    ZMount,
    Zdb,
    GatewayName,
    GatewayFqdn,
    Network,
    PublicIp,
    Qsfs,
    ZLogs,
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadType::ZMachine => "zmachine",
            WorkloadType::ZMount => "zmount",
            WorkloadType::Zdb => "zdb",
            WorkloadType::GatewayName => "gateway-name-proxy",
            WorkloadType::GatewayFqdn => "gateway-fqdn-proxy",
            WorkloadType::Network => "network",
            WorkloadType::PublicIp => "ip",
            WorkloadType::Qsfs => "qsfs",
            WorkloadType::ZLogs => "zlogs",
        };
        f.write_str(s)
    }
}

/// Type-specific payload of a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkloadData {
    ZMachine(ZMachine),
    ZMount(ZMount),
    Zdb(Zdb),
    GatewayName(GatewayNameProxy),
    GatewayFqdn(GatewayFqdnProxy),
    Network(Network),
    PublicIp(PublicIp),
    Qsfs(Qsfs),
    ZLogs(ZLogs),
}

/// A virtual machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZMachine {
    pub flist: String,
    pub network: MachineNetwork,
    /// Root filesystem size in bytes.
    pub size: u64,
    pub compute: ComputeCapacity,
    #[serde(default)]
    pub mounts: Vec<MachineMount>,
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub corex: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeCapacity {
    pub cpu: u8,
    /// Memory in bytes.
    pub memory: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MachineNetwork {
    /// Name of a public-IP workload in the same deployment.
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub planetary: bool,
    #[serde(default)]
    pub interfaces: Vec<MachineInterface>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineInterface {
    /// Name of a network workload in the same deployment.
    pub network: String,
    pub ip: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineMount {
    /// Name of a disk (or qsfs) workload in the same deployment.
    pub name: String,
    pub mountpoint: String,
}

/// A raw disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZMount {
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZdbMode {
    User,
    Seq,
}

/// A 0-db namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zdb {
    pub size: u64,
    pub mode: ZdbMode,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub public: bool,
}

/// A gateway exposing backends under a node-managed domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayNameProxy {
    pub name: String,
    #[serde(default)]
    pub tls_passthrough: bool,
    pub backends: Vec<String>,
}

/// A gateway exposing backends under a caller-owned domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayFqdnProxy {
    pub fqdn: String,
    #[serde(default)]
    pub tls_passthrough: bool,
    pub backends: Vec<String>,
}

/// One node's slice of a wireguard overlay network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    /// The whole mesh range (a /16).
    pub ip_range: Ipv4Net,
    /// This node's /24 inside `ip_range`.
    pub subnet: Ipv4Net,
    pub wireguard_private_key: String,
    pub wireguard_listen_port: u16,
    #[serde(default)]
    pub peers: Vec<Peer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub subnet: Ipv4Net,
    pub wireguard_public_key: String,
    pub allowed_ips: Vec<Ipv4Net>,
    /// `host:port`, empty when the peer dials in.
    #[serde(default)]
    pub endpoint: String,
}

/// A reservation of public addresses from the node's farm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicIp {
    pub v4: bool,
    pub v6: bool,
}

/// A quantum-safe filesystem backed by zdb shards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Qsfs {
    /// Local cache size in bytes.
    pub cache: u64,
    pub minimal_shards: u32,
    pub expected_shards: u32,
    #[serde(default)]
    pub encryption_key: String,
    #[serde(default)]
    pub groups: Vec<QsfsGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QsfsGroup {
    pub backends: Vec<QsfsBackend>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QsfsBackend {
    pub address: String,
    pub namespace: String,
    #[serde(default)]
    pub password: String,
}

/// Ships a VM's logs to a websocket endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZLogs {
    /// Name of a VM workload in the same deployment.
    pub zmachine: String,
    pub output: String,
}

/// State reported by a node for a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultState {
    /// Not processed yet.
    #[default]
    Init,
    Ok,
    Error,
    Deleted,
    Paused,
    Unchanged,
}

impl ResultState {
    /// Whether a workload in this state will never become `Ok` at its
    /// current version.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ResultState::Error | ResultState::Deleted | ResultState::Paused | ResultState::Unchanged
        )
    }
}

impl fmt::Display for ResultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultState::Init => "init",
            ResultState::Ok => "ok",
            ResultState::Error => "error",
            ResultState::Deleted => "deleted",
            ResultState::Paused => "paused",
            ResultState::Unchanged => "unchanged",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkloadResult {
    pub state: ResultState,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub created: u64,
}

/// A named, versioned unit inside a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub version: u32,
    pub name: String,
    pub data: WorkloadData,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub result: WorkloadResult,
}

/// The version-agnostic fields of a workload, in hashing order.
#[derive(Serialize)]
struct WorkloadContent<'a> {
    name: &'a str,
    data: &'a WorkloadData,
    metadata: &'a str,
    description: &'a str,
}

impl Workload {
    pub fn new(name: impl Into<String>, data: WorkloadData) -> Self {
        Self {
            version: 0,
            name: name.into(),
            data,
            metadata: String::new(),
            description: String::new(),
            result: WorkloadResult::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn workload_type(&self) -> WorkloadType {
        self.data.workload_type()
    }

    /// Hex sha256 of everything the caller controls except the version.
    ///
    /// Two workloads with equal content hashes are the same deployment
    /// intent; the node-assigned result is never part of it.
    pub fn content_hash(&self) -> Result<String, serde_json::Error> {
        let content = WorkloadContent {
            name: &self.name,
            data: &self.data,
            metadata: &self.metadata,
            description: &self.description,
        };
        let bytes = serde_json::to_vec(&content)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Resources this workload consumes on its node.
    pub fn capacity(&self) -> Capacity {
        self.data.capacity()
    }

    /// Number of public IPv4 addresses this workload reserves.
    pub fn public_ipv4_count(&self) -> u32 {
        match &self.data {
            WorkloadData::PublicIp(ip) if ip.v4 => 1,
            _ => 0,
        }
    }

    /// Structural validation of the name and payload.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_name(&self.name) {
            return Err(ValidationError::InvalidName(self.name.clone()));
        }
        self.data.validate(&self.name)
    }
}

impl WorkloadData {
    pub fn workload_type(&self) -> WorkloadType {
        match self {
            WorkloadData::ZMachine(_) => WorkloadType::ZMachine,
            WorkloadData::ZMount(_) => WorkloadType::ZMount,
            WorkloadData::Zdb(_) => WorkloadType::Zdb,
            WorkloadData::GatewayName(_) => WorkloadType::GatewayName,
            WorkloadData::GatewayFqdn(_) => WorkloadType::GatewayFqdn,
            WorkloadData::Network(_) => WorkloadType::Network,
            WorkloadData::PublicIp(_) => WorkloadType::PublicIp,
            WorkloadData::Qsfs(_) => WorkloadType::Qsfs,
            WorkloadData::ZLogs(_) => WorkloadType::ZLogs,
        }
    }

    pub fn capacity(&self) -> Capacity {
        match self {
            WorkloadData::ZMachine(vm) => {
                Capacity::new(u64::from(vm.compute.cpu), vm.compute.memory, vm.size, 0)
            }
            WorkloadData::ZMount(disk) => Capacity::new(0, 0, disk.size, 0),
            WorkloadData::Zdb(zdb) => Capacity::new(0, 0, 0, zdb.size),
            WorkloadData::Qsfs(qsfs) => Capacity::new(1, QSFS_MEMORY, qsfs.cache, 0),
            WorkloadData::GatewayName(_)
            | WorkloadData::GatewayFqdn(_)
            | WorkloadData::Network(_)
            | WorkloadData::PublicIp(_)
            | WorkloadData::ZLogs(_) => Capacity::default(),
        }
    }

    fn validate(&self, name: &str) -> Result<(), ValidationError> {
        let fail = |reason: &str| Err(ValidationError::workload(name, reason));
        match self {
            WorkloadData::ZMachine(vm) => {
                if vm.flist.is_empty() {
                    return fail("flist is required");
                }
                if vm.compute.cpu == 0 {
                    return fail("at least one cpu is required");
                }
                if vm.compute.memory < MIN_VM_MEMORY {
                    return fail("memory must be at least 250 MiB");
                }
                for mount in &vm.mounts {
                    if !mount.mountpoint.starts_with('/') {
                        return fail("mountpoints must be absolute paths");
                    }
                }
                Ok(())
            }
            WorkloadData::ZMount(disk) => {
                if disk.size == 0 {
                    return fail("disk size must be positive");
                }
                Ok(())
            }
            WorkloadData::Zdb(zdb) => {
                if zdb.size == 0 {
                    return fail("zdb size must be positive");
                }
                Ok(())
            }
            WorkloadData::GatewayName(gw) => {
                if gw.name.is_empty() {
                    return fail("gateway name is required");
                }
                validate_backends(name, &gw.backends)
            }
            WorkloadData::GatewayFqdn(gw) => {
                if gw.fqdn.is_empty() || !gw.fqdn.contains('.') {
                    return fail("fqdn must be a dotted domain name");
                }
                validate_backends(name, &gw.backends)
            }
            WorkloadData::Network(net) => validate_network(name, net),
            WorkloadData::PublicIp(_) => Ok(()),
            WorkloadData::Qsfs(qsfs) => {
                if qsfs.cache == 0 {
                    return fail("qsfs cache size must be positive");
                }
                if qsfs.minimal_shards == 0 || qsfs.minimal_shards > qsfs.expected_shards {
                    return fail("minimal shards must be between 1 and expected shards");
                }
                Ok(())
            }
            WorkloadData::ZLogs(logs) => {
                if logs.zmachine.is_empty() {
                    return fail("log shipper must name a vm");
                }
                if !(logs.output.starts_with("ws://") || logs.output.starts_with("wss://")) {
                    return fail("log output must be a ws:// or wss:// url");
                }
                Ok(())
            }
        }
    }
}

fn validate_backends(name: &str, backends: &[String]) -> Result<(), ValidationError> {
    if backends.is_empty() {
        return Err(ValidationError::workload(name, "at least one backend is required"));
    }
    for backend in backends {
        if !(backend.starts_with("http://") || backend.starts_with("https://")) {
            return Err(ValidationError::workload(
                name,
                format!("backend {backend:?} must be an http(s) url"),
            ));
        }
    }
    Ok(())
}

fn validate_network(name: &str, net: &Network) -> Result<(), ValidationError> {
    if net.ip_range.prefix_len() != 16 {
        return Err(ValidationError::workload(name, "network ip range must be a /16"));
    }
    if net.subnet.prefix_len() != 24 || !net.ip_range.contains(&net.subnet) {
        return Err(ValidationError::workload(
            name,
            format!("subnet {} must be a /24 inside {}", net.subnet, net.ip_range),
        ));
    }
    if net.wireguard_private_key.is_empty() {
        return Err(ValidationError::workload(name, "wireguard private key is required"));
    }
    if net.wireguard_listen_port == 0 {
        return Err(ValidationError::workload(name, "wireguard listen port is required"));
    }
    for peer in &net.peers {
        if peer.wireguard_public_key.is_empty() {
            return Err(ValidationError::workload(
                name,
                format!("peer {} has no public key", peer.subnet),
            ));
        }
        if peer.allowed_ips.is_empty() {
            return Err(ValidationError::workload(
                name,
                format!("peer {} has no allowed ips", peer.subnet),
            ));
        }
    }
    Ok(())
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GIB;

    fn vm(name: &str) -> Workload {
        Workload::new(
            name,
            WorkloadData::ZMachine(ZMachine {
                flist: "https://hub.grid.tf/ubuntu-22.04.flist".to_string(),
                network: MachineNetwork::default(),
                size: 10 * GIB,
                compute: ComputeCapacity {
                    cpu: 2,
                    memory: 2 * GIB,
                },
                mounts: Vec::new(),
                entrypoint: "/sbin/init".to_string(),
                env: BTreeMap::new(),
                corex: false,
            }),
        )
    }

    #[test]
    fn content_hash_ignores_version_and_result() {
        let a = vm("web");
        let mut b = a.clone();
        b.version = 7;
        b.result.state = ResultState::Ok;
        b.result.created = 1_700_000_000;
        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());
    }

    #[test]
    fn content_hash_tracks_payload() {
        let a = vm("web");
        let mut b = a.clone();
        if let WorkloadData::ZMachine(m) = &mut b.data {
            m.compute.cpu = 4;
        }
        assert_ne!(a.content_hash().unwrap(), b.content_hash().unwrap());
    }

    #[test]
    fn vm_capacity() {
        assert_eq!(vm("web").capacity(), Capacity::new(2, 2 * GIB, 10 * GIB, 0));
    }

    #[test]
    fn zdb_uses_hdd() {
        let w = Workload::new(
            "db",
            WorkloadData::Zdb(Zdb {
                size: 5 * GIB,
                mode: ZdbMode::User,
                password: String::new(),
                public: false,
            }),
        );
        assert_eq!(w.capacity(), Capacity::new(0, 0, 0, 5 * GIB));
    }

    #[test]
    fn public_ipv4_counted_only_for_v4() {
        let v4 = Workload::new("ip", WorkloadData::PublicIp(PublicIp { v4: true, v6: true }));
        let v6 = Workload::new("ip6", WorkloadData::PublicIp(PublicIp { v4: false, v6: true }));
        assert_eq!(v4.public_ipv4_count(), 1);
        assert_eq!(v6.public_ipv4_count(), 0);
        assert_eq!(vm("web").public_ipv4_count(), 0);
    }

    #[test]
    fn invalid_names_rejected() {
        for name in ["", "has space", "dash-ed", &"x".repeat(51)] {
            let mut w = vm("ok");
            w.name = name.to_string();
            assert_eq!(w.validate(), Err(ValidationError::InvalidName(name.to_string())));
        }
    }

    #[test]
    fn vm_needs_memory() {
        let mut w = vm("web");
        if let WorkloadData::ZMachine(m) = &mut w.data {
            m.compute.memory = 100 * MIB;
        }
        assert!(matches!(w.validate(), Err(ValidationError::InvalidWorkload { .. })));
    }

    #[test]
    fn gateway_backends_must_be_urls() {
        let w = Workload::new(
            "gw",
            WorkloadData::GatewayName(GatewayNameProxy {
                name: "mysite".to_string(),
                tls_passthrough: false,
                backends: vec!["10.1.2.3:80".to_string()],
            }),
        );
        assert!(w.validate().is_err());
    }

    #[test]
    fn network_subnet_must_sit_in_range() {
        let w = Workload::new(
            "net",
            WorkloadData::Network(Network {
                ip_range: "10.1.0.0/16".parse().unwrap(),
                subnet: "10.2.2.0/24".parse().unwrap(),
                wireguard_private_key: "key".to_string(),
                wireguard_listen_port: 5000,
                peers: Vec::new(),
            }),
        );
        assert!(w.validate().is_err());
    }

    #[test]
    fn failure_states() {
        assert!(ResultState::Error.is_failure());
        assert!(ResultState::Unchanged.is_failure());
        assert!(!ResultState::Ok.is_failure());
        assert!(!ResultState::Init.is_failure());
    }

    #[test]
    fn payload_serializes_with_type_tag() {
        let w = Workload::new("ip", WorkloadData::PublicIp(PublicIp { v4: true, v6: false }));
        let json = serde_json::to_value(&w).unwrap();
        assert_eq!(json["data"]["type"], "public_ip");
        assert_eq!(json["data"]["v4"], true);
    }
}
