//! Deployments — the unit of submission to a single node.
//!
//! A deployment bundles workloads under one owner and one contract. Two
//! digests are derived from it:
//!
//! - the **challenge hash** covers versions too; it is what gets signed and
//!   what the ledger stores on the node contract, so a node only accepts a
//!   deployment whose challenge matches its contract.
//! - the **content hash** leaves versions out; the engine compares it to
//!   decide whether an update is needed at all.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{SigningError, ValidationError};
use crate::identity::Identity;
use crate::types::{Capacity, ContractId, TwinId};
use crate::workload::{Workload, WorkloadData, WorkloadType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRequest {
    pub twin_id: TwinId,
    pub required: bool,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub twin_id: TwinId,
    /// Hex-encoded signature of the challenge hash.
    pub signature: String,
    pub signature_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignatureRequirement {
    pub requests: Vec<SignatureRequest>,
    pub weight_required: u32,
    #[serde(default)]
    pub signatures: Vec<Signature>,
}

/// A set of workloads submitted to one node under one contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub version: u32,
    pub twin_id: TwinId,
    /// `0` until a contract exists.
    pub contract_id: ContractId,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub signature_requirement: SignatureRequirement,
    pub workloads: Vec<Workload>,
}

#[derive(Serialize)]
struct WorkloadChallenge<'a> {
    version: Option<u32>,
    name: &'a str,
    data: &'a WorkloadData,
    metadata: &'a str,
    description: &'a str,
}

#[derive(Serialize)]
struct DeploymentChallenge<'a> {
    version: Option<u32>,
    twin_id: TwinId,
    metadata: &'a str,
    description: &'a str,
    workloads: Vec<WorkloadChallenge<'a>>,
    requests: &'a [SignatureRequest],
    weight_required: u32,
}

impl Deployment {
    /// A fresh, unsigned deployment owned by `twin_id`.
    pub fn new(twin_id: TwinId, workloads: Vec<Workload>) -> Self {
        Self {
            version: 0,
            twin_id,
            contract_id: 0,
            metadata: String::new(),
            description: String::new(),
            signature_requirement: SignatureRequirement {
                requests: vec![SignatureRequest {
                    twin_id,
                    required: false,
                    weight: 1,
                }],
                weight_required: 1,
                signatures: Vec::new(),
            },
            workloads,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    fn challenge(&self, with_versions: bool) -> DeploymentChallenge<'_> {
        let version = |v: u32| with_versions.then_some(v);
        DeploymentChallenge {
            version: version(self.version),
            twin_id: self.twin_id,
            metadata: &self.metadata,
            description: &self.description,
            workloads: self
                .workloads
                .iter()
                .map(|w| WorkloadChallenge {
                    version: version(w.version),
                    name: &w.name,
                    data: &w.data,
                    metadata: &w.metadata,
                    description: &w.description,
                })
                .collect(),
            requests: &self.signature_requirement.requests,
            weight_required: self.signature_requirement.weight_required,
        }
    }

    /// Raw sha256 digest of the versioned challenge.
    pub fn challenge_hash(&self) -> Result<[u8; 32], serde_json::Error> {
        let bytes = serde_json::to_vec(&self.challenge(true))?;
        Ok(Sha256::digest(&bytes).into())
    }

    /// Hex form of [`challenge_hash`](Self::challenge_hash), as stored on
    /// the node contract.
    pub fn challenge_hash_hex(&self) -> Result<String, serde_json::Error> {
        Ok(hex::encode(self.challenge_hash()?))
    }

    /// Hex digest of the deployment content with every version left out.
    pub fn content_hash(&self) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(&self.challenge(false))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Per-workload content hashes keyed by workload name.
    pub fn workload_hashes(&self) -> Result<BTreeMap<String, String>, serde_json::Error> {
        self.workloads
            .iter()
            .map(|w| Ok((w.name.clone(), w.content_hash()?)))
            .collect()
    }

    /// Workload versions keyed by workload name.
    pub fn workload_versions(&self) -> BTreeMap<String, u32> {
        self.workloads
            .iter()
            .map(|w| (w.name.clone(), w.version))
            .collect()
    }

    /// Whether both deployments carry exactly the same workload names.
    pub fn same_workload_names(&self, other: &Deployment) -> bool {
        let mine: HashSet<&str> = self.workloads.iter().map(|w| w.name.as_str()).collect();
        let theirs: HashSet<&str> = other.workloads.iter().map(|w| w.name.as_str()).collect();
        mine == theirs
    }

    /// Replace any signatures with `identity`'s signature over the current
    /// challenge. Must be called after the final version is set.
    pub fn sign(&mut self, twin_id: TwinId, identity: &dyn Identity) -> Result<(), SigningError> {
        let hash = self.challenge_hash()?;
        let signature = identity.sign(&hash).map_err(SigningError::Identity)?;
        self.signature_requirement.signatures = vec![Signature {
            twin_id,
            signature: hex::encode(signature),
            signature_type: identity.signature_type().to_string(),
        }];
        Ok(())
    }

    /// Number of public IPv4 addresses the deployment reserves.
    pub fn public_ipv4_count(&self) -> u32 {
        self.workloads.iter().map(Workload::public_ipv4_count).sum()
    }

    /// Total resources the deployment consumes on its node.
    pub fn capacity(&self) -> Capacity {
        self.workloads
            .iter()
            .fold(Capacity::default(), |acc, w| acc + w.capacity())
    }

    pub fn has_workload_type(&self, ty: WorkloadType) -> bool {
        self.workloads.iter().any(|w| w.workload_type() == ty)
    }

    pub fn workload(&self, name: &str) -> Option<&Workload> {
        self.workloads.iter().find(|w| w.name == name)
    }

    /// Reset the deployment and all workload versions to zero.
    pub fn reset_versions(&mut self) {
        self.version = 0;
        for w in &mut self.workloads {
            w.version = 0;
        }
    }

    /// Structural validation: names, versions, payloads and references.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.workloads.is_empty() {
            return Err(ValidationError::Empty);
        }

        let mut names = HashSet::new();
        for w in &self.workloads {
            w.validate()?;
            if !names.insert(w.name.as_str()) {
                return Err(ValidationError::DuplicateName(w.name.clone()));
            }
            if w.version > self.version {
                return Err(ValidationError::VersionRegression {
                    deployment: self.version,
                    workload: w.name.clone(),
                    version: w.version,
                });
            }
        }

        for w in &self.workloads {
            self.validate_references(w)?;
        }
        Ok(())
    }

    fn validate_references(&self, w: &Workload) -> Result<(), ValidationError> {
        let dangling = |kind: &'static str, target: &str| ValidationError::DanglingReference {
            workload: w.name.clone(),
            kind,
            target: target.to_string(),
        };
        let has = |name: &str, types: &[WorkloadType]| {
            self.workload(name)
                .is_some_and(|t| types.contains(&t.workload_type()))
        };

        match &w.data {
            WorkloadData::ZMachine(vm) => {
                if let Some(ip) = &vm.network.public_ip {
                    if !has(ip, &[WorkloadType::PublicIp]) {
                        return Err(dangling("public ip", ip));
                    }
                }
                for mount in &vm.mounts {
                    if !has(&mount.name, &[WorkloadType::ZMount, WorkloadType::Qsfs]) {
                        return Err(dangling("mount", &mount.name));
                    }
                }
                for iface in &vm.network.interfaces {
                    // The network workload usually lives in its own deployment
                    // on the same node, so only same-deployment names that are
                    // not networks are rejected.
                    if let Some(target) = self.workload(&iface.network) {
                        if target.workload_type() != WorkloadType::Network {
                            return Err(dangling("network", &iface.network));
                        }
                    }
                }
                Ok(())
            }
            WorkloadData::ZLogs(logs) => {
                if !has(&logs.zmachine, &[WorkloadType::ZMachine]) {
                    return Err(dangling("vm", &logs.zmachine));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
