//! grid-network — wireguard mesh planning.
//!
//! [`MeshPlanner`] turns a previous [`MeshState`] and a set of target
//! nodes into per-node network workloads, choosing a relay for nodes
//! without a public address and, on request, producing a wg-quick
//! config for an external machine. The workloads are regular desired
//! state for `grid-deployer`.

pub mod allocate;
pub mod error;
pub mod keys;
pub mod mesh;
pub mod planner;
pub mod reachability;
pub mod wgquick;

pub use error::{NetworkError, NetworkResult};
pub use keys::WgKeyPair;
pub use mesh::{ExternalMember, MeshState, NodeMember};
pub use planner::{MeshPlan, MeshPlanner};
pub use reachability::Reachability;
