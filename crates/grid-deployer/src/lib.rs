//! grid-deployer — reconciles desired deployments onto grid nodes.
//!
//! [`Deployer`] owns the create/update/delete protocol against the ledger
//! and the nodes, including convergence polling and revert on failure.
//! [`fetch_fleet`] reads the live deployments concurrently, and
//! [`FeasibilityValidator`] runs best-effort capacity checks beforehand.

pub mod deployer;
pub mod error;
pub mod fetch;
pub mod poll;
pub mod validator;

pub use deployer::{Deployer, ReconcileOutcome};
pub use error::{DeployerError, DeployerResult, FeasibilityError, FetchError};
pub use fetch::fetch_fleet;
pub use poll::{Backoff, Convergence, ConvergenceFailure, PollOutcome, RetryError, retry};
pub use validator::FeasibilityValidator;
