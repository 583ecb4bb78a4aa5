//! Deployment reconciliation engine.
//!
//! [`Deployer::reconcile`] turns a `node → contract` current state and a
//! `node → deployment` desired state into contract and node RPC calls:
//!
//! 1. fetch the live deployments and run the feasibility validator
//!    (skipped when the fetch fails, so dead nodes can still be removed)
//! 2. cancel contracts of nodes no longer desired
//! 3. create contracts and deployments on new nodes
//! 4. update changed deployments, skipping unchanged ones
//! 5. optionally revert to the fetched deployments on failure
//!
//! Writes go one node at a time; each create or update blocks until the
//! node reports convergence.

use std::collections::BTreeMap;
use std::sync::Arc;

use grid_client::node::{DEPLOYMENT_CHANGES, DEPLOYMENT_DEPLOY, DEPLOYMENT_GET, DEPLOYMENT_UPDATE};
use grid_client::{LedgerClient, NodeClient, NodeTransport};
use grid_core::{ContractId, DeployerConfig, Deployment, Identity, NodeId, TwinId};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{DeployerError, DeployerResult, FetchError};
use crate::fetch;
use crate::poll::{self, Backoff, Convergence, ConvergenceFailure, PollOutcome, RetryError};
use crate::validator::FeasibilityValidator;

/// Contracts in place after a reconciliation pass, plus the error that
/// stopped it, if any.
///
/// `applied` always reflects what exists on the ledger, including partial
/// progress made before the error.
#[derive(Debug)]
pub struct ReconcileOutcome {
    pub applied: BTreeMap<NodeId, ContractId>,
    pub error: Option<DeployerError>,
}

impl ReconcileOutcome {
    fn ok(applied: BTreeMap<NodeId, ContractId>) -> Self {
        Self {
            applied,
            error: None,
        }
    }

    fn failed(applied: BTreeMap<NodeId, ContractId>, error: DeployerError) -> Self {
        Self {
            applied,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> DeployerResult<BTreeMap<NodeId, ContractId>> {
        match self.error {
            None => Ok(self.applied),
            Some(e) => Err(e),
        }
    }
}

pub struct Deployer {
    identity: Arc<dyn Identity>,
    twin_id: TwinId,
    ledger: Arc<dyn LedgerClient>,
    transport: Arc<dyn NodeTransport>,
    validator: Option<FeasibilityValidator>,
    config: DeployerConfig,
}

impl Deployer {
    pub fn new(
        identity: Arc<dyn Identity>,
        twin_id: TwinId,
        ledger: Arc<dyn LedgerClient>,
        transport: Arc<dyn NodeTransport>,
    ) -> Self {
        Self {
            identity,
            twin_id,
            ledger,
            transport,
            validator: None,
            config: DeployerConfig::default(),
        }
    }

    pub fn with_validator(mut self, validator: FeasibilityValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_config(mut self, config: DeployerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_revert_on_failure(mut self, revert: bool) -> Self {
        self.config.revert_on_failure = revert;
        self
    }

    pub fn twin_id(&self) -> TwinId {
        self.twin_id
    }

    pub fn transport(&self) -> Arc<dyn NodeTransport> {
        self.transport.clone()
    }

    fn client(&self, node: NodeId) -> NodeClient {
        NodeClient::new(node, self.transport.clone())
    }

    /// Drive the ledger and nodes from `current` to `desired`.
    ///
    /// `solution_provider` is recorded on every contract created.
    pub async fn reconcile(
        &self,
        current: &BTreeMap<NodeId, ContractId>,
        desired: &BTreeMap<NodeId, Deployment>,
        solution_provider: Option<u64>,
    ) -> ReconcileOutcome {
        let previous = match self.fetch_fleet(current).await {
            Ok(previous) => {
                if let Some(validator) = &self.validator {
                    if let Err(e) = validator.validate(&previous, desired).await {
                        return ReconcileOutcome::failed(current.clone(), e.into());
                    }
                }
                Some(previous)
            }
            Err(e) => {
                warn!(error = %e, "could not fetch current deployments, skipping validation");
                None
            }
        };

        if let Err(e) = self.check_balance(desired).await {
            return ReconcileOutcome::failed(current.clone(), e);
        }

        let outcome = self.apply(current, desired, solution_provider).await;
        let (applied, original) = match outcome.error {
            None => return ReconcileOutcome::ok(outcome.applied),
            Some(e) => (outcome.applied, e),
        };
        if !self.config.revert_on_failure {
            return ReconcileOutcome::failed(applied, original);
        }

        let Some(previous) = previous else {
            error!(error = %original, "deployment failed and previous state is unknown, not reverting");
            return ReconcileOutcome::failed(
                applied,
                DeployerError::RevertUnavailable {
                    original: Box::new(original),
                },
            );
        };

        warn!(error = %original, "deployment failed, reverting to previous deployments");
        let reverted = self.apply(&applied, &previous, solution_provider).await;
        match reverted.error {
            None => {
                info!("reverted to previous deployments");
                ReconcileOutcome::failed(reverted.applied, original)
            }
            Some(revert) => {
                error!(error = %revert, "failed to revert deployments");
                ReconcileOutcome::failed(
                    reverted.applied,
                    DeployerError::RevertFailed {
                        original: Box::new(original),
                        revert: Box::new(revert),
                    },
                )
            }
        }
    }

    /// One pass: deletions, then creations, then updates.
    async fn apply(
        &self,
        current: &BTreeMap<NodeId, ContractId>,
        desired: &BTreeMap<NodeId, Deployment>,
        solution_provider: Option<u64>,
    ) -> ReconcileOutcome {
        let mut applied = current.clone();

        for (&node, &contract_id) in current {
            if desired.contains_key(&node) {
                continue;
            }
            match self.ledger.cancel_contract(&*self.identity, contract_id).await {
                Ok(()) => info!(node, contract_id, "canceled contract"),
                Err(e) if e.is_not_found() => {
                    debug!(node, contract_id, "contract already gone");
                }
                Err(source) => {
                    return ReconcileOutcome::failed(
                        applied,
                        DeployerError::Cancel {
                            contract_id,
                            source,
                        },
                    );
                }
            }
            applied.remove(&node);
        }

        for (&node, deployment) in desired {
            if current.contains_key(&node) {
                continue;
            }
            if let Err(e) = self
                .create(node, deployment, solution_provider, &mut applied)
                .await
            {
                return ReconcileOutcome::failed(applied, e);
            }
        }

        for (&node, deployment) in desired {
            let Some(&contract_id) = current.get(&node) else {
                continue;
            };
            if let Err(e) = self.update(node, contract_id, deployment).await {
                return ReconcileOutcome::failed(applied, e);
            }
        }

        ReconcileOutcome::ok(applied)
    }

    /// Deletions only are always allowed; anything else needs funds.
    async fn check_balance(&self, desired: &BTreeMap<NodeId, Deployment>) -> DeployerResult<()> {
        if desired.is_empty() {
            return Ok(());
        }
        let balance = self
            .ledger
            .get_balance(&*self.identity)
            .await
            .map_err(DeployerError::Balance)?;
        let required = self.config.min_balance;
        if balance < required {
            return Err(DeployerError::InsufficientBalance { balance, required });
        }
        Ok(())
    }

    /// Sign, validate and hash `deployment` for submission to `node`.
    fn seal(&self, node: NodeId, deployment: &mut Deployment) -> DeployerResult<String> {
        deployment
            .sign(self.twin_id, &*self.identity)
            .map_err(|source| DeployerError::Signing { node, source })?;
        deployment
            .validate()
            .map_err(|source| DeployerError::Invalid { node, source })?;
        deployment
            .challenge_hash_hex()
            .map_err(|source| DeployerError::Encoding { node, source })
    }

    async fn create(
        &self,
        node: NodeId,
        desired: &Deployment,
        solution_provider: Option<u64>,
        applied: &mut BTreeMap<NodeId, ContractId>,
    ) -> DeployerResult<()> {
        let mut deployment = desired.clone();
        deployment.reset_versions();
        deployment.contract_id = 0;
        let hash = self.seal(node, &mut deployment)?;
        let public_ips = deployment.public_ipv4_count();

        let contract_id = self
            .ledger
            .create_node_contract(
                &*self.identity,
                node,
                &deployment.metadata,
                &hash,
                public_ips,
                solution_provider,
            )
            .await
            .map_err(|source| DeployerError::Ledger {
                node,
                action: "create",
                source,
            })?;
        info!(node, contract_id, public_ips, "created node contract");
        deployment.contract_id = contract_id;

        if let Err(submit) = self.submit(node, DEPLOYMENT_DEPLOY, &deployment).await {
            warn!(node, contract_id, error = %submit, "deployment rejected, canceling contract");
            return Err(
                match self.ledger.cancel_contract(&*self.identity, contract_id).await {
                    Ok(()) => DeployerError::Rejected {
                        node,
                        contract_id,
                        source: Box::new(submit),
                    },
                    Err(e) if e.is_not_found() => {
                        debug!(node, contract_id, "contract already gone");
                        DeployerError::Rejected {
                            node,
                            contract_id,
                            source: Box::new(submit),
                        }
                    }
                    Err(cancel) => {
                        error!(node, contract_id, error = %cancel, "failed to cancel contract");
                        DeployerError::DanglingContract {
                            node,
                            contract_id,
                            source: Box::new(submit),
                            cancel,
                        }
                    }
                },
            );
        }
        applied.insert(node, contract_id);
        info!(node, contract_id, "deployment submitted");

        self.wait(node, contract_id, deployment.workload_versions())
            .await
    }

    async fn update(
        &self,
        node: NodeId,
        contract_id: ContractId,
        desired: &Deployment,
    ) -> DeployerResult<()> {
        let live = self.get(node, contract_id).await?;
        let encoding = |source| DeployerError::Encoding { node, source };

        if live.content_hash().map_err(encoding)? == desired.content_hash().map_err(encoding)?
            && live.same_workload_names(desired)
        {
            debug!(node, contract_id, "deployment unchanged, skipping update");
            return Ok(());
        }

        let mut deployment = desired.clone();
        deployment.contract_id = contract_id;
        deployment.version = live.version + 1;
        let live_hashes = live.workload_hashes().map_err(encoding)?;
        for w in &mut deployment.workloads {
            let unchanged = live_hashes.get(&w.name).is_some_and(|old| {
                w.content_hash().is_ok_and(|new| new == *old)
            });
            w.version = match live.workload(&w.name) {
                Some(old) if unchanged => old.version,
                _ => deployment.version,
            };
        }

        let hash = self.seal(node, &mut deployment)?;
        self.ledger
            .update_node_contract(&*self.identity, contract_id, &deployment.metadata, &hash)
            .await
            .map_err(|source| DeployerError::Ledger {
                node,
                action: "update",
                source,
            })?;
        info!(node, contract_id, version = deployment.version, "updated node contract");

        self.submit(node, DEPLOYMENT_UPDATE, &deployment).await?;
        info!(node, contract_id, "deployment update submitted");

        self.wait(node, contract_id, deployment.workload_versions())
            .await
    }

    async fn submit(
        &self,
        node: NodeId,
        method: &'static str,
        deployment: &Deployment,
    ) -> DeployerResult<()> {
        let client = self.client(node);
        let timeout = self.config.submit_timeout();
        let contract_id = deployment.contract_id;
        let call = async {
            if method == DEPLOYMENT_UPDATE {
                client.deployment_update(deployment).await
            } else {
                client.deployment_deploy(deployment).await
            }
        };
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(DeployerError::Rpc {
                node,
                contract_id,
                method,
                source,
            }),
            Err(_) => Err(DeployerError::Timeout {
                node,
                contract_id,
                method,
                timeout,
            }),
        }
    }

    async fn get(&self, node: NodeId, contract_id: ContractId) -> DeployerResult<Deployment> {
        let timeout = self.config.fetch_timeout();
        match tokio::time::timeout(timeout, self.client(node).deployment_get(contract_id)).await {
            Ok(Ok(deployment)) => Ok(deployment),
            Ok(Err(source)) => Err(DeployerError::Rpc {
                node,
                contract_id,
                method: DEPLOYMENT_GET,
                source,
            }),
            Err(_) => Err(DeployerError::Timeout {
                node,
                contract_id,
                method: DEPLOYMENT_GET,
                timeout,
            }),
        }
    }

    /// Block until every workload in `expected` reports `ok` at its version.
    ///
    /// Change-feed errors are transient. A failed workload or a stall of
    /// `poll.stall_timeout` without new `ok` workloads ends polling early.
    pub async fn wait(
        &self,
        node: NodeId,
        contract_id: ContractId,
        expected: BTreeMap<String, u32>,
    ) -> DeployerResult<()> {
        let poll_config = &self.config.poll;
        let backoff = Backoff::from_config(poll_config);
        let stall = poll_config.stall_timeout();
        let probe_timeout = self.config.fetch_timeout();
        let client = &self.client(node);
        let convergence = Convergence::new(expected, stall);
        let total = convergence.total();
        let convergence = &Mutex::new(convergence);

        let result = poll::retry(&backoff, move || {
            let changes = tokio::time::timeout(probe_timeout, client.deployment_changes(contract_id));
            async move {
                match changes.await {
                    Ok(Ok(workloads)) => convergence.lock().await.observe(&workloads),
                    Ok(Err(e)) => {
                        warn!(node, contract_id, method = DEPLOYMENT_CHANGES, error = %e, "poll failed, retrying");
                        PollOutcome::Continue
                    }
                    Err(_) => {
                        warn!(node, contract_id, method = DEPLOYMENT_CHANGES, "poll timed out, retrying");
                        PollOutcome::Continue
                    }
                }
            }
        })
        .await;

        match result {
            Ok(()) => {
                info!(node, contract_id, workloads = total, "deployment converged");
                Ok(())
            }
            Err(RetryError::Permanent(ConvergenceFailure::Workload {
                name,
                state,
                message,
            })) => Err(DeployerError::WorkloadFailed {
                node,
                contract_id,
                workload: name,
                state,
                message,
            }),
            Err(RetryError::Permanent(ConvergenceFailure::Stalled { ok, total })) => {
                Err(DeployerError::Stalled {
                    node,
                    contract_id,
                    window: stall,
                    ok,
                    total,
                })
            }
            Err(RetryError::Exhausted { .. }) => Err(DeployerError::DeadlineExceeded {
                node,
                contract_id,
                budget: backoff.max_elapsed,
            }),
        }
    }

    /// Cancel a single contract. A contract that is already gone is an
    /// error here.
    pub async fn cancel_one(&self, contract_id: ContractId) -> DeployerResult<()> {
        self.ledger
            .cancel_contract(&*self.identity, contract_id)
            .await
            .map_err(|source| DeployerError::Cancel {
                contract_id,
                source,
            })?;
        info!(contract_id, "canceled contract");
        Ok(())
    }

    /// Fetch the live deployment for every `node → contract` entry.
    pub async fn fetch_fleet(
        &self,
        current: &BTreeMap<NodeId, ContractId>,
    ) -> Result<BTreeMap<NodeId, Deployment>, FetchError> {
        fetch::fetch_fleet(self.transport.clone(), current, self.config.fetch_timeout()).await
    }
}
