//! Remote fleet fetcher: one task per node, joined before returning.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use grid_client::{NodeClient, NodeTransport, RpcError};
use grid_core::{ContractId, Deployment, NodeId};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::FetchError;

#[derive(Default)]
struct Collected {
    fetched: BTreeMap<NodeId, Deployment>,
    failures: BTreeMap<NodeId, RpcError>,
}

/// Fetch the live deployment behind every `node → contract` entry.
///
/// Each node gets its own task bounded by `timeout`. A failing node never
/// hides the others: the error carries everything that was fetched.
pub async fn fetch_fleet(
    transport: Arc<dyn NodeTransport>,
    current: &BTreeMap<NodeId, ContractId>,
    timeout: Duration,
) -> Result<BTreeMap<NodeId, Deployment>, FetchError> {
    let collected = Arc::new(Mutex::new(Collected::default()));

    let mut handles = Vec::with_capacity(current.len());
    for (&node, &contract_id) in current {
        let client = NodeClient::new(node, transport.clone());
        let collected = collected.clone();
        let handle = tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, client.deployment_get(contract_id)).await {
                Ok(result) => result,
                Err(_) => Err(RpcError::Timeout {
                    node,
                    method: grid_client::node::DEPLOYMENT_GET.to_string(),
                }),
            };
            let mut collected = collected.lock().await;
            match result {
                Ok(deployment) => {
                    debug!(node, contract_id, "fetched deployment");
                    collected.fetched.insert(node, deployment);
                }
                Err(e) => {
                    warn!(node, contract_id, error = %e, "failed to fetch deployment");
                    collected.failures.insert(node, e);
                }
            }
        });
        handles.push((node, handle));
    }

    for (node, handle) in handles {
        if let Err(e) = handle.await {
            collected.lock().await.failures.insert(
                node,
                RpcError::Remote {
                    node,
                    method: grid_client::node::DEPLOYMENT_GET.to_string(),
                    message: format!("fetch task aborted: {e}"),
                },
            );
        }
    }

    let collected = std::mem::take(&mut *collected.lock().await);
    if collected.failures.is_empty() {
        Ok(collected.fetched)
    } else {
        Err(FetchError {
            fetched: collected.fetched,
            failures: collected.failures,
        })
    }
}
