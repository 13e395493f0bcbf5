use super::crd::{NodeRefresh, NodeRefreshStatus};
use super::error::{self, Result};
use crate::constants;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::collections::BTreeMap;
use tokio::time::{timeout, Duration};
use tracing::{event, instrument, Level};

#[cfg(feature = "mockall")]
use mockall::mock;

// Upper bound on any single call to the cluster API. Calls that exceed it surface as errors
// rather than stalling the reconcile.
const API_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// A trait providing typed access to the cluster state the refresh controller acts on. This is
/// provided as a trait in order to allow mocks to be used for testing purposes. It translates
/// between the Kubernetes API and our domain; policy lives with the callers.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch the authoritative copy of a `NodeRefresh` object.
    async fn get_node_refresh(&self, name: &str) -> Result<NodeRefresh>;
    /// Update the `/status` subresource of a `NodeRefresh`. Spec writes never go through here,
    /// so the merge cannot clobber user intent.
    async fn update_node_refresh_status(&self, name: &str, status: &NodeRefreshStatus)
        -> Result<()>;
    /// List the nodes carrying every one of the given labels.
    async fn list_nodes_by_labels(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Node>>;
    /// List every node in the cluster.
    async fn list_all_nodes(&self) -> Result<Vec<Node>>;
    /// List every pod in the cluster, across all namespaces.
    async fn list_all_pods(&self) -> Result<Vec<Pod>>;
    /// List the pods scheduled to the named node.
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;
    /// List the PodDisruptionBudgets in a namespace.
    async fn list_disruption_budgets(&self, namespace: &str) -> Result<Vec<PodDisruptionBudget>>;
    /// Create an eviction for the given pod with the given grace period.
    async fn evict_pod(&self, pod: &Pod, grace_period_seconds: u32) -> Result<()>;
    /// Read a ReplicaSet, or None when it no longer exists.
    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<Option<ReplicaSet>>;
    /// Read a StatefulSet, or None when it no longer exists.
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock ClusterClient for use in tests.
    pub ClusterClient {}
    #[async_trait]
    impl ClusterClient for ClusterClient {
        async fn get_node_refresh(&self, name: &str) -> Result<NodeRefresh>;
        async fn update_node_refresh_status(
            &self,
            name: &str,
            status: &NodeRefreshStatus,
        ) -> Result<()>;
        async fn list_nodes_by_labels(
            &self,
            labels: &BTreeMap<String, String>,
        ) -> Result<Vec<Node>>;
        async fn list_all_nodes(&self) -> Result<Vec<Node>>;
        async fn list_all_pods(&self) -> Result<Vec<Pod>>;
        async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;
        async fn list_disruption_budgets(
            &self,
            namespace: &str,
        ) -> Result<Vec<PodDisruptionBudget>>;
        async fn evict_pod(&self, pod: &Pod, grace_period_seconds: u32) -> Result<()>;
        async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<Option<ReplicaSet>>;
        async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;
    }
}

/// Concrete implementation of the `ClusterClient` trait. This implementation will almost
/// certainly be used in any case that isn't a unit test.
#[derive(Clone)]
pub struct K8sClusterClient {
    k8s_client: kube::client::Client,
}

impl K8sClusterClient {
    pub fn new(k8s_client: kube::client::Client) -> Self {
        K8sClusterClient { k8s_client }
    }
}

/// A helper struct used to serialize and send patches to the k8s API to modify the status of a
/// NodeRefresh.
#[derive(Debug, Serialize, Deserialize)]
struct NodeRefreshStatusPatch {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    status: NodeRefreshStatus,
}

impl Default for NodeRefreshStatusPatch {
    fn default() -> Self {
        NodeRefreshStatusPatch {
            api_version: constants::API_VERSION.to_string(),
            kind: constants::K8S_REFRESH_KIND.to_string(),
            status: NodeRefreshStatus::default(),
        }
    }
}

/// Creates a kube::Api<Pod> for interacting with Pods in the namespace associated with the given Pod.
fn namespaced_pod_api(k8s_client: &kube::Client, pod: &Pod) -> Api<Pod> {
    match pod.metadata.namespace.as_ref() {
        Some(ns) => Api::namespaced(k8s_client.clone(), ns),
        None => Api::default_namespaced(k8s_client.clone()),
    }
}

#[async_trait]
impl ClusterClient for K8sClusterClient {
    #[instrument(skip(self), err)]
    async fn get_node_refresh(&self, name: &str) -> Result<NodeRefresh> {
        let api: Api<NodeRefresh> = Api::all(self.k8s_client.clone());
        timeout(API_CALL_TIMEOUT, api.get(name))
            .await
            .context(error::ApiTimeoutSnafu {
                operation: "get noderefresh",
            })?
            .context(error::GetNodeRefreshSnafu { name })
    }

    #[instrument(skip(self, status), err)]
    async fn update_node_refresh_status(
        &self,
        name: &str,
        status: &NodeRefreshStatus,
    ) -> Result<()> {
        let status_patch = NodeRefreshStatusPatch {
            status: status.clone(),
            ..Default::default()
        };
        let status_patch = serde_json::to_value(status_patch).context(error::CreateK8SPatchSnafu)?;

        let api: Api<NodeRefresh> = Api::all(self.k8s_client.clone());
        let first_attempt = timeout(
            API_CALL_TIMEOUT,
            api.patch_status(name, &PatchParams::default(), &Patch::Merge(&status_patch)),
        )
        .await
        .context(error::ApiTimeoutSnafu {
            operation: "patch noderefresh status",
        })?;

        match first_attempt {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                // A conflicting writer got in first. Refresh our view of the object and retry
                // once; a second conflict defers to the next reconcile.
                event!(
                    Level::WARN,
                    "Conflict while updating status for NodeRefresh '{}'. Retrying once.",
                    name
                );
                timeout(API_CALL_TIMEOUT, api.get(name))
                    .await
                    .context(error::ApiTimeoutSnafu {
                        operation: "get noderefresh",
                    })?
                    .context(error::GetNodeRefreshSnafu { name })?;
                timeout(
                    API_CALL_TIMEOUT,
                    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&status_patch)),
                )
                .await
                .context(error::ApiTimeoutSnafu {
                    operation: "patch noderefresh status",
                })?
                .map(|_| ())
                .context(error::UpdateNodeRefreshStatusSnafu { name })
            }
            Err(e) => Err(e).context(error::UpdateNodeRefreshStatusSnafu { name }),
        }
    }

    #[instrument(skip(self), err)]
    async fn list_nodes_by_labels(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Node>> {
        let selector = labels
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join(",");
        let api: Api<Node> = Api::all(self.k8s_client.clone());
        let nodes = timeout(
            API_CALL_TIMEOUT,
            api.list(&ListParams::default().labels(&selector)),
        )
        .await
        .context(error::ApiTimeoutSnafu {
            operation: "list nodes by labels",
        })?
        .context(error::ListNodesSnafu)?;
        Ok(nodes.items)
    }

    #[instrument(skip(self), err)]
    async fn list_all_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.k8s_client.clone());
        let nodes = timeout(API_CALL_TIMEOUT, api.list(&ListParams::default()))
            .await
            .context(error::ApiTimeoutSnafu {
                operation: "list nodes",
            })?
            .context(error::ListNodesSnafu)?;
        Ok(nodes.items)
    }

    #[instrument(skip(self), err)]
    async fn list_all_pods(&self) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.k8s_client.clone());
        let pods = timeout(API_CALL_TIMEOUT, api.list(&ListParams::default()))
            .await
            .context(error::ApiTimeoutSnafu {
                operation: "list pods",
            })?
            .context(error::ListPodsSnafu)?;
        Ok(pods.items)
    }

    #[instrument(skip(self), err)]
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.k8s_client.clone());
        let params =
            ListParams::default().fields(&format!("spec.nodeName={}", node_name));
        let pods = timeout(API_CALL_TIMEOUT, api.list(&params))
            .await
            .context(error::ApiTimeoutSnafu {
                operation: "list pods on node",
            })?
            .context(error::ListPodsSnafu)?;
        Ok(pods.items)
    }

    #[instrument(skip(self), err)]
    async fn list_disruption_budgets(&self, namespace: &str) -> Result<Vec<PodDisruptionBudget>> {
        let api: Api<PodDisruptionBudget> = Api::namespaced(self.k8s_client.clone(), namespace);
        let budgets = timeout(API_CALL_TIMEOUT, api.list(&ListParams::default()))
            .await
            .context(error::ApiTimeoutSnafu {
                operation: "list poddisruptionbudgets",
            })?
            .context(error::ListDisruptionBudgetsSnafu { namespace })?;
        Ok(budgets.items)
    }

    #[instrument(skip(self, pod), fields(pod_name = %pod.name_any()), err)]
    async fn evict_pod(&self, pod: &Pod, grace_period_seconds: u32) -> Result<()> {
        let pod_api = namespaced_pod_api(&self.k8s_client, pod);
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: Some(grace_period_seconds),
                ..Default::default()
            }),
            ..Default::default()
        };
        timeout(API_CALL_TIMEOUT, pod_api.evict(&pod.name_any(), &params))
            .await
            .context(error::ApiTimeoutSnafu {
                operation: "evict pod",
            })?
            .map(|_| ())
            .context(error::EvictPodSnafu {
                pod_name: pod.name_any(),
            })
    }

    #[instrument(skip(self), err)]
    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<Option<ReplicaSet>> {
        let api: Api<ReplicaSet> = Api::namespaced(self.k8s_client.clone(), namespace);
        match timeout(API_CALL_TIMEOUT, api.get(name))
            .await
            .context(error::ApiTimeoutSnafu {
                operation: "get replicaset",
            })? {
            Ok(replica_set) => Ok(Some(replica_set)),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
            Err(e) => Err(e).context(error::GetWorkloadSnafu {
                kind: "ReplicaSet",
                namespace,
                name,
            }),
        }
    }

    #[instrument(skip(self), err)]
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        let api: Api<StatefulSet> = Api::namespaced(self.k8s_client.clone(), namespace);
        match timeout(API_CALL_TIMEOUT, api.get(name))
            .await
            .context(error::ApiTimeoutSnafu {
                operation: "get statefulset",
            })? {
            Ok(stateful_set) => Ok(Some(stateful_set)),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
            Err(e) => Err(e).context(error::GetWorkloadSnafu {
                kind: "StatefulSet",
                namespace,
                name,
            }),
        }
    }
}
