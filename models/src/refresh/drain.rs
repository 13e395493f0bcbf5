//! Provides an implementation for draining Pods from a Kubernetes Node ahead of node
//! replacement, similar to `kubectl drain`.
//!
//! Draining in Kubernetes is done client side. This implementation uses the eviction
//! subresource, which respects PodDisruptionBudgets (PDBs), and additionally verifies after
//! each batch of evictions that the owning controllers have restored their ready replica
//! counts before the drain moves on.
//!
//! The engine is resumable: it lists the pods still on the node on every invocation, so a
//! drain interrupted by a crash simply picks up the remainder.

use super::client::ClusterClient;
use super::error::Error as ClientError;
use crate::constants::RESERVED_NAMESPACES;

use futures::future::join_all;
use k8s_openapi::api::apps::v1::{ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::ResourceExt;
use reqwest::StatusCode;
use snafu::ResultExt;
use tokio::time::{sleep, Duration, Instant};
use tokio_retry::{strategy::FixedInterval, RetryIf};
use tracing::{event, instrument, Level};

// After a batch of evictions is created, the owning controllers need time to reschedule the
// workloads before their health is worth checking.
const BATCH_SETTLE_INTERVAL: Duration = Duration::from_secs(30);

// When a PodDisruptionBudget denies an eviction we stall once for this long and re-evaluate,
// in case the budget frees up. A second denial fails the pod.
const DISRUPTION_RECHECK_INTERVAL: Duration = Duration::from_secs(30);

// These constants define the poll interval for checking an evicted pod's owning controller,
// as well as the max amount of time to wait for its ready replicas to recover.
const WORKLOAD_POLL_INTERVAL: Duration = Duration::from_secs(5);
const WORKLOAD_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Wrapper struct to provide retry configurations for budget-denied evictions.
struct RetryStrategy {}
impl RetryStrategy {
    fn retry_strategy() -> impl Iterator<Item = Duration> {
        FixedInterval::new(DISRUPTION_RECHECK_INTERVAL).take(1)
    }
}

impl tokio_retry::Condition<error::EvictionError> for RetryStrategy {
    fn should_retry(&mut self, error: &error::EvictionError) -> bool {
        error.should_retry()
    }
}

/// Tally of the eviction results for one pass over a node.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    pub pods_moved: u64,
    pub pods_failed: u64,
}

/// Drains a node of its evictable pods in bounded batches.
///
/// DaemonSet pods are skipped: the DaemonSet controller runs one replica per node and the node
/// lifecycle itself replaces them. Pods in reserved system namespaces are also skipped.
///
/// Each batch is evicted with at most `batch_size` requests in flight, given
/// [`BATCH_SETTLE_INTERVAL`] to reschedule, and then verified through the owning controllers.
/// A batch whose replacements do not come up counts entirely as failed.
#[instrument(skip(client), err)]
pub async fn drain_node<T: ClusterClient>(
    client: &T,
    node_name: &str,
    batch_size: usize,
    grace_period_seconds: u32,
) -> Result<DrainOutcome, error::DrainError> {
    let target_pods = find_target_pods(client, node_name).await?;
    event!(
        Level::INFO,
        "Found {} pods to evict on node '{}'.",
        target_pods.len(),
        node_name
    );

    let mut outcome = DrainOutcome::default();
    for batch in target_pods.chunks(batch_size.max(1)) {
        let results = join_all(
            batch
                .iter()
                .map(|pod| evict_pod(client, pod, grace_period_seconds)),
        )
        .await;
        let moved = results.iter().filter(|result| result.is_ok()).count() as u64;
        let failed = batch.len() as u64 - moved;

        // Give the owning controllers time to reschedule before judging replacement health.
        sleep(BATCH_SETTLE_INTERVAL).await;

        if verify_batch_replaced(client, batch).await {
            outcome.pods_moved += moved;
            outcome.pods_failed += failed;
        } else {
            // The whole batch counts as failed when replacements don't come up. Evictions that
            // individually succeeded are reclassified rather than counted twice.
            outcome.pods_failed += batch.len() as u64;
        }
    }

    Ok(outcome)
}

/// Finds all pods on a given node that are targeted for eviction during a drain.
/// See documentation on [`drain_node`] for more information about which pods are selected.
#[instrument(skip(client), err)]
async fn find_target_pods<T: ClusterClient>(
    client: &T,
    node_name: &str,
) -> Result<Vec<Pod>, error::DrainError> {
    let pods = client
        .list_pods_on_node(node_name)
        .await
        .context(error::FindTargetPodsSnafu { node_name })?;

    Ok(pods.into_iter().filter(is_evictable).collect())
}

/// Whether a pod is fair game for eviction during a drain.
fn is_evictable(pod: &Pod) -> bool {
    if let Some(owner_references) = pod.metadata.owner_references.as_ref() {
        if owner_references
            .iter()
            .any(|reference| reference.kind == "DaemonSet")
        {
            event!(
                Level::INFO,
                "Not draining Pod '{}': Pod is a member of a DaemonSet",
                pod.name_any()
            );
            return false;
        }
    }

    if pod
        .namespace()
        .map_or(false, |namespace| RESERVED_NAMESPACES.contains(&namespace.as_str()))
    {
        event!(
            Level::INFO,
            "Not draining Pod '{}': Pod is in a reserved namespace",
            pod.name_any()
        );
        return false;
    }

    true
}

/// Create an eviction for the desired Pod.
///
/// A denial by a PodDisruptionBudget, whether observed up front or answered by the eviction API
/// as a 429, is retried exactly once after [`DISRUPTION_RECHECK_INTERVAL`]. Any other API
/// failure is terminal for this pod and is recorded by the caller; the drain proceeds.
#[instrument(skip(client, pod), fields(pod_name = %pod.name_any()), err)]
async fn evict_pod<T: ClusterClient>(
    client: &T,
    pod: &Pod,
    grace_period_seconds: u32,
) -> Result<(), error::EvictionError> {
    RetryIf::spawn(
        RetryStrategy::retry_strategy(),
        || attempt_eviction(client, pod, grace_period_seconds),
        RetryStrategy {},
    )
    .await
}

async fn attempt_eviction<T: ClusterClient>(
    client: &T,
    pod: &Pod,
    grace_period_seconds: u32,
) -> Result<(), error::EvictionError> {
    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
    if !disruption_budgets_permit(client, &namespace, pod).await {
        event!(
            Level::WARN,
            "A disruption budget is blocking eviction of Pod '{}'.",
            pod.name_any()
        );
        return error::DisruptionBudgetDeniedSnafu {
            pod_name: pod.name_any(),
        }
        .fail();
    }

    event!(Level::INFO, "Attempting to evict pod {}", &pod.name_any());
    match client.evict_pod(pod, grace_period_seconds).await {
        Ok(()) => {
            event!(Level::INFO, "Successfully evicted Pod '{}'", pod.name_any());
            Ok(())
        }
        Err(e) if is_budget_rejection(&e) => {
            // A 429 (TOO_MANY_REQUESTS) response code indicates that the eviction API is holding
            // the line for a PodDisruptionBudget.
            event!(
                Level::WARN,
                "Too many requests when creating Eviction for Pod '{}': '{}'. This is likely due to respecting a Pod Disruption Budget.",
                pod.name_any(),
                e
            );
            error::DisruptionBudgetDeniedSnafu {
                pod_name: pod.name_any(),
            }
            .fail()
        }
        Err(e) => {
            event!(
                Level::ERROR,
                "Error when evicting Pod '{}': '{}'.",
                pod.name_any(),
                e
            );
            Err(e).context(error::EvictionFailedSnafu {
                pod_name: pod.name_any(),
            })
        }
    }
}

fn is_budget_rejection(error: &ClientError) -> bool {
    matches!(
        error.api_code().map(StatusCode::from_u16),
        Some(Ok(StatusCode::TOO_MANY_REQUESTS))
    )
}

/// Evaluates whether every disruption budget matching the pod currently allows a voluntary
/// disruption.
///
/// A failure to list budgets is treated as permission (and logged) so that a transient read
/// failure cannot wedge the drain; the eviction API itself still enforces budgets.
async fn disruption_budgets_permit<T: ClusterClient>(
    client: &T,
    namespace: &str,
    pod: &Pod,
) -> bool {
    let budgets = match client.list_disruption_budgets(namespace).await {
        Ok(budgets) => budgets,
        Err(e) => {
            event!(
                Level::ERROR,
                "Could not list PodDisruptionBudgets in namespace '{}': '{}'. Proceeding with eviction.",
                namespace,
                e
            );
            return true;
        }
    };

    budgets_permit_disruption(&budgets, pod)
}

fn budgets_permit_disruption(budgets: &[PodDisruptionBudget], pod: &Pod) -> bool {
    for budget in budgets {
        if selector_matches_pod(budget, pod) {
            let allowed = budget
                .status
                .as_ref()
                .map_or(0, |status| status.disruptions_allowed);
            if allowed > 0 {
                return true;
            }
            event!(
                Level::WARN,
                "PodDisruptionBudget '{}' prevents disruption of Pod '{}'.",
                budget.name_any(),
                pod.name_any()
            );
            return false;
        }
    }

    // No matching budget; eviction is allowed.
    true
}

/// A budget matches when every key/value pair in its label selector is present on the pod.
/// Budgets without match labels match nothing.
fn selector_matches_pod(budget: &PodDisruptionBudget, pod: &Pod) -> bool {
    let match_labels = budget
        .spec
        .as_ref()
        .and_then(|spec| spec.selector.as_ref())
        .and_then(|selector| selector.match_labels.as_ref());

    let match_labels = match match_labels {
        Some(labels) if !labels.is_empty() => labels,
        _ => return false,
    };

    let pod_labels = pod.labels();
    match_labels
        .iter()
        .all(|(key, value)| pod_labels.get(key) == Some(value))
}

/// The kinds of pod owners the drain knows how to health-check. Anything else is left to its
/// own devices once evicted.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PodOwner {
    ReplicaSet { name: String },
    StatefulSet { name: String },
    Other,
}

/// Classifies a pod by its first owner reference.
fn classify_owner(pod: &Pod) -> PodOwner {
    match pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|references| references.first())
    {
        Some(reference) if reference.kind == "ReplicaSet" => PodOwner::ReplicaSet {
            name: reference.name.clone(),
        },
        Some(reference) if reference.kind == "StatefulSet" => PodOwner::StatefulSet {
            name: reference.name.clone(),
        },
        _ => PodOwner::Other,
    }
}

/// Polls the owning controller of each pod in the batch until its ready replica count recovers,
/// or the per-owner timeout lapses. Pods without a recognisable owner are not verified.
async fn verify_batch_replaced<T: ClusterClient>(client: &T, batch: &[Pod]) -> bool {
    for pod in batch {
        let owner = classify_owner(pod);
        if owner == PodOwner::Other {
            continue;
        }

        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        if !wait_for_owner_ready(client, &namespace, &owner).await {
            event!(
                Level::ERROR,
                "Timed out waiting for the replacement of Pod '{}'.",
                pod.name_any()
            );
            return false;
        }
    }
    true
}

async fn wait_for_owner_ready<T: ClusterClient>(
    client: &T,
    namespace: &str,
    owner: &PodOwner,
) -> bool {
    let start_time = Instant::now();
    loop {
        let ready = match owner {
            PodOwner::ReplicaSet { name } => client
                .get_replica_set(namespace, name)
                .await
                .ok()
                .flatten()
                .map_or(false, |replica_set| replica_set_ready(&replica_set)),
            PodOwner::StatefulSet { name } => client
                .get_stateful_set(namespace, name)
                .await
                .ok()
                .flatten()
                .map_or(false, |stateful_set| stateful_set_ready(&stateful_set)),
            PodOwner::Other => true,
        };

        if ready {
            return true;
        }
        if start_time.elapsed() >= WORKLOAD_READY_TIMEOUT {
            return false;
        }
        sleep(WORKLOAD_POLL_INTERVAL).await;
    }
}

fn replica_set_ready(replica_set: &ReplicaSet) -> bool {
    let desired = replica_set
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(0);
    let ready = replica_set
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .unwrap_or(0);
    ready >= desired
}

fn stateful_set_ready(stateful_set: &StatefulSet) -> bool {
    let desired = stateful_set
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(0);
    let ready = stateful_set
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .unwrap_or(0);
    ready >= desired
}

pub mod error {
    use crate::refresh::error::Error as ClientError;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum DrainError {
        #[snafu(display("Unable to find drainable Pods for Node '{}': '{}'", node_name, source))]
        FindTargetPods {
            source: ClientError,
            node_name: String,
        },
    }

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum EvictionError {
        #[snafu(display("A disruption budget is blocking eviction of Pod '{}'", pod_name))]
        /// The eviction was denied in deference to a PodDisruptionBudget. Retried once.
        DisruptionBudgetDenied { pod_name: String },

        #[snafu(display("Unable to create eviction for Pod '{}': '{}'", pod_name, source))]
        /// A fatal error occurred while attempting to evict a Pod. This will not be retried.
        EvictionFailed {
            source: ClientError,
            pod_name: String,
        },
    }

    impl EvictionError {
        pub fn should_retry(&self) -> bool {
            match self {
                Self::DisruptionBudgetDenied { .. } => true,
                Self::EvictionFailed { .. } => false,
            }
        }
    }
}
