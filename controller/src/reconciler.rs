use crate::capacity::{CapacityProvider, CapacityStatus};
use crate::error::{self, Result};
use crate::metrics::RefreshControllerMetrics;
use crate::scheduler::RefreshSchedule;
use crate::statemachine;

use models::refresh::{
    drain, health, ClusterClient, NodeRefresh, NodeRefreshSpec, NodeRefreshStatus, RefreshPhase,
};

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use snafu::ResultExt;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{event, instrument, Level};
use validator::Validate;

// Requeue applied after a successful transition, so the next phase is entered promptly.
const TRANSITION_REQUEUE: Duration = Duration::from_secs(5);

// The interval between capacity checks while a spare node is being provisioned.
const PROVISIONING_REQUEUE: Duration = Duration::from_secs(30);

// How long a paused drain waits before re-evaluating cluster health.
const HEALTH_PAUSE_REQUEUE: Duration = Duration::from_secs(60);

// Ceiling on schedule-derived requeues, so a distant cron tick cannot outlive an operator
// shutdown or mask a spec edit.
const SCHEDULE_REQUEUE_CAP: Duration = Duration::from_secs(30 * 60);

// Requeue applied when a transient error defers work to the next tick.
const ERROR_REQUEUE: Duration = Duration::from_secs(10);

/// State shared by every reconcile invocation.
pub struct Context<T: ClusterClient, P: CapacityProvider> {
    pub client: T,
    pub capacity: P,
    pub metrics: RefreshControllerMetrics,
}

/// Reconcile one observed `NodeRefresh`.
///
/// Each invocation re-reads the object, decides a single transition from its persisted phase,
/// writes status, and schedules the next wake-up. Progress lives entirely in `/status`, so a
/// restarted operator resumes exactly where the previous one stopped, and reconciling an
/// already-settled object is a no-op.
#[instrument(skip(refresh, ctx), fields(name = %refresh.name_any()), err)]
pub async fn reconcile<T: ClusterClient, P: CapacityProvider>(
    refresh: Arc<NodeRefresh>,
    ctx: Arc<Context<T, P>>,
) -> Result<Action> {
    let name = refresh.name_any();
    // The watch handed us a snapshot; fetch the authoritative object before deciding anything.
    let refresh = ctx
        .client
        .get_node_refresh(&name)
        .await
        .context(error::FetchNodeRefreshSnafu { name: name.clone() })?;
    let spec = refresh.spec.clone();
    let status = refresh.status.clone().unwrap_or_default();

    match status.phase {
        RefreshPhase::Idle => handle_idle(&ctx, &name, &spec, status).await,
        RefreshPhase::Provisioning => handle_provisioning(&ctx, &name, &spec, status).await,
        RefreshPhase::Draining => handle_draining(&ctx, &name, &spec, status).await,
        RefreshPhase::Validating => handle_validating(&ctx, &name, &spec, status).await,
        RefreshPhase::Completed => handle_completed(&ctx, &name, &spec, status).await,
        RefreshPhase::Failed => handle_failed(&ctx, &name, status).await,
    }
}

/// Called by the controller runtime when `reconcile` errors. Transient API trouble is not worth
/// a phase change; the work is retried after a short delay.
pub fn error_policy<T: ClusterClient, P: CapacityProvider>(
    refresh: Arc<NodeRefresh>,
    error: &error::Error,
    ctx: Arc<Context<T, P>>,
) -> Action {
    ctx.metrics.observe_reconcile_failure();
    event!(
        Level::WARN,
        name = %refresh.name_any(),
        %error,
        "Reconcile failed; requeueing."
    );
    Action::requeue(ERROR_REQUEUE)
}

/// Idle either starts a cycle (one-shot, or a schedule that has come due) or publishes the next
/// firing time and goes back to sleep.
async fn handle_idle<T: ClusterClient, P: CapacityProvider>(
    ctx: &Context<T, P>,
    name: &str,
    spec: &NodeRefreshSpec,
    mut status: NodeRefreshStatus,
) -> Result<Action> {
    let now = Utc::now();

    if let Err(validation) = spec.validate() {
        return fail(ctx, name, status, format!("Invalid spec: {}", validation), now).await;
    }

    if let Some(expression) = spec.refresh_schedule.as_deref() {
        let schedule = match RefreshSchedule::parse(expression) {
            Ok(schedule) => schedule,
            Err(e) => {
                event!(Level::ERROR, %e, "Refresh schedule could not be parsed.");
                return fail(ctx, name, status, "Invalid schedule", now).await;
            }
        };

        let last_refresh = status
            .last_refresh_time()
            .context(error::MalformedTimestampSnafu { name })?;
        let verdict = match schedule.verdict(last_refresh, now) {
            Ok(verdict) => verdict,
            Err(e) => {
                event!(Level::ERROR, %e, "Refresh schedule has no future firing times.");
                return fail(ctx, name, status, "Invalid schedule", now).await;
            }
        };

        status.set_next_refresh_time(verdict.next_fire);
        if !verdict.due {
            // Not a transition: only the computed wake-up time is published.
            write_status(ctx, name, &status).await?;
            return Ok(Action::requeue(requeue_until(now, verdict.next_fire)));
        }
    }

    start_cycle(ctx, name, spec, status, now).await
}

/// Snapshots the fleet and begins cycling its first node, or completes immediately when the
/// labels match nothing.
async fn start_cycle<T: ClusterClient, P: CapacityProvider>(
    ctx: &Context<T, P>,
    name: &str,
    spec: &NodeRefreshSpec,
    mut status: NodeRefreshStatus,
    now: DateTime<Utc>,
) -> Result<Action> {
    let fleet_nodes = ctx
        .client
        .list_nodes_by_labels(&spec.target_node_labels)
        .await
        .context(error::ListFleetSnafu)?;
    let fleet = statemachine::fleet_names(&fleet_nodes);

    if fleet.is_empty() {
        event!(Level::WARN, "No nodes match the target labels; nothing to refresh.");
        status.current_node = None;
        status.total_nodes = 0;
        status.nodes_refreshed.clear();
        status.retry_count = 0;
        status.set_last_refresh_time(now);
        transition(ctx, &mut status, RefreshPhase::Completed, "No target nodes found", now);
        write_status(ctx, name, &status).await?;
        return Ok(Action::requeue(TRANSITION_REQUEUE));
    }

    event!(Level::INFO, "Found {} nodes to refresh.", fleet.len());

    let first = fleet[0].clone();
    status.current_node = Some(first.clone());
    status.total_nodes = fleet.len() as u32;
    status.nodes_refreshed.clear();
    status.pods_moved_successfully = 0;
    status.pods_moves_failed = 0;
    transition(
        ctx,
        &mut status,
        RefreshPhase::Provisioning,
        format!("Provisioning replacement capacity for {}", first),
        now,
    );
    write_status(ctx, name, &status).await?;
    Ok(Action::requeue(TRANSITION_REQUEUE))
}

/// Provisioning holds the cycle until the cluster has at least one ready node beyond the fleet,
/// invoking the capacity provider while it does not.
async fn handle_provisioning<T: ClusterClient, P: CapacityProvider>(
    ctx: &Context<T, P>,
    name: &str,
    spec: &NodeRefreshSpec,
    mut status: NodeRefreshStatus,
) -> Result<Action> {
    let now = Utc::now();
    let current_node = match status.current_node.clone() {
        Some(node) => node,
        None => {
            return fail(ctx, name, status, "Provisioning entered with no node selected", now).await
        }
    };

    let fleet = ctx
        .client
        .list_nodes_by_labels(&spec.target_node_labels)
        .await
        .context(error::ListFleetSnafu)?;
    let all_nodes = ctx
        .client
        .list_all_nodes()
        .await
        .context(error::ListClusterNodesSnafu)?;
    let ready_nodes = all_nodes.iter().filter(|node| health::node_ready(node)).count();

    if ready_nodes > fleet.len() {
        event!(
            Level::INFO,
            "Spare capacity available ({} ready, fleet of {}); proceeding to drain.",
            ready_nodes,
            fleet.len()
        );
        transition(
            ctx,
            &mut status,
            RefreshPhase::Draining,
            format!("Draining node {}", current_node),
            now,
        );
        write_status(ctx, name, &status).await?;
        return Ok(Action::requeue(TRANSITION_REQUEUE));
    }

    match ctx
        .capacity
        .ensure_spare_capacity(&spec.target_node_labels)
        .await
    {
        CapacityStatus::SpareAvailable => Ok(Action::requeue(TRANSITION_REQUEUE)),
        CapacityStatus::ScalingInProgress => {
            event!(
                Level::INFO,
                "Waiting for additional capacity before draining '{}'.",
                current_node
            );
            Ok(Action::requeue(PROVISIONING_REQUEUE))
        }
    }
}

/// Draining runs the eviction engine over the current node, provided the cluster-health gate
/// passes; an unhealthy cluster pauses the drain without losing the phase.
async fn handle_draining<T: ClusterClient, P: CapacityProvider>(
    ctx: &Context<T, P>,
    name: &str,
    spec: &NodeRefreshSpec,
    mut status: NodeRefreshStatus,
) -> Result<Action> {
    let now = Utc::now();
    let current_node = match status.current_node.clone() {
        Some(node) => node,
        None => return fail(ctx, name, status, "Draining entered with no node selected", now).await,
    };

    let pods = ctx
        .client
        .list_all_pods()
        .await
        .context(error::ObserveClusterHealthSnafu)?;
    if !health::cluster_healthy(&pods, spec.min_health_threshold) {
        event!(
            Level::WARN,
            "Cluster health is below {}%; drain of '{}' paused.",
            spec.min_health_threshold,
            current_node
        );
        status.message = Some("Paused: cluster health below threshold".to_string());
        write_status(ctx, name, &status).await?;
        return Ok(Action::requeue(HEALTH_PAUSE_REQUEUE));
    }

    let outcome = drain::drain_node(
        &ctx.client,
        &current_node,
        spec.max_pods_to_move_at_once as usize,
        spec.grace_period_seconds,
    )
    .await
    .context(error::DrainNodeSnafu {
        node_name: current_node.clone(),
    })?;

    ctx.metrics.observe_evictions(&outcome);
    status.pods_moved_successfully += outcome.pods_moved;
    status.pods_moves_failed += outcome.pods_failed;
    transition(
        ctx,
        &mut status,
        RefreshPhase::Validating,
        format!("Validating workload health after draining {}", current_node),
        now,
    );
    write_status(ctx, name, &status).await?;
    Ok(Action::requeue(TRANSITION_REQUEUE))
}

/// Validating books the drained node as refreshed when the health gate passes, then either
/// moves to the next fleet member or completes the cycle. A failed gate fails the refresh.
async fn handle_validating<T: ClusterClient, P: CapacityProvider>(
    ctx: &Context<T, P>,
    name: &str,
    spec: &NodeRefreshSpec,
    mut status: NodeRefreshStatus,
) -> Result<Action> {
    let now = Utc::now();
    let current_node = match status.current_node.clone() {
        Some(node) => node,
        None => {
            return fail(ctx, name, status, "Validating entered with no node selected", now).await
        }
    };

    let pods = ctx
        .client
        .list_all_pods()
        .await
        .context(error::ObserveClusterHealthSnafu)?;
    if !health::cluster_healthy(&pods, spec.min_health_threshold) {
        return fail(
            ctx,
            name,
            status,
            "Validation failed: cluster health below threshold",
            now,
        )
        .await;
    }

    if !status.nodes_refreshed.contains(&current_node) {
        status.nodes_refreshed.push(current_node.clone());
    }

    if (status.nodes_refreshed.len() as u32) < status.total_nodes {
        let fleet_nodes = ctx
            .client
            .list_nodes_by_labels(&spec.target_node_labels)
            .await
            .context(error::ListFleetSnafu)?;
        let fleet = statemachine::fleet_names(&fleet_nodes);

        if let Some(next) = statemachine::next_node(&fleet, &status.nodes_refreshed) {
            event!(Level::INFO, "Node '{}' validated; moving to '{}'.", current_node, next);
            status.current_node = Some(next.clone());
            transition(
                ctx,
                &mut status,
                RefreshPhase::Provisioning,
                format!("Provisioning replacement capacity for {}", next),
                now,
            );
            write_status(ctx, name, &status).await?;
            return Ok(Action::requeue(TRANSITION_REQUEUE));
        }
        // The remaining fleet members disappeared since the cycle started; the pass is done.
    }

    finalize_cycle(ctx, name, status, now).await
}

async fn finalize_cycle<T: ClusterClient, P: CapacityProvider>(
    ctx: &Context<T, P>,
    name: &str,
    mut status: NodeRefreshStatus,
    now: DateTime<Utc>,
) -> Result<Action> {
    let refreshed = status.nodes_refreshed.len();
    event!(Level::INFO, "All {} nodes refreshed successfully.", refreshed);

    status.current_node = None;
    status.retry_count = 0;
    status.set_last_refresh_time(now);
    transition(
        ctx,
        &mut status,
        RefreshPhase::Completed,
        format!("Successfully refreshed {} nodes", refreshed),
        now,
    );
    ctx.metrics.observe_cycle_completed();
    write_status(ctx, name, &status).await?;
    Ok(Action::requeue(TRANSITION_REQUEUE))
}

/// Completed is terminal for one-shot refreshes; scheduled refreshes return to Idle to await
/// the next firing time.
async fn handle_completed<T: ClusterClient, P: CapacityProvider>(
    ctx: &Context<T, P>,
    name: &str,
    spec: &NodeRefreshSpec,
    mut status: NodeRefreshStatus,
) -> Result<Action> {
    if spec.refresh_schedule.is_none() {
        return Ok(Action::await_change());
    }

    let now = Utc::now();
    transition(
        ctx,
        &mut status,
        RefreshPhase::Idle,
        "Awaiting next scheduled refresh",
        now,
    );
    write_status(ctx, name, &status).await?;
    Ok(Action::requeue(TRANSITION_REQUEUE))
}

/// Failed re-enters Idle once the current retry delay has elapsed, measured against the failure
/// transition recorded in the condition history so that a restart resumes the wait instead of
/// restarting it. An exhausted schedule leaves the object terminally Failed.
async fn handle_failed<T: ClusterClient, P: CapacityProvider>(
    ctx: &Context<T, P>,
    name: &str,
    mut status: NodeRefreshStatus,
) -> Result<Action> {
    let now = Utc::now();

    let delay = match statemachine::retry_delay(status.retry_count) {
        Some(delay) => delay,
        None => {
            if status.message.as_deref() != Some("Failed: Max retries exceeded") {
                event!(Level::ERROR, "Max retries exceeded for NodeRefresh '{}'.", name);
                status.message = Some("Failed: Max retries exceeded".to_string());
                write_status(ctx, name, &status).await?;
            }
            return Ok(Action::await_change());
        }
    };

    let failed_at = status
        .last_transition_time()
        .context(error::MalformedTimestampSnafu { name })?
        .unwrap_or(now);
    let elapsed = (now - failed_at).to_std().unwrap_or_default();
    if elapsed < delay {
        return Ok(Action::requeue(delay - elapsed));
    }

    let attempt = status.retry_count + 1;
    status.retry_count = attempt;
    event!(Level::INFO, "Retrying NodeRefresh '{}' (attempt {}).", name, attempt);
    transition(
        ctx,
        &mut status,
        RefreshPhase::Idle,
        format!("Retrying (attempt {})", attempt),
        now,
    );
    write_status(ctx, name, &status).await?;
    Ok(Action::requeue(TRANSITION_REQUEUE))
}

async fn fail<T: ClusterClient, P: CapacityProvider>(
    ctx: &Context<T, P>,
    name: &str,
    mut status: NodeRefreshStatus,
    message: impl Into<String>,
    now: DateTime<Utc>,
) -> Result<Action> {
    let message = message.into();
    event!(Level::ERROR, "NodeRefresh '{}' failed: {}", name, message);
    transition(ctx, &mut status, RefreshPhase::Failed, message, now);
    write_status(ctx, name, &status).await?;
    Ok(Action::requeue(TRANSITION_REQUEUE))
}

fn transition<T: ClusterClient, P: CapacityProvider>(
    ctx: &Context<T, P>,
    status: &mut NodeRefreshStatus,
    phase: RefreshPhase,
    message: impl Into<String>,
    now: DateTime<Utc>,
) {
    status.transition(phase, message, now);
    ctx.metrics.observe_transition(phase);
}

async fn write_status<T: ClusterClient, P: CapacityProvider>(
    ctx: &Context<T, P>,
    name: &str,
    status: &NodeRefreshStatus,
) -> Result<()> {
    ctx.client
        .update_node_refresh_status(name, status)
        .await
        .context(error::WriteStatusSnafu { name })
}

fn requeue_until(now: DateTime<Utc>, fire: DateTime<Utc>) -> Duration {
    (fire - now)
        .to_std()
        .unwrap_or(TRANSITION_REQUEUE)
        .min(SCHEDULE_REQUEUE_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::MockCapacityProvider;
    use chrono::Duration as ChronoDuration;
    use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeStatus, Pod, PodStatus};
    use kube::api::ObjectMeta;
    use maplit::btreemap;
    use models::refresh::MockClusterClient;
    use prometheus::Registry;
    use std::collections::BTreeMap;

    const NAME: &str = "worker-fleet";

    fn worker_labels() -> BTreeMap<String, String> {
        btreemap! {"role".to_string() => "worker".to_string()}
    }

    fn refresh_with(spec: NodeRefreshSpec, status: Option<NodeRefreshStatus>) -> NodeRefresh {
        let mut refresh = NodeRefresh::new(NAME, spec);
        refresh.status = status;
        refresh
    }

    fn ready_node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(worker_labels()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod_with_phase(phase: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn test_context(
        client: MockClusterClient,
        capacity: MockCapacityProvider,
    ) -> Arc<Context<MockClusterClient, MockCapacityProvider>> {
        let registry = Registry::new();
        Arc::new(Context {
            client,
            capacity,
            metrics: RefreshControllerMetrics::new(&registry).unwrap(),
        })
    }

    fn expect_fetch(client: &mut MockClusterClient, refresh: &NodeRefresh) {
        let refresh = refresh.clone();
        client
            .expect_get_node_refresh()
            .return_once(move |_| Ok(refresh));
    }

    fn assert_action(actual: &Action, expected: &Action) {
        assert_eq!(format!("{:?}", actual), format!("{:?}", expected));
    }

    #[tokio::test]
    async fn empty_fleet_completes_immediately() {
        let spec = NodeRefreshSpec {
            target_node_labels: worker_labels(),
            ..Default::default()
        };
        let refresh = refresh_with(spec, None);

        let mut client = MockClusterClient::new();
        expect_fetch(&mut client, &refresh);
        client
            .expect_list_nodes_by_labels()
            .return_once(|_| Ok(vec![]));
        client
            .expect_update_node_refresh_status()
            .withf(|_, status| {
                status.phase == RefreshPhase::Completed
                    && status.total_nodes == 0
                    && status.nodes_refreshed.is_empty()
                    && status.last_refresh_time().unwrap().is_some()
                    && status.conditions.len() == 1
                    && status.conditions[0].message == "No target nodes found"
            })
            .return_once(|_, _| Ok(()));

        let ctx = test_context(client, MockCapacityProvider::new());
        let action = reconcile(Arc::new(refresh), ctx).await.unwrap();
        assert_action(&action, &Action::requeue(TRANSITION_REQUEUE));
    }

    #[tokio::test]
    async fn idle_with_pending_schedule_only_publishes_next_fire() {
        let spec = NodeRefreshSpec {
            target_node_labels: worker_labels(),
            // Fires once a year; with a just-recorded refresh it cannot be due.
            refresh_schedule: Some("0 0 1 1 *".to_string()),
            ..Default::default()
        };
        let mut status = NodeRefreshStatus::default();
        status.set_last_refresh_time(Utc::now());
        let refresh = refresh_with(spec, Some(status));

        let mut client = MockClusterClient::new();
        expect_fetch(&mut client, &refresh);
        client
            .expect_update_node_refresh_status()
            .withf(|_, status| {
                status.phase == RefreshPhase::Idle
                    && status.conditions.is_empty()
                    && status.next_refresh_time().unwrap().is_some()
            })
            .return_once(|_, _| Ok(()));

        let ctx = test_context(client, MockCapacityProvider::new());
        reconcile(Arc::new(refresh), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn idle_with_invalid_schedule_fails_the_refresh() {
        let spec = NodeRefreshSpec {
            target_node_labels: worker_labels(),
            refresh_schedule: Some("not a schedule".to_string()),
            ..Default::default()
        };
        let refresh = refresh_with(spec, None);

        let mut client = MockClusterClient::new();
        expect_fetch(&mut client, &refresh);
        client
            .expect_update_node_refresh_status()
            .withf(|_, status| {
                status.phase == RefreshPhase::Failed
                    && status.message.as_deref() == Some("Invalid schedule")
            })
            .return_once(|_, _| Ok(()));

        let ctx = test_context(client, MockCapacityProvider::new());
        reconcile(Arc::new(refresh), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn idle_with_invalid_spec_fails_the_refresh() {
        let spec = NodeRefreshSpec {
            target_node_labels: worker_labels(),
            max_pods_to_move_at_once: 0,
            ..Default::default()
        };
        let refresh = refresh_with(spec, None);

        let mut client = MockClusterClient::new();
        expect_fetch(&mut client, &refresh);
        client
            .expect_update_node_refresh_status()
            .withf(|_, status| {
                status.phase == RefreshPhase::Failed
                    && status
                        .message
                        .as_deref()
                        .map_or(false, |message| message.starts_with("Invalid spec"))
            })
            .return_once(|_, _| Ok(()));

        let ctx = test_context(client, MockCapacityProvider::new());
        reconcile(Arc::new(refresh), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn idle_one_shot_starts_cycling_the_first_node_in_name_order() {
        let spec = NodeRefreshSpec {
            target_node_labels: worker_labels(),
            ..Default::default()
        };
        let refresh = refresh_with(spec, None);

        let mut client = MockClusterClient::new();
        expect_fetch(&mut client, &refresh);
        client
            .expect_list_nodes_by_labels()
            .return_once(|_| Ok(vec![ready_node("worker-b"), ready_node("worker-a")]));
        client
            .expect_update_node_refresh_status()
            .withf(|_, status| {
                status.phase == RefreshPhase::Provisioning
                    && status.current_node.as_deref() == Some("worker-a")
                    && status.total_nodes == 2
                    && status.nodes_refreshed.is_empty()
                    && status.pods_moved_successfully == 0
                    && status.pods_moves_failed == 0
            })
            .return_once(|_, _| Ok(()));

        let ctx = test_context(client, MockCapacityProvider::new());
        let action = reconcile(Arc::new(refresh), ctx).await.unwrap();
        assert_action(&action, &Action::requeue(TRANSITION_REQUEUE));
    }

    #[tokio::test]
    async fn provisioning_advances_when_spare_capacity_exists() {
        let spec = NodeRefreshSpec {
            target_node_labels: worker_labels(),
            ..Default::default()
        };
        let mut status = NodeRefreshStatus {
            current_node: Some("worker-a".to_string()),
            total_nodes: 2,
            ..Default::default()
        };
        status.transition(RefreshPhase::Provisioning, "Provisioning", Utc::now());
        let refresh = refresh_with(spec, Some(status));

        let mut client = MockClusterClient::new();
        expect_fetch(&mut client, &refresh);
        client
            .expect_list_nodes_by_labels()
            .return_once(|_| Ok(vec![ready_node("worker-a"), ready_node("worker-b")]));
        client
            .expect_list_all_nodes()
            .return_once(|| Ok(vec![ready_node("worker-a"), ready_node("worker-b"), ready_node("spare")]));
        client
            .expect_update_node_refresh_status()
            .withf(|_, status| {
                status.phase == RefreshPhase::Draining
                    && status.message.as_deref() == Some("Draining node worker-a")
            })
            .return_once(|_, _| Ok(()));

        let ctx = test_context(client, MockCapacityProvider::new());
        let action = reconcile(Arc::new(refresh), ctx).await.unwrap();
        assert_action(&action, &Action::requeue(TRANSITION_REQUEUE));
    }

    #[tokio::test]
    async fn provisioning_invokes_the_capacity_provider_when_no_spare_exists() {
        let spec = NodeRefreshSpec {
            target_node_labels: worker_labels(),
            ..Default::default()
        };
        let mut status = NodeRefreshStatus {
            current_node: Some("worker-a".to_string()),
            total_nodes: 2,
            ..Default::default()
        };
        status.transition(RefreshPhase::Provisioning, "Provisioning", Utc::now());
        let refresh = refresh_with(spec, Some(status));

        let mut client = MockClusterClient::new();
        expect_fetch(&mut client, &refresh);
        client
            .expect_list_nodes_by_labels()
            .return_once(|_| Ok(vec![ready_node("worker-a"), ready_node("worker-b")]));
        client
            .expect_list_all_nodes()
            .return_once(|| Ok(vec![ready_node("worker-a"), ready_node("worker-b")]));

        let mut capacity = MockCapacityProvider::new();
        capacity
            .expect_ensure_spare_capacity()
            .return_once(|_| CapacityStatus::ScalingInProgress);

        let ctx = test_context(client, capacity);
        let action = reconcile(Arc::new(refresh), ctx).await.unwrap();
        assert_action(&action, &Action::requeue(PROVISIONING_REQUEUE));
    }

    #[tokio::test]
    async fn draining_pauses_when_the_cluster_is_unhealthy() {
        let spec = NodeRefreshSpec {
            target_node_labels: worker_labels(),
            min_health_threshold: 90,
            ..Default::default()
        };
        let mut status = NodeRefreshStatus {
            current_node: Some("worker-a".to_string()),
            total_nodes: 1,
            ..Default::default()
        };
        status.transition(RefreshPhase::Draining, "Draining", Utc::now());
        let refresh = refresh_with(spec, Some(status));

        let mut client = MockClusterClient::new();
        expect_fetch(&mut client, &refresh);
        client.expect_list_all_pods().return_once(|| {
            // 17 of 20 running is 85%, below the 90% gate.
            let mut pods: Vec<Pod> = (0..17).map(|_| pod_with_phase("Running")).collect();
            pods.extend((0..3).map(|_| pod_with_phase("Pending")));
            Ok(pods)
        });
        client
            .expect_update_node_refresh_status()
            .withf(|_, status| {
                status.phase == RefreshPhase::Draining
                    && status.message.as_deref() == Some("Paused: cluster health below threshold")
                    // A pause is not a transition; no condition is appended.
                    && status.conditions.len() == 1
            })
            .return_once(|_, _| Ok(()));

        let ctx = test_context(client, MockCapacityProvider::new());
        let action = reconcile(Arc::new(refresh), ctx).await.unwrap();
        assert_action(&action, &Action::requeue(HEALTH_PAUSE_REQUEUE));
    }

    #[tokio::test]
    async fn draining_an_empty_node_advances_to_validating() {
        let spec = NodeRefreshSpec {
            target_node_labels: worker_labels(),
            ..Default::default()
        };
        let mut status = NodeRefreshStatus {
            current_node: Some("worker-a".to_string()),
            total_nodes: 1,
            ..Default::default()
        };
        status.transition(RefreshPhase::Draining, "Draining", Utc::now());
        let refresh = refresh_with(spec, Some(status));

        let mut client = MockClusterClient::new();
        expect_fetch(&mut client, &refresh);
        client
            .expect_list_all_pods()
            .return_once(|| Ok(vec![pod_with_phase("Running")]));
        client
            .expect_list_pods_on_node()
            .return_once(|_| Ok(vec![]));
        client
            .expect_update_node_refresh_status()
            .withf(|_, status| {
                status.phase == RefreshPhase::Validating
                    && status.pods_moved_successfully == 0
                    && status.pods_moves_failed == 0
            })
            .return_once(|_, _| Ok(()));

        let ctx = test_context(client, MockCapacityProvider::new());
        reconcile(Arc::new(refresh), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn validating_moves_to_the_next_unrefreshed_node() {
        let spec = NodeRefreshSpec {
            target_node_labels: worker_labels(),
            ..Default::default()
        };
        let mut status = NodeRefreshStatus {
            current_node: Some("worker-a".to_string()),
            total_nodes: 2,
            ..Default::default()
        };
        status.transition(RefreshPhase::Validating, "Validating", Utc::now());
        let refresh = refresh_with(spec, Some(status));

        let mut client = MockClusterClient::new();
        expect_fetch(&mut client, &refresh);
        client.expect_list_all_pods().return_once(|| Ok(vec![]));
        client
            .expect_list_nodes_by_labels()
            .return_once(|_| Ok(vec![ready_node("worker-a"), ready_node("worker-b")]));
        client
            .expect_update_node_refresh_status()
            .withf(|_, status| {
                status.phase == RefreshPhase::Provisioning
                    && status.current_node.as_deref() == Some("worker-b")
                    && status.nodes_refreshed == vec!["worker-a".to_string()]
            })
            .return_once(|_, _| Ok(()));

        let ctx = test_context(client, MockCapacityProvider::new());
        reconcile(Arc::new(refresh), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn validating_the_last_node_completes_the_cycle() {
        let spec = NodeRefreshSpec {
            target_node_labels: worker_labels(),
            ..Default::default()
        };
        let mut status = NodeRefreshStatus {
            current_node: Some("worker-b".to_string()),
            total_nodes: 2,
            nodes_refreshed: vec!["worker-a".to_string()],
            retry_count: 2,
            ..Default::default()
        };
        status.transition(RefreshPhase::Validating, "Validating", Utc::now());
        let refresh = refresh_with(spec, Some(status));

        let mut client = MockClusterClient::new();
        expect_fetch(&mut client, &refresh);
        client.expect_list_all_pods().return_once(|| Ok(vec![]));
        client
            .expect_update_node_refresh_status()
            .withf(|_, status| {
                status.phase == RefreshPhase::Completed
                    && status.nodes_refreshed
                        == vec!["worker-a".to_string(), "worker-b".to_string()]
                    && status.current_node.is_none()
                    && status.retry_count == 0
                    && status.last_refresh_time().unwrap().is_some()
                    && status.message.as_deref() == Some("Successfully refreshed 2 nodes")
            })
            .return_once(|_, _| Ok(()));

        let ctx = test_context(client, MockCapacityProvider::new());
        reconcile(Arc::new(refresh), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn validating_fails_when_the_cluster_is_unhealthy() {
        let spec = NodeRefreshSpec {
            target_node_labels: worker_labels(),
            ..Default::default()
        };
        let mut status = NodeRefreshStatus {
            current_node: Some("worker-a".to_string()),
            total_nodes: 1,
            ..Default::default()
        };
        status.transition(RefreshPhase::Validating, "Validating", Utc::now());
        let refresh = refresh_with(spec, Some(status));

        let mut client = MockClusterClient::new();
        expect_fetch(&mut client, &refresh);
        client
            .expect_list_all_pods()
            .return_once(|| Ok(vec![pod_with_phase("Pending")]));
        client
            .expect_update_node_refresh_status()
            .withf(|_, status| {
                status.phase == RefreshPhase::Failed
                    && status.message.as_deref()
                        == Some("Validation failed: cluster health below threshold")
            })
            .return_once(|_, _| Ok(()));

        let ctx = test_context(client, MockCapacityProvider::new());
        reconcile(Arc::new(refresh), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn completed_with_a_schedule_returns_to_idle() {
        let spec = NodeRefreshSpec {
            target_node_labels: worker_labels(),
            refresh_schedule: Some("0 2 * * *".to_string()),
            ..Default::default()
        };
        let mut status = NodeRefreshStatus::default();
        status.transition(RefreshPhase::Completed, "Done", Utc::now());
        let refresh = refresh_with(spec, Some(status));

        let mut client = MockClusterClient::new();
        expect_fetch(&mut client, &refresh);
        client
            .expect_update_node_refresh_status()
            .withf(|_, status| status.phase == RefreshPhase::Idle)
            .return_once(|_, _| Ok(()));

        let ctx = test_context(client, MockCapacityProvider::new());
        reconcile(Arc::new(refresh), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn completed_without_a_schedule_is_terminal() {
        let spec = NodeRefreshSpec {
            target_node_labels: worker_labels(),
            ..Default::default()
        };
        let mut status = NodeRefreshStatus::default();
        status.transition(RefreshPhase::Completed, "Done", Utc::now());
        let refresh = refresh_with(spec, Some(status));

        let mut client = MockClusterClient::new();
        expect_fetch(&mut client, &refresh);

        let ctx = test_context(client, MockCapacityProvider::new());
        let action = reconcile(Arc::new(refresh), ctx).await.unwrap();
        assert_action(&action, &Action::await_change());
    }

    #[tokio::test]
    async fn failed_returns_to_idle_after_the_retry_delay() {
        let spec = NodeRefreshSpec {
            target_node_labels: worker_labels(),
            ..Default::default()
        };
        let mut status = NodeRefreshStatus::default();
        status.transition(
            RefreshPhase::Failed,
            "Validation failed",
            Utc::now() - ChronoDuration::seconds(40),
        );
        let refresh = refresh_with(spec, Some(status));

        let mut client = MockClusterClient::new();
        expect_fetch(&mut client, &refresh);
        client
            .expect_update_node_refresh_status()
            .withf(|_, status| {
                status.phase == RefreshPhase::Idle
                    && status.retry_count == 1
                    && status.message.as_deref() == Some("Retrying (attempt 1)")
            })
            .return_once(|_, _| Ok(()));

        let ctx = test_context(client, MockCapacityProvider::new());
        reconcile(Arc::new(refresh), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn failed_waits_out_the_remaining_delay() {
        let spec = NodeRefreshSpec {
            target_node_labels: worker_labels(),
            ..Default::default()
        };
        let mut status = NodeRefreshStatus::default();
        status.transition(RefreshPhase::Failed, "Validation failed", Utc::now());
        let refresh = refresh_with(spec, Some(status));

        // No status update is expected: the retry delay has not elapsed.
        let mut client = MockClusterClient::new();
        expect_fetch(&mut client, &refresh);

        let ctx = test_context(client, MockCapacityProvider::new());
        reconcile(Arc::new(refresh), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn failed_with_exhausted_retries_is_terminal() {
        let spec = NodeRefreshSpec {
            target_node_labels: worker_labels(),
            ..Default::default()
        };
        let mut status = NodeRefreshStatus {
            retry_count: 4,
            ..Default::default()
        };
        status.transition(RefreshPhase::Failed, "Validation failed", Utc::now());
        let refresh = refresh_with(spec, Some(status));

        let mut client = MockClusterClient::new();
        expect_fetch(&mut client, &refresh);
        client
            .expect_update_node_refresh_status()
            .withf(|_, status| {
                status.phase == RefreshPhase::Failed
                    && status.message.as_deref() == Some("Failed: Max retries exceeded")
            })
            .return_once(|_, _| Ok(()));

        let ctx = test_context(client, MockCapacityProvider::new());
        let action = reconcile(Arc::new(refresh), ctx).await.unwrap();
        assert_action(&action, &Action::await_change());
    }
}
