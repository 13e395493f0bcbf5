//! Cluster and node health predicates used to gate draining and validation.

use k8s_openapi::api::core::v1::{Node, Pod};
use tracing::{event, Level};

/// Returns true when at least `threshold` percent of the cluster's pods are running. An empty
/// cluster is vacuously healthy.
pub fn cluster_healthy(pods: &[Pod], threshold: u32) -> bool {
    let total = pods.len() as u64;
    if total == 0 {
        return true;
    }
    let running = pods.iter().filter(|pod| pod_running(pod)).count() as u64;

    event!(
        Level::INFO,
        "Cluster health: {:.1}% ({}/{})",
        running as f64 / total as f64 * 100.0,
        running,
        total
    );

    running * 100 >= total * u64::from(threshold)
}

fn pod_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running")
}

/// Returns true when the node reports a `Ready` condition with status `True`.
pub fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map_or(false, |conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus, PodStatus};

    fn pod_with_phase(phase: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node_with_ready_condition(ready: &str) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: ready.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn empty_cluster_is_vacuously_healthy() {
        assert!(cluster_healthy(&[], 100));
    }

    #[test]
    fn threshold_zero_always_passes() {
        let pods = vec![pod_with_phase("Pending"), pod_with_phase("Pending")];
        assert!(cluster_healthy(&pods, 0));
    }

    #[test]
    fn threshold_hundred_requires_every_pod_running() {
        let mut pods = vec![pod_with_phase("Running"), pod_with_phase("Running")];
        assert!(cluster_healthy(&pods, 100));

        pods.push(pod_with_phase("Pending"));
        assert!(!cluster_healthy(&pods, 100));
    }

    #[test]
    fn fractional_health_compares_against_threshold() {
        // 17 of 20 running is 85%.
        let mut pods: Vec<Pod> = (0..17).map(|_| pod_with_phase("Running")).collect();
        pods.extend((0..3).map(|_| pod_with_phase("Failed")));

        assert!(cluster_healthy(&pods, 85));
        assert!(cluster_healthy(&pods, 80));
        assert!(!cluster_healthy(&pods, 90));
    }

    #[test]
    fn node_readiness_follows_the_ready_condition() {
        assert!(node_ready(&node_with_ready_condition("True")));
        assert!(!node_ready(&node_with_ready_condition("False")));
        assert!(!node_ready(&node_with_ready_condition("Unknown")));
        assert!(!node_ready(&Node::default()));
    }
}
