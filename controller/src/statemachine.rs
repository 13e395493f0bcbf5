//! Pure decision helpers for the refresh state machine. Keeping these free of I/O lets the
//! transition logic be exercised without a cluster.

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tokio::time::Duration;

/// Delays applied between successive re-entries into the cycle after a failure, indexed by the
/// number of failures so far. Exhausting the schedule leaves the refresh terminally Failed.
pub const RETRY_SCHEDULE: [Duration; 4] = [
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(120),
    Duration::from_secs(300),
];

/// Fleet membership ordered by node name. The stable order makes the cycle deterministic: a
/// replayed reconcile reaches the same decision, and observers can predict which node is next.
pub fn fleet_names(nodes: &[Node]) -> Vec<String> {
    let mut names: Vec<String> = nodes.iter().map(|node| node.name_any()).collect();
    names.sort();
    names
}

/// Picks the next node to cycle: the first fleet member, in name order, not yet refreshed.
pub fn next_node(fleet: &[String], nodes_refreshed: &[String]) -> Option<String> {
    fleet
        .iter()
        .find(|name| !nodes_refreshed.contains(name))
        .cloned()
}

/// The delay to respect before re-entering the cycle after `retry_count` failures, if any
/// retries remain.
pub fn retry_delay(retry_count: u32) -> Option<Duration> {
    RETRY_SCHEDULE.get(retry_count as usize).copied()
}
