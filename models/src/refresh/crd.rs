use super::error::{self, Result};

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::collections::BTreeMap;
use validator::Validate;

/// How many condition entries are retained on a `NodeRefreshStatus`. Older entries are dropped
/// in append order.
pub const MAX_CONDITIONS: usize = 10;

/// RefreshPhase tracks a fleet's progress through one node-cycling pass.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, JsonSchema)]
pub enum RefreshPhase {
    /// Waiting for a schedule to come due, or for a one-shot refresh to begin. This is both the
    /// starting and the retry-recovery state.
    Idle,
    /// Waiting for spare scheduling capacity before the current node is taken out of service.
    Provisioning,
    /// Evicting workloads from the current node.
    Draining,
    /// Verifying workload health after the current node was drained.
    Validating,
    /// Every fleet node has been cycled. Terminal unless a schedule is configured.
    Completed,
    /// The refresh hit a gate it could not pass; subject to the retry schedule.
    Failed,
}

impl Default for RefreshPhase {
    fn default() -> Self {
        RefreshPhase::Idle
    }
}

serde_plain::derive_display_from_serialize!(RefreshPhase);

/// The `NodeRefreshSpec` declares a fleet of nodes to cycle and the safety limits to respect
/// while doing so. The controller never modifies the spec; all progress is recorded on the
/// `NodeRefreshStatus` subresource.
#[derive(Clone, CustomResource, Serialize, Deserialize, Debug, Eq, PartialEq, JsonSchema, Validate)]
#[kube(
    derive = "Default",
    derive = "PartialEq",
    group = "noderefresh.io",
    kind = "NodeRefresh",
    plural = "noderefreshes",
    shortname = "nr",
    singular = "noderefresh",
    status = "NodeRefreshStatus",
    version = "v1",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Current Node", "type":"string", "jsonPath":".status.currentNode"}"#,
    printcolumn = r#"{"name":"Total", "type":"integer", "jsonPath":".status.totalNodes"}"#,
    printcolumn = r#"{"name":"Next Refresh", "type":"string", "jsonPath":".status.nextRefreshTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeRefreshSpec {
    /// Labels a node must carry (all of them) to be a member of the target fleet.
    pub target_node_labels: BTreeMap<String, String>,
    /// Optional cron expression. When absent the refresh runs once, on creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_schedule: Option<String>,
    /// Upper bound on concurrently evicted pods while draining a node.
    #[serde(default = "default_max_pods_to_move_at_once")]
    #[validate(range(min = 1))]
    pub max_pods_to_move_at_once: u32,
    /// Grace period handed through to the eviction API.
    #[serde(default = "default_grace_period_seconds")]
    pub grace_period_seconds: u32,
    /// Minimum percentage of running pods for the cluster to count as healthy.
    #[serde(default = "default_min_health_threshold")]
    #[validate(range(max = 100))]
    pub min_health_threshold: u32,
}

fn default_max_pods_to_move_at_once() -> u32 {
    5
}

fn default_grace_period_seconds() -> u32 {
    300
}

fn default_min_health_threshold() -> u32 {
    80
}

impl Default for NodeRefreshSpec {
    fn default() -> Self {
        NodeRefreshSpec {
            target_node_labels: BTreeMap::new(),
            refresh_schedule: None,
            max_pods_to_move_at_once: default_max_pods_to_move_at_once(),
            grace_period_seconds: default_grace_period_seconds(),
            min_health_threshold: default_min_health_threshold(),
        }
    }
}

/// One entry in the bounded condition history kept on the status object.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshCondition {
    /// The phase entered by the transition this condition records.
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    pub last_transition_time: String,
    pub reason: String,
    pub message: String,
}

/// `NodeRefreshStatus` is the authoritative progress record for a refresh. The controller holds
/// no progress in memory between reconciles; everything needed to resume after a crash lives
/// here.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeRefreshStatus {
    #[serde(default)]
    pub phase: RefreshPhase,
    /// The node currently being cycled. Set while a cycle is between Provisioning and Validating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<String>,
    /// Fleet size captured when the current cycle started.
    #[serde(default)]
    pub total_nodes: u32,
    /// Names of the nodes fully cycled so far, in completion order. Reset when a new cycle
    /// starts.
    #[serde(default)]
    pub nodes_refreshed: Vec<String>,
    #[serde(default)]
    pub pods_moved_successfully: u64,
    #[serde(default)]
    pub pods_moves_failed: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_refresh_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub conditions: Vec<RefreshCondition>,
}

impl NodeRefreshStatus {
    /// Moves the status into `phase`, records the message, and appends exactly one condition
    /// entry for the transition.
    pub fn transition(&mut self, phase: RefreshPhase, message: impl Into<String>, now: DateTime<Utc>) {
        let message = message.into();
        self.phase = phase;
        self.message = Some(message.clone());
        self.conditions.push(RefreshCondition {
            condition_type: phase.to_string(),
            status: "True".to_string(),
            last_transition_time: now.to_rfc3339(),
            reason: message.clone(),
            message,
        });
        if self.conditions.len() > MAX_CONDITIONS {
            let excess = self.conditions.len() - MAX_CONDITIONS;
            self.conditions.drain(..excess);
        }
    }

    pub fn set_last_refresh_time(&mut self, ts: DateTime<Utc>) {
        self.last_refresh_time = Some(ts.to_rfc3339());
    }

    pub fn set_next_refresh_time(&mut self, ts: DateTime<Utc>) {
        self.next_refresh_time = Some(ts.to_rfc3339());
    }

    /// JsonSchema cannot appropriately handle DateTime objects. This accessor returns the time
    /// of the last completed cycle as a DateTime.
    pub fn last_refresh_time(&self) -> Result<Option<DateTime<Utc>>> {
        parse_timestamp(self.last_refresh_time.as_deref())
    }

    /// The published next firing time of the configured schedule, as a DateTime.
    pub fn next_refresh_time(&self) -> Result<Option<DateTime<Utc>>> {
        parse_timestamp(self.next_refresh_time.as_deref())
    }

    /// The time of the most recent phase transition, taken from the condition history.
    pub fn last_transition_time(&self) -> Result<Option<DateTime<Utc>>> {
        parse_timestamp(
            self.conditions
                .last()
                .map(|condition| condition.last_transition_time.as_str()),
        )
    }
}

fn parse_timestamp(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|ts_str| {
            DateTime::parse_from_rfc3339(ts_str)
                // Convert `DateTime<FixedOffset>` into `DateTime<Utc>`
                .map(|ts| ts.into())
                .context(error::TimestampFormatSnafu {
                    timestamp: ts_str.to_string(),
                })
        })
        .transpose()
}
