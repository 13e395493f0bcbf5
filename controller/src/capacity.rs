//! Abstraction over the external mechanism that supplies spare scheduling room before a node
//! is taken out of service.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{event, Level};

/// What the provider knows about spare room beyond the fleet's current size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityStatus {
    SpareAvailable,
    ScalingInProgress,
}

/// A source of spare node capacity. The reconciler asks for a spare whenever the cluster has no
/// ready node beyond the fleet; how the spare comes to exist (autoscaler, cloud API, a human) is
/// this trait's problem.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CapacityProvider: Send + Sync {
    /// Request at least one schedulable node beyond the fleet matching `fleet_labels`; reports
    /// whether the spare is already available or still being provisioned.
    async fn ensure_spare_capacity(
        &self,
        fleet_labels: &BTreeMap<String, String>,
    ) -> CapacityStatus;
}

/// Provider for clusters where an external autoscaler restores capacity on its own. It never
/// has a spare to hand out; it only reports that scaling is under way while the reconciler
/// keeps polling the ready-node count.
#[derive(Clone, Copy, Default)]
pub struct AutoscalerManagedCapacity;

#[async_trait]
impl CapacityProvider for AutoscalerManagedCapacity {
    async fn ensure_spare_capacity(
        &self,
        fleet_labels: &BTreeMap<String, String>,
    ) -> CapacityStatus {
        event!(
            Level::INFO,
            ?fleet_labels,
            "Waiting for the cluster autoscaler to supply a spare node."
        );
        CapacityStatus::ScalingInProgress
    }
}
