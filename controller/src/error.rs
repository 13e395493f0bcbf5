use snafu::Snafu;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to create client: '{}'", source))]
    ClientCreate { source: kube::Error },

    #[snafu(display(
        "Unable to list NodeRefresh objects. Is the NodeRefresh CRD installed? '{}'",
        source
    ))]
    MissingCustomResourceDefinition { source: kube::Error },

    #[snafu(display("Error configuring tracing: '{}'", source))]
    TelemetryInit {
        source: models::telemetry::TelemetryConfigError,
    },

    #[snafu(display("Error configuring metrics: '{}'", source))]
    MetricsInit {
        source: crate::metrics::error::MetricsError,
    },

    #[snafu(display("Error running monitoring server: '{}'", source))]
    MonitoringServer { source: std::io::Error },

    #[snafu(display("Unable to fetch NodeRefresh '{}': '{}'", name, source))]
    FetchNodeRefresh {
        source: models::refresh::NodeRefreshError,
        name: String,
    },

    #[snafu(display("Unable to write status for NodeRefresh '{}': '{}'", name, source))]
    WriteStatus {
        source: models::refresh::NodeRefreshError,
        name: String,
    },

    #[snafu(display("Unable to list fleet nodes: '{}'", source))]
    ListFleet {
        source: models::refresh::NodeRefreshError,
    },

    #[snafu(display("Unable to list cluster nodes: '{}'", source))]
    ListClusterNodes {
        source: models::refresh::NodeRefreshError,
    },

    #[snafu(display("Unable to observe cluster pods for the health gate: '{}'", source))]
    ObserveClusterHealth {
        source: models::refresh::NodeRefreshError,
    },

    #[snafu(display("Unable to drain node '{}': '{}'", node_name, source))]
    DrainNode {
        source: models::refresh::drain::error::DrainError,
        node_name: String,
    },

    #[snafu(display("NodeRefresh '{}' carries a malformed timestamp: '{}'", name, source))]
    MalformedTimestamp {
        source: models::refresh::NodeRefreshError,
        name: String,
    },
}
