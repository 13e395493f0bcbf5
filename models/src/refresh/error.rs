use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to parse timestamp '{}' from NodeRefresh status: '{}'", timestamp, source))]
    TimestampFormat {
        source: chrono::ParseError,
        timestamp: String,
    },

    #[snafu(display("Unable to fetch NodeRefresh '{}': '{}'", name, source))]
    GetNodeRefresh { source: kube::Error, name: String },

    #[snafu(display("Unable to update NodeRefresh status ('{}'): '{}'", name, source))]
    UpdateNodeRefreshStatus { source: kube::Error, name: String },

    #[snafu(display("Unable to create patch to send to Kubernetes API: '{}'", source))]
    CreateK8SPatch { source: serde_json::error::Error },

    #[snafu(display("Unable to list nodes: '{}'", source))]
    ListNodes { source: kube::Error },

    #[snafu(display("Unable to list pods: '{}'", source))]
    ListPods { source: kube::Error },

    #[snafu(display(
        "Unable to list PodDisruptionBudgets in namespace '{}': '{}'",
        namespace,
        source
    ))]
    ListDisruptionBudgets {
        source: kube::Error,
        namespace: String,
    },

    #[snafu(display("Unable to create eviction for Pod '{}': '{}'", pod_name, source))]
    EvictPod {
        source: kube::Error,
        pod_name: String,
    },

    #[snafu(display(
        "Unable to read {} '{}/{}': '{}'",
        kind,
        namespace,
        name,
        source
    ))]
    GetWorkload {
        source: kube::Error,
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[snafu(display("Cluster API call '{}' did not complete within the allowed time", operation))]
    ApiTimeout {
        source: tokio::time::error::Elapsed,
        operation: &'static str,
    },
}

impl Error {
    /// The HTTP status code the API server answered with, when this error carries one.
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Error::GetNodeRefresh { source, .. }
            | Error::UpdateNodeRefreshStatus { source, .. }
            | Error::ListNodes { source }
            | Error::ListPods { source }
            | Error::ListDisruptionBudgets { source, .. }
            | Error::EvictPod { source, .. }
            | Error::GetWorkload { source, .. } => match source {
                kube::Error::Api(response) => Some(response.code),
                _ => None,
            },
            _ => None,
        }
    }
}
