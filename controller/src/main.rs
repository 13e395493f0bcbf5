use controller::error::{self, Result};
use controller::metrics::RefreshControllerMetrics;
use controller::{
    error_policy, health_check, reconcile, vending_metrics, AutoscalerManagedCapacity, Context,
};
use models::constants::MONITORING_INTERNAL_PORT;
use models::refresh::{K8sClusterClient, NodeRefresh};
use models::telemetry;

use actix_web::{web::Data, App, HttpServer};
use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Controller;
use kube::runtime::watcher;
use snafu::ResultExt;
use std::sync::Arc;
use tracing::{event, Level};

#[actix_web::main]
async fn main() -> Result<()> {
    telemetry::init_telemetry_from_env().context(error::TelemetryInitSnafu)?;

    // In-cluster credentials are preferred; a kubeconfig is the out-of-cluster fallback.
    let k8s_client = kube::client::Client::try_default()
        .await
        .context(error::ClientCreateSnafu)?;

    let refreshes: Api<NodeRefresh> = Api::all(k8s_client.clone());
    // Fail startup loudly when the CRD is absent rather than watching a nonexistent resource.
    refreshes
        .list(&ListParams::default().limit(1))
        .await
        .context(error::MissingCustomResourceDefinitionSnafu)?;

    let prometheus_registry = prometheus::Registry::new();
    let metrics =
        RefreshControllerMetrics::new(&prometheus_registry).context(error::MetricsInitSnafu)?;

    let context = Arc::new(Context {
        client: K8sClusterClient::new(k8s_client),
        capacity: AutoscalerManagedCapacity,
        metrics,
    });

    event!(Level::INFO, "Starting node refresh controller.");

    let controller_runner = Controller::new(refreshes, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|reconciliation| async move {
            match reconciliation {
                Ok((refresh, _)) => event!(
                    Level::DEBUG,
                    name = %refresh.name,
                    "Processed a reconciliation for a NodeRefresh object."
                ),
                Err(err) => event!(Level::WARN, %err, "Reconciliation error."),
            }
        });

    let monitoring_server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(prometheus_registry.clone()))
            .service(vending_metrics)
            .service(health_check)
    })
    .bind(("0.0.0.0", MONITORING_INTERNAL_PORT))
    .context(error::MonitoringServerSnafu)?
    .disable_signals()
    .run();

    tokio::select! {
        _ = controller_runner => {
            event!(Level::INFO, "Controller stream ended. Shutting down.");
        },
        server_result = monitoring_server => {
            server_result.context(error::MonitoringServerSnafu)?;
            event!(Level::ERROR, "Monitoring server exited.");
        },
    };

    Ok(())
}
