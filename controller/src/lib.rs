mod capacity;
mod reconciler;

pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod statemachine;

pub use crate::capacity::{AutoscalerManagedCapacity, CapacityProvider, CapacityStatus};
pub use crate::reconciler::{error_policy, reconcile, Context};

use actix_web::{get, http::header::ContentType, web::Data, HttpResponse};
use prometheus::{Encoder, TextEncoder};

/// Serves the Prometheus-encoded metrics gathered by the controller.
#[get("/metrics")]
pub async fn vending_metrics(registry: Data<prometheus::Registry>) -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buf = Vec::new();
    if let Err(err) = encoder.encode(&metric_families[..], &mut buf) {
        tracing::error!(%err, "Could not encode metrics.");
    }

    let body = String::from_utf8(buf).unwrap_or_default();
    HttpResponse::Ok()
        .insert_header(ContentType::plaintext())
        .body(body)
}

/// Liveness route for the controller deployment.
#[get("/ping")]
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json("pong")
}
