//! Tracing and metrics setup for the broker service.
//!
//! Logs go to a `tracing-subscriber` fmt layer filtered by `RUST_LOG`
//! (default `info`). Counters such as `warden_auth_total`,
//! `warden_accept_errors_total` and the reaper's sweep metrics are recorded
//! through the `metrics` facade into a Prometheus recorder. A small `axum`
//! server exposes them next to the `/live` and `/ready` checks.
//! Readiness follows the liveness store: a broker that cannot reach its
//! store reports 503 so it is taken out of rotation.

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::Arc;
#[cfg(test)]
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use warden_liveness::LivenessStore;

#[cfg(test)]
static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global log subscriber and the Prometheus recorder.
///
/// Call once, before anything records a metric; counters recorded earlier
/// are lost. `service` is attached to the startup log line only.
///
/// Returns the handle `/metrics` renders from.
pub fn init_observability(service: &str) -> PrometheusHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    install_subscriber(
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer()),
    );
    let handle = install_recorder();
    tracing::info!(service, "observability initialized");
    handle
}

/// Serve the metrics and health endpoints on `addr` until the task is dropped.
///
/// - `/metrics`: Prometheus text exposition.
/// - `/live`: always `ok` while the process runs.
/// - `/ready`: `ok` when `store.health_check()` passes, 503 otherwise.
///
/// Returns an I/O error if the address cannot be bound.
pub async fn serve_metrics(
    handle: PrometheusHandle,
    store: Arc<dyn LivenessStore>,
    addr: SocketAddr,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics listener started");
    axum::serve(listener, health_router(handle, store).into_make_service()).await
}

fn health_router(handle: PrometheusHandle, store: Arc<dyn LivenessStore>) -> Router {
    Router::new()
        .route("/metrics", get(move || async move { handle.render() }))
        .route("/live", get(|| async { "ok" }))
        .route("/ready", get(move || readiness(Arc::clone(&store))))
}

async fn readiness(store: Arc<dyn LivenessStore>) -> (StatusCode, &'static str) {
    match store.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(err) => {
            tracing::warn!(backend = store.backend_name(), error = %err, "readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "liveness store unavailable")
        }
    }
}

// A second recorder install panics, so tests share the first handle.
fn install_recorder() -> PrometheusHandle {
    #[cfg(test)]
    {
        RECORDER
            .get_or_init(|| {
                PrometheusBuilder::new()
                    .install_recorder()
                    .expect("install metrics recorder")
            })
            .clone()
    }
    #[cfg(not(test))]
    {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("install metrics recorder")
    }
}

// Tests may run after another test installed a subscriber.
fn install_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    if cfg!(test) {
        let _ = subscriber.try_init();
    } else {
        subscriber.init();
    }
}
