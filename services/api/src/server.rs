use crate::cli::ServeArgs;
use crate::infra::{seed_backend, AppState};
use crate::routes::with_operational_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use lead_router::config::AppConfig;
use lead_router::error::AppError;
use lead_router::routing::memory::BroadcastEventSink;
use lead_router::routing::{AssignmentEngine, EventSink, InMemoryBackend, SystemClock};
use lead_router::telemetry;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const EVENT_BUFFER: usize = 256;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let backend = InMemoryBackend::default();
    if let Some(rules) = args.rules.as_deref() {
        let (organization_id, batch) = seed_backend(&backend, rules, args.leads.as_deref())?;
        info!(
            %organization_id,
            leads = batch.0.len(),
            "seeded in-memory routing data"
        );
    }

    let shutdown = CancellationToken::new();
    let events = Arc::new(BroadcastEventSink::new(EVENT_BUFFER));
    spawn_event_logger(&events, shutdown.clone());

    let engine = Arc::new(AssignmentEngine::new(
        config.routing.clone(),
        backend.collaborators(Arc::new(SystemClock), Some(events as Arc<dyn EventSink>)),
    ));

    let app = with_operational_routes(engine, shutdown.clone())
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "lead router ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown, readiness_flag))
        .await?;
    Ok(())
}

/// Resolves on ctrl-c, after flipping readiness and cancelling in-flight assignments.
async fn wait_for_shutdown(
    shutdown: CancellationToken,
    readiness: Arc<std::sync::atomic::AtomicBool>,
) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "unable to listen for shutdown signal");
        return;
    }
    info!("shutdown requested");
    readiness.store(false, Ordering::Release);
    shutdown.cancel();
}

fn spawn_event_logger(events: &BroadcastEventSink, shutdown: CancellationToken) {
    let mut receiver = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = receiver.recv() => received,
            };
            match event {
                Ok(event) => info!(
                    kind = ?event.kind,
                    organization_id = %event.organization_id,
                    lead_id = %event.lead_id,
                    "assignment event"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "assignment event logger fell behind")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
