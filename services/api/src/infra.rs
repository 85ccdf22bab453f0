use chrono::{DateTime, Utc};
use lead_router::error::AppError;
use lead_router::routing::{InMemoryBackend, LeadBatch, OrganizationId, RoutingFixture};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| format!("failed to parse '{raw}' as an RFC 3339 timestamp ({err})"))
}

/// Loads the routing fixture and, when given, the lead batch into `backend`.
pub(crate) fn seed_backend(
    backend: &InMemoryBackend,
    rules: &Path,
    leads: Option<&Path>,
) -> Result<(OrganizationId, LeadBatch), AppError> {
    let fixture = RoutingFixture::from_path(rules)?;
    fixture.install(backend)?;

    let batch = match leads {
        Some(path) => LeadBatch::from_path(path)?,
        None => LeadBatch::default(),
    };
    batch.install(&fixture.organization_id, backend)?;

    Ok((fixture.organization_id, batch))
}
