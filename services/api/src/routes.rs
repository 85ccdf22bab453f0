use crate::infra::AppState;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Extension;
use axum::Json;
use lead_router::routing::{assignment_router, AssignmentEngine};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub(crate) fn with_operational_routes(
    engine: Arc<AssignmentEngine>,
    shutdown: CancellationToken,
) -> axum::Router {
    assignment_router(engine, shutdown)
        .route("/health", axum::routing::get(healthcheck))
        .route("/ready", axum::routing::get(readiness_endpoint))
        .route("/metrics", axum::routing::get(metrics_endpoint))
}

pub(crate) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "unavailable" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use lead_router::config::RoutingConfig;
    use lead_router::routing::{
        AssignToType, AssignmentRule, ConditionSet, FixedClock, InMemoryBackend, LeadId,
        LeadRecord, OrganizationId, RuleId, RuleType, UserId,
    };
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::sync::atomic::AtomicBool;
    use tower::ServiceExt;

    fn app(backend: &InMemoryBackend, ready: bool) -> axum::Router {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 9, 22, 12, 0, 0)
                .single()
                .expect("valid timestamp"),
        ));
        let engine = Arc::new(AssignmentEngine::new(
            RoutingConfig::default(),
            backend.collaborators(clock, None),
        ));
        let state = AppState {
            readiness: Arc::new(AtomicBool::new(ready)),
            metrics: Arc::new(PrometheusBuilder::new().build_recorder().handle()),
        };
        with_operational_routes(engine, CancellationToken::new()).layer(Extension(state))
    }

    fn seed(backend: &InMemoryBackend) {
        let org = OrganizationId::from("O1");
        backend
            .rules
            .upsert_rule(AssignmentRule {
                id: RuleId::from("R1"),
                organization_id: org.clone(),
                name: "catch-all".to_string(),
                target_model: "leads".to_string(),
                rule_type: RuleType::Manual,
                priority: 1,
                is_active: true,
                conditions: ConditionSet::default(),
                assign_to_type: AssignToType::User,
                candidate_ids: vec!["U1".to_string()],
                max_assignments_per_user: 0,
                schedule: Default::default(),
                created_at: Utc
                    .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
                    .single()
                    .expect("valid timestamp"),
            })
            .expect("rule stored");
        backend
            .leads
            .insert_lead(&org, &LeadId::from("L1"), LeadRecord::default(), None)
            .expect("lead stored");
    }

    #[tokio::test]
    async fn health_is_always_ok() {
        let response = app(&InMemoryBackend::default(), false)
            .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("route executes");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_follows_the_flag() {
        let starting = app(&InMemoryBackend::default(), false)
            .oneshot(Request::get("/ready").body(Body::empty()).expect("request"))
            .await
            .expect("route executes");
        assert_eq!(starting.status(), StatusCode::SERVICE_UNAVAILABLE);

        let ready = app(&InMemoryBackend::default(), true)
            .oneshot(Request::get("/ready").body(Body::empty()).expect("request"))
            .await
            .expect("route executes");
        assert_eq!(ready.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_are_served_as_prometheus_text() {
        let response = app(&InMemoryBackend::default(), true)
            .oneshot(Request::get("/metrics").body(Body::empty()).expect("request"))
            .await
            .expect("route executes");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
    }

    #[tokio::test]
    async fn assignment_routes_are_mounted() {
        let backend = InMemoryBackend::default();
        seed(&backend);

        let response = app(&backend, true)
            .oneshot(
                Request::post("/api/v1/organizations/O1/leads/L1/assign")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("route executes");

        assert_eq!(response.status(), StatusCode::OK);
        let owners = backend.owners(&OrganizationId::from("O1"));
        assert_eq!(
            owners.get(&LeadId::from("L1")).cloned().flatten(),
            Some(UserId::from("U1"))
        );
    }
}
