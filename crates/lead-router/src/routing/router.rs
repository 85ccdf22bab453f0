use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::domain::{LeadId, OrganizationId};
use super::engine::{AssignmentEngine, EngineError};
use crate::error::AppError;

#[derive(Clone)]
struct RouterState {
    engine: Arc<AssignmentEngine>,
    shutdown: CancellationToken,
}

/// Body of the assign and preview endpoints. Both fields are optional.
#[derive(Debug, Default, Deserialize)]
pub struct AssignRequest {
    #[serde(default)]
    pub target_model: Option<String>,
    #[serde(default)]
    pub overrides: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub target_model: Option<String>,
}

/// HTTP endpoints over the assignment engine. In-flight assignments are cancelled
/// when `shutdown` fires.
pub fn assignment_router(engine: Arc<AssignmentEngine>, shutdown: CancellationToken) -> Router {
    Router::new()
        .route(
            "/api/v1/organizations/:org/leads/:lead/assign",
            post(assign_handler),
        )
        .route(
            "/api/v1/organizations/:org/leads/:lead/preview",
            post(preview_handler),
        )
        .route(
            "/api/v1/organizations/:org/assignment-stats/users",
            get(user_stats_handler),
        )
        .route(
            "/api/v1/organizations/:org/assignment-stats/rules",
            get(rule_stats_handler),
        )
        .route(
            "/api/v1/organizations/:org/assignment-rules/invalidate",
            post(invalidate_handler),
        )
        .with_state(RouterState { engine, shutdown })
}

fn target_model(engine: &AssignmentEngine, requested: Option<String>) -> String {
    requested
        .filter(|model| !model.trim().is_empty())
        .unwrap_or_else(|| engine.config().default_target_model.clone())
}

fn error_response(err: EngineError) -> Response {
    AppError::from(err).into_response()
}

/// An empty body means "no options"; anything else must be a valid request.
fn parse_request(body: &Bytes) -> Result<AssignRequest, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(AssignRequest::default());
    }
    axum::Json::<AssignRequest>::from_bytes(body)
        .map(|axum::Json(request)| request)
        .map_err(IntoResponse::into_response)
}

async fn assign_handler(
    State(state): State<RouterState>,
    Path((org, lead)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(rejection) => return rejection,
    };
    let target_model = target_model(&state.engine, request.target_model);
    let cancel = state.shutdown.child_token();

    match state
        .engine
        .assign_lead(
            &cancel,
            &OrganizationId(org),
            &target_model,
            &LeadId(lead),
            request.overrides,
        )
        .await
    {
        Ok(decision) => (StatusCode::OK, axum::Json(decision)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn preview_handler(
    State(state): State<RouterState>,
    Path((org, lead)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(rejection) => return rejection,
    };
    let target_model = target_model(&state.engine, request.target_model);

    match state.engine.preview(
        &OrganizationId(org),
        &target_model,
        &LeadId(lead),
        request.overrides,
    ) {
        Ok(decision) => (StatusCode::OK, axum::Json(decision)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn user_stats_handler(
    State(state): State<RouterState>,
    Path(org): Path<String>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let target_model = target_model(&state.engine, query.target_model);
    match state
        .engine
        .stats_by_user(&OrganizationId(org), &target_model)
    {
        Ok(stats) => (StatusCode::OK, axum::Json(stats)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn rule_stats_handler(
    State(state): State<RouterState>,
    Path(org): Path<String>,
) -> Response {
    match state.engine.rule_effectiveness(&OrganizationId(org)) {
        Ok(stats) => (StatusCode::OK, axum::Json(stats)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn invalidate_handler(
    State(state): State<RouterState>,
    Path(org): Path<String>,
) -> Response {
    let org = OrganizationId(org);
    state.engine.invalidate_rules(&org);
    let payload = json!({ "organization_id": org, "invalidated": true });
    (StatusCode::ACCEPTED, axum::Json(payload)).into_response()
}
