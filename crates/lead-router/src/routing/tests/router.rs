use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use super::common::*;
use crate::routing::{assignment_router, ConditionSet, LeadId, Predicate, RuleType, UserId};

fn router(harness: &Harness) -> axum::Router {
    assignment_router(harness.engine.clone(), CancellationToken::new())
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request builds")
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).expect("request builds")
}

#[tokio::test]
async fn assign_route_returns_the_decision() {
    let harness = Harness::new();
    let mut us = rule("R1", 1, RuleType::Manual, &["U1"]);
    us.conditions = us_only();
    harness.add_rule(us);
    harness.add_lead("L1", us_lead(), None);

    let response = router(&harness)
        .oneshot(post_json(
            "/api/v1/organizations/O1/leads/L1/assign",
            json!({ "target_model": "leads" }),
        ))
        .await
        .expect("route executes");

    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json_body(response).await;
    assert_eq!(payload["assigned_to_id"], json!("U1"));
    assert_eq!(payload["reason"], json!("auto_assignment"));
    assert_eq!(payload["changed"], json!(true));
    assert_eq!(harness.owner("L1"), Some(UserId::from("U1")));
}

#[tokio::test]
async fn assign_route_accepts_an_empty_body_and_overrides() {
    let harness = Harness::new();
    let mut canada = rule("R1", 1, RuleType::Manual, &["U9"]);
    canada.conditions = ConditionSet::new(vec![Predicate::equals("country_id", "CA")]);
    harness.add_rule(canada);
    harness.add_lead("L1", us_lead(), None);
    harness.add_lead("L2", us_lead(), None);

    let no_body = router(&harness)
        .oneshot(
            Request::post("/api/v1/organizations/O1/leads/L1/assign")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("route executes");
    assert_eq!(no_body.status(), StatusCode::OK);
    assert_eq!(read_json_body(no_body).await["reason"], json!("no_match"));

    let overridden = router(&harness)
        .oneshot(post_json(
            "/api/v1/organizations/O1/leads/L2/assign",
            json!({ "overrides": { "country_id": "CA" } }),
        ))
        .await
        .expect("route executes");
    assert_eq!(overridden.status(), StatusCode::OK);
    assert_eq!(read_json_body(overridden).await["assigned_to_id"], json!("U9"));
}

#[tokio::test]
async fn malformed_bodies_are_rejected_without_assigning() {
    let harness = Harness::new();
    harness.add_rule(rule("R1", 1, RuleType::Manual, &["U1"]));
    harness.add_lead("L1", us_lead(), None);

    let truncated = router(&harness)
        .oneshot(
            Request::post("/api/v1/organizations/O1/leads/L1/assign")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"target_model": 5, "overrides": {"country_id": "CA"}"#,
                ))
                .expect("request builds"),
        )
        .await
        .expect("route executes");
    assert_eq!(truncated.status(), StatusCode::BAD_REQUEST);

    let mistyped = router(&harness)
        .oneshot(post_json(
            "/api/v1/organizations/O1/leads/L1/assign",
            json!({ "target_model": 5, "overrides": { "country_id": "CA" } }),
        ))
        .await
        .expect("route executes");
    assert_eq!(mistyped.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let preview = router(&harness)
        .oneshot(post_json(
            "/api/v1/organizations/O1/leads/L1/preview",
            json!({ "overrides": ["country_id"] }),
        ))
        .await
        .expect("route executes");
    assert_eq!(preview.status(), StatusCode::UNPROCESSABLE_ENTITY);

    assert_eq!(harness.owner("L1"), None);
    assert!(harness.log().is_empty());
}

#[tokio::test]
async fn unknown_lead_maps_to_not_found() {
    let harness = Harness::new();

    let response = router(&harness)
        .oneshot(post_json(
            "/api/v1/organizations/O1/leads/nope/assign",
            json!({}),
        ))
        .await
        .expect("route executes");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let payload = read_json_body(response).await;
    assert!(payload["error"]
        .as_str()
        .unwrap_or_default()
        .contains("lead store"));
}

#[tokio::test]
async fn collaborator_outage_maps_to_service_unavailable() {
    let harness = Harness::customized(test_config(), |mut collaborators| {
        collaborators.rules = Arc::new(UnavailableRules);
        collaborators
    });
    harness.add_lead("L1", us_lead(), None);

    let response = router(&harness)
        .oneshot(post_json(
            "/api/v1/organizations/O1/leads/L1/assign",
            json!({}),
        ))
        .await
        .expect("route executes");

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn shutdown_cancels_new_assignments() {
    let harness = Harness::new();
    harness.add_rule(rule("R1", 1, RuleType::Manual, &["U1"]));
    harness.add_lead("L1", us_lead(), None);
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let response = assignment_router(harness.engine.clone(), shutdown)
        .oneshot(post_json(
            "/api/v1/organizations/O1/leads/L1/assign",
            json!({}),
        ))
        .await
        .expect("route executes");

    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    assert_eq!(harness.owner("L1"), None);
}

#[tokio::test]
async fn preview_route_does_not_commit() {
    let harness = Harness::new();
    harness.add_rule(rule("R1", 1, RuleType::Manual, &["U1"]));
    harness.add_lead("L1", us_lead(), None);

    let response = router(&harness)
        .oneshot(post_json(
            "/api/v1/organizations/O1/leads/L1/preview",
            json!({}),
        ))
        .await
        .expect("route executes");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json_body(response).await["assigned_to_id"], json!("U1"));
    assert_eq!(harness.owner("L1"), None);
}

#[tokio::test]
async fn stats_routes_project_the_log() {
    let harness = Harness::new();
    harness.add_rule(rule("R1", 1, RuleType::RoundRobin, &["U1", "U2"]));
    for lead in ["L1", "L2", "L3"] {
        harness.add_lead(lead, us_lead(), None);
        harness.assign(lead).await.expect("assignment succeeds");
    }

    let users = router(&harness)
        .oneshot(get(
            "/api/v1/organizations/O1/assignment-stats/users?target_model=leads",
        ))
        .await
        .expect("route executes");
    assert_eq!(users.status(), StatusCode::OK);
    let users = read_json_body(users).await;
    assert_eq!(users[0]["user_id"], json!("U1"));
    assert_eq!(users[0]["assigned_count"], json!(2));
    assert_eq!(users[1]["assigned_count"], json!(1));

    let rules = router(&harness)
        .oneshot(get("/api/v1/organizations/O1/assignment-stats/rules"))
        .await
        .expect("route executes");
    assert_eq!(rules.status(), StatusCode::OK);
    let rules = read_json_body(rules).await;
    assert_eq!(rules[0]["rule_id"], json!("R1"));
    assert_eq!(rules[0]["total_matches"], json!(3));
    assert_eq!(rules[0]["match_rate"], json!(1.0));
}

#[tokio::test]
async fn invalidate_route_refreshes_cached_rules() {
    let mut config = test_config();
    config.catalog_ttl = std::time::Duration::from_secs(300);
    let harness = Harness::customized(config, |collaborators| collaborators);
    harness.add_rule(rule("R1", 1, RuleType::Manual, &["U1"]));
    harness.add_lead("L1", us_lead(), None);

    let preview = |harness: &Harness| {
        harness
            .engine
            .preview(&org(), "leads", &LeadId::from("L1"), Default::default())
            .expect("preview succeeds")
    };
    assert_eq!(assigned_to(&preview(&harness)), Some("U1"));

    harness.add_rule(rule("R0", 0, RuleType::Manual, &["U2"]));
    assert_eq!(assigned_to(&preview(&harness)), Some("U1"));

    let response = router(&harness)
        .oneshot(
            Request::post("/api/v1/organizations/O1/assignment-rules/invalidate")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("route executes");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(assigned_to(&preview(&harness)), Some("U2"));
}
