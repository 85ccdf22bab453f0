use crate::infra::{parse_timestamp, seed_backend};
use chrono::{DateTime, Duration, Utc};
use clap::Args;
use lead_router::config::AppConfig;
use lead_router::error::AppError;
use lead_router::routing::{
    AssignmentDecision, AssignmentEngine, FixedClock, InMemoryBackend, LeadId, OrganizationId,
    RuleEffectiveness, UserAssignmentStats, UserId,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Args, Debug)]
pub(crate) struct SimulateArgs {
    /// Routing fixture with rules, territories, teams and user names (JSON)
    #[arg(long)]
    pub(crate) rules: PathBuf,
    /// Leads to route, in arrival order (JSON array)
    #[arg(long)]
    pub(crate) leads: PathBuf,
    /// Wall-clock time the batch is routed at (RFC 3339). Defaults to now.
    #[arg(long, value_parser = crate::infra::parse_timestamp)]
    pub(crate) at: Option<DateTime<Utc>>,
    /// Seconds the simulated clock moves forward between leads
    #[arg(long, default_value_t = 0)]
    pub(crate) step_secs: i64,
    /// Target model to route for (defaults to ROUTER_TARGET_MODEL)
    #[arg(long)]
    pub(crate) target_model: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SimulationReport {
    pub(crate) organization_id: OrganizationId,
    pub(crate) target_model: String,
    pub(crate) decisions: Vec<AssignmentDecision>,
    pub(crate) failures: Vec<SimulationFailure>,
    pub(crate) owners: BTreeMap<LeadId, Option<UserId>>,
    pub(crate) user_stats: Vec<UserAssignmentStats>,
    pub(crate) rule_effectiveness: Vec<RuleEffectiveness>,
    pub(crate) events_published: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct SimulationFailure {
    pub(crate) lead_id: LeadId,
    pub(crate) error: String,
    pub(crate) retryable: bool,
}

pub(crate) async fn run_simulation(args: SimulateArgs) -> Result<(), AppError> {
    let report = simulate(args).await?;
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(err) => println!("Simulation report unavailable: {err}"),
    }
    Ok(())
}

/// Routes every lead of the batch, one after another, against a fresh
/// in-memory backend.
pub(crate) async fn simulate(args: SimulateArgs) -> Result<SimulationReport, AppError> {
    let SimulateArgs {
        rules,
        leads,
        at,
        step_secs,
        target_model,
    } = args;

    let routing = AppConfig::load()?.routing;
    let target_model = target_model.unwrap_or_else(|| routing.default_target_model.clone());

    let backend = InMemoryBackend::default();
    let (organization_id, batch) = seed_backend(&backend, &rules, Some(leads.as_path()))?;

    let clock = Arc::new(FixedClock::new(at.unwrap_or_else(Utc::now)));
    let engine = AssignmentEngine::new(routing, backend.collaborators(clock.clone(), None));
    let cancel = CancellationToken::new();

    let mut decisions = Vec::new();
    let mut failures = Vec::new();
    for lead in batch.ids() {
        match engine
            .assign_lead(&cancel, &organization_id, &target_model, lead, BTreeMap::new())
            .await
        {
            Ok(decision) => decisions.push(decision),
            Err(err) => {
                warn!(lead_id = %lead, error = %err, "simulated assignment failed");
                failures.push(SimulationFailure {
                    lead_id: lead.clone(),
                    error: err.to_string(),
                    retryable: err.is_retryable(),
                });
            }
        }
        clock.advance(Duration::seconds(step_secs));
    }

    Ok(SimulationReport {
        owners: backend.owners(&organization_id),
        user_stats: engine.stats_by_user(&organization_id, &target_model)?,
        rule_effectiveness: engine.rule_effectiveness(&organization_id)?,
        events_published: backend.events.events().len(),
        organization_id,
        target_model,
        decisions,
        failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lead_router::routing::AssignmentReason;
    use std::io::Write;
    use std::path::Path;

    const RULES: &str = r#"{
        "organization_id": "O1",
        "rules": [{
            "id": "R1",
            "organization_id": "O1",
            "name": "US round robin",
            "target_model": "leads",
            "rule_type": "round_robin",
            "priority": 1,
            "is_active": true,
            "conditions": [{ "field": "country_id", "operator": "eq", "value": "US" }],
            "assign_to_type": "user",
            "candidate_ids": ["U1", "U2"],
            "max_assignments_per_user": 0,
            "created_at": "2025-01-01T00:00:00Z"
        }],
        "users": { "U1": "Ada", "U2": "Grace" }
    }"#;

    const LEADS: &str = r#"[
        { "id": "L1", "record": { "country_id": "US" } },
        { "id": "L2", "record": { "country_id": "US" } },
        { "id": "L3", "record": { "country_id": "US" } },
        { "id": "L4", "record": { "country_id": "FR" } }
    ]"#;

    fn write_fixture(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).expect("create fixture");
        file.write_all(contents.as_bytes()).expect("write fixture");
        path
    }

    #[tokio::test]
    async fn simulation_routes_the_batch_in_order() {
        let dir = std::env::temp_dir().join(format!("lead-router-sim-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        let args = SimulateArgs {
            rules: write_fixture(&dir, "rules.json", RULES),
            leads: write_fixture(&dir, "leads.json", LEADS),
            at: Some(parse_timestamp("2025-09-22T12:00:00Z").expect("valid timestamp")),
            step_secs: 60,
            target_model: Some("leads".to_string()),
        };

        let report = simulate(args).await.expect("simulation runs");
        std::fs::remove_dir_all(&dir).ok();

        let assignees: Vec<_> = report
            .decisions
            .iter()
            .map(|decision| decision.assigned_to_id.as_ref().map(|id| id.0.as_str()))
            .collect();
        assert_eq!(assignees, vec![Some("U1"), Some("U2"), Some("U1"), None]);
        assert_eq!(report.decisions[3].reason, AssignmentReason::NoMatch);
        assert_eq!(report.decisions[0].assigned_to_name.as_deref(), Some("Ada"));
        assert!(report.failures.is_empty());
        assert_eq!(report.events_published, 3);

        assert_eq!(report.user_stats[0].user_id, UserId::from("U1"));
        assert_eq!(report.user_stats[0].assigned_count, 2);
        assert_eq!(report.rule_effectiveness[0].total_matches, 3);
        assert_eq!(
            report.owners.get(&LeadId::from("L4")).cloned().flatten(),
            None
        );
    }
}
