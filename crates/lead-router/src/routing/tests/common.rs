use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::response::Response;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::RoutingConfig;
use crate::routing::fairness::{CursorMark, FairnessState};
use crate::routing::repository::{
    AssignmentEvent, AssignmentLog, CounterKey, CounterStore, EventSink, LeadStore,
    RuleRepository, SinkError, StoreError,
};
use crate::routing::{
    ActiveSchedule, AssignToType, AssignmentDecision, AssignmentEngine, AssignmentLogEntry,
    AssignmentReason, AssignmentRule, Collaborators, ConditionSet, EngineError, FixedClock,
    InMemoryBackend, LeadId, LeadRecord, OrganizationId, Predicate, RuleId, RuleType, Territory,
    UserId,
};

pub(super) fn org() -> OrganizationId {
    OrganizationId::from("O1")
}

/// 2025-09-22 is a Monday.
pub(super) fn monday_at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 22, hour, minute, 0)
        .single()
        .expect("valid timestamp")
}

pub(super) fn users(ids: &[&str]) -> Vec<UserId> {
    ids.iter().map(|id| UserId::from(*id)).collect()
}

pub(super) fn us_only() -> ConditionSet {
    ConditionSet::new(vec![Predicate::equals("country_id", "US")])
}

pub(super) fn us_lead() -> LeadRecord {
    LeadRecord::default()
        .with("country_id", "US")
        .with("expected_revenue", 12_500)
}

pub(super) fn rule(
    id: &str,
    priority: i32,
    rule_type: RuleType,
    candidates: &[&str],
) -> AssignmentRule {
    AssignmentRule {
        id: RuleId::from(id),
        organization_id: org(),
        name: format!("rule {id}"),
        target_model: "leads".to_string(),
        rule_type,
        priority,
        is_active: true,
        conditions: ConditionSet::default(),
        assign_to_type: AssignToType::User,
        candidate_ids: candidates.iter().map(|id| id.to_string()).collect(),
        max_assignments_per_user: 0,
        schedule: ActiveSchedule::default(),
        created_at: Utc
            .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
            .single()
            .expect("valid timestamp"),
    }
}

pub(super) fn territory(id: &str, priority: i32, assigned: &[&str]) -> Territory {
    Territory {
        id: RuleId::from(id),
        organization_id: org(),
        name: format!("territory {id}"),
        priority,
        is_active: true,
        conditions: ConditionSet::default(),
        assigned_users: users(assigned),
        assigned_teams: Vec::new(),
        max_assignments_per_user: 0,
        schedule: ActiveSchedule::default(),
        created_at: Utc
            .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
            .single()
            .expect("valid timestamp"),
    }
}

pub(super) fn test_config() -> RoutingConfig {
    RoutingConfig {
        catalog_ttl: Duration::ZERO,
        lock_timeout: Duration::from_millis(500),
        commit_attempts: 3,
        default_target_model: "leads".to_string(),
    }
}

/// Engine wired to in-memory collaborators with a clock pinned to Monday noon.
pub(super) struct Harness {
    pub(super) backend: InMemoryBackend,
    pub(super) clock: Arc<FixedClock>,
    pub(super) engine: Arc<AssignmentEngine>,
}

impl Harness {
    pub(super) fn new() -> Self {
        Self::customized(test_config(), |collaborators| collaborators)
    }

    /// Lets a test swap individual collaborators before the engine is built.
    pub(super) fn customized(
        config: RoutingConfig,
        customize: impl FnOnce(Collaborators) -> Collaborators,
    ) -> Self {
        let backend = InMemoryBackend::default();
        let clock = Arc::new(FixedClock::new(monday_at(12, 0)));
        let collaborators = customize(backend.collaborators(clock.clone(), None));
        let engine = Arc::new(AssignmentEngine::new(config, collaborators));
        Self {
            backend,
            clock,
            engine,
        }
    }

    pub(super) fn add_rule(&self, rule: AssignmentRule) {
        self.backend.rules.upsert_rule(rule).expect("rule stored");
    }

    pub(super) fn add_territory(&self, territory: Territory) {
        self.backend
            .rules
            .upsert_territory(territory)
            .expect("territory stored");
    }

    pub(super) fn add_lead(&self, id: &str, record: LeadRecord, owner: Option<&str>) {
        self.backend
            .leads
            .insert_lead(&org(), &LeadId::from(id), record, owner.map(UserId::from))
            .expect("lead stored");
    }

    pub(super) async fn assign(&self, lead: &str) -> Result<AssignmentDecision, EngineError> {
        self.engine
            .assign_lead(
                &CancellationToken::new(),
                &org(),
                "leads",
                &LeadId::from(lead),
                BTreeMap::new(),
            )
            .await
    }

    pub(super) fn owner(&self, lead: &str) -> Option<UserId> {
        self.backend
            .leads
            .get_owner(&org(), &LeadId::from(lead))
            .expect("lead exists")
    }

    pub(super) fn count(&self, rule: &str, user: &str) -> u32 {
        self.backend.counters.count(&CounterKey {
            organization_id: org(),
            rule_id: RuleId::from(rule),
            user_id: UserId::from(user),
        })
    }

    pub(super) fn log(&self) -> Vec<AssignmentLogEntry> {
        self.backend.log.all()
    }

    pub(super) fn log_reasons(&self) -> Vec<AssignmentReason> {
        self.log().into_iter().map(|entry| entry.reason).collect()
    }
}

pub(super) fn assigned_to(decision: &AssignmentDecision) -> Option<&str> {
    decision.assigned_to_id.as_ref().map(|id| id.0.as_str())
}

/// Rule repository that is always offline.
pub(super) struct UnavailableRules;

impl RuleRepository for UnavailableRules {
    fn list_active_rules(
        &self,
        _org: &OrganizationId,
        _target_model: &str,
    ) -> Result<Vec<AssignmentRule>, StoreError> {
        Err(StoreError::Unavailable("rules database offline".to_string()))
    }

    fn list_active_territories(
        &self,
        _org: &OrganizationId,
    ) -> Result<Vec<Territory>, StoreError> {
        Err(StoreError::Unavailable("rules database offline".to_string()))
    }
}

/// Assignment log that rejects every append.
pub(super) struct RejectingLog;

impl AssignmentLog for RejectingLog {
    fn append(&self, _entry: AssignmentLogEntry) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("log volume full".to_string()))
    }

    fn entries(&self, _org: &OrganizationId) -> Result<Vec<AssignmentLogEntry>, StoreError> {
        Ok(Vec::new())
    }
}

/// Counter store whose increments can be switched off.
pub(super) struct FlakyCounters<C> {
    pub(super) inner: C,
    pub(super) failing: AtomicBool,
}

impl<C: CounterStore> FlakyCounters<C> {
    pub(super) fn failing(inner: C) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(true),
        }
    }
}

impl<C: CounterStore> CounterStore for FlakyCounters<C> {
    fn load(&self, org: &OrganizationId, rule: &RuleId) -> Result<FairnessState, StoreError> {
        self.inner.load(org, rule)
    }

    fn increment(&self, key: &CounterKey, cursor: CursorMark) -> Result<u32, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Conflict("counter row locked".to_string()));
        }
        self.inner.increment(key, cursor)
    }

    fn decrement(&self, key: &CounterKey, cursor: CursorMark) -> Result<u32, StoreError> {
        self.inner.decrement(key, cursor)
    }
}

/// Lead store that blocks the calling thread on owner reads and writes.
pub(super) struct SlowLeads {
    pub(super) inner: Arc<dyn LeadStore>,
    pub(super) read_delay: Duration,
    pub(super) write_delay: Duration,
}

impl SlowLeads {
    pub(super) fn writes(inner: Arc<dyn LeadStore>, delay: Duration) -> Self {
        Self {
            inner,
            read_delay: Duration::ZERO,
            write_delay: delay,
        }
    }

    pub(super) fn reads(inner: Arc<dyn LeadStore>, delay: Duration) -> Self {
        Self {
            inner,
            read_delay: delay,
            write_delay: Duration::ZERO,
        }
    }
}

impl LeadStore for SlowLeads {
    fn record(&self, org: &OrganizationId, lead: &LeadId) -> Result<LeadRecord, StoreError> {
        self.inner.record(org, lead)
    }

    fn get_owner(
        &self,
        org: &OrganizationId,
        lead: &LeadId,
    ) -> Result<Option<UserId>, StoreError> {
        std::thread::sleep(self.read_delay);
        self.inner.get_owner(org, lead)
    }

    fn set_owner(
        &self,
        org: &OrganizationId,
        lead: &LeadId,
        owner: Option<&UserId>,
    ) -> Result<(), StoreError> {
        std::thread::sleep(self.write_delay);
        self.inner.set_owner(org, lead, owner)
    }
}

/// Event sink that is always down.
pub(super) struct DownSink;

impl EventSink for DownSink {
    fn publish(&self, _event: AssignmentEvent) -> Result<(), SinkError> {
        Err(SinkError::Transport("broker unreachable".to_string()))
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
