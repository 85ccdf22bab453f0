use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RoutingConfig;

use super::catalog::RuleCatalog;
use super::clock::Clock;
use super::domain::{
    AssignmentDecision, AssignmentLogEntry, LeadId, LeadRecord, OrganizationId, RuleId,
};
use super::executor::{AssignmentExecutor, CommitOutcome};
use super::fairness::{FairnessKey, FairnessState, FairnessTracker};
use super::repository::{
    AssignmentEvent, AssignmentEventKind, AssignmentLog, CounterStore, EventSink, LeadStore,
    RuleRepository, StoreError, TeamDirectory,
};
use super::selector::{AssignmentProposal, AssignmentSelector};
use super::stats::{RuleEffectiveness, StatsReporter, UserAssignmentStats};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{collaborator} failed: {source}")]
    Collaborator {
        collaborator: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("timed out after {0:?} waiting for the lead lock")]
    LockTimeout(Duration),
    #[error("assignment was cancelled")]
    Cancelled,
    #[error("gave up after {attempts} stale commit attempts")]
    Contention { attempts: u32 },
}

impl EngineError {
    pub(crate) fn collaborator(name: &'static str) -> impl FnOnce(StoreError) -> EngineError {
        move |source| EngineError::Collaborator {
            collaborator: name,
            source,
        }
    }

    /// Whether the same call may succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Collaborator { source, .. } => !matches!(source, StoreError::NotFound),
            EngineError::LockTimeout(_) | EngineError::Contention { .. } => true,
            EngineError::Cancelled => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::Collaborator {
                source: StoreError::NotFound,
                ..
            }
        )
    }
}

pub(crate) fn ensure_active(cancel: &CancellationToken) -> Result<(), EngineError> {
    if cancel.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

/// Storage and notification seams the engine is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub leads: Arc<dyn LeadStore>,
    pub teams: Arc<dyn TeamDirectory>,
    pub rules: Arc<dyn RuleRepository>,
    pub counters: Arc<dyn CounterStore>,
    pub log: Arc<dyn AssignmentLog>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
}

type LockKey = (OrganizationId, LeadId);

/// One async mutex per lead, created on demand and dropped once nobody holds it.
#[derive(Default)]
struct LeadLocks {
    locks: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl LeadLocks {
    async fn acquire(
        &self,
        cancel: &CancellationToken,
        org: &OrganizationId,
        lead: &LeadId,
        timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>, EngineError> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry((org.clone(), lead.clone()))
                .or_default()
                .clone()
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            acquired = tokio::time::timeout(timeout, lock.lock_owned()) => {
                acquired.map_err(|_| EngineError::LockTimeout(timeout))
            }
        }
    }
}

/// Entry point for routing leads and reading assignment statistics.
///
/// Selection runs without holding the lead lock; only the commit is serialized per
/// lead. A trigger that loses a race therefore reports the winner as
/// `already_assigned` instead of overwriting it.
pub struct AssignmentEngine {
    config: RoutingConfig,
    leads: Arc<dyn LeadStore>,
    log: Arc<dyn AssignmentLog>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    catalog: Arc<RuleCatalog>,
    fairness: Arc<FairnessTracker>,
    selector: AssignmentSelector,
    executor: AssignmentExecutor,
    stats: StatsReporter,
    locks: LeadLocks,
}

impl AssignmentEngine {
    pub fn new(config: RoutingConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            leads,
            teams,
            rules,
            counters,
            log,
            events,
            clock,
        } = collaborators;

        let catalog = Arc::new(RuleCatalog::new(rules, config.catalog_ttl));
        let fairness = Arc::new(FairnessTracker::new(counters));
        let selector = AssignmentSelector::new(catalog.clone(), fairness.clone(), teams.clone());
        let executor = AssignmentExecutor::new(
            leads.clone(),
            teams,
            fairness.clone(),
            log.clone(),
            clock.clone(),
        );

        Self {
            stats: StatsReporter::new(log.clone()),
            config,
            leads,
            log,
            events,
            clock,
            catalog,
            fairness,
            selector,
            executor,
            locks: LeadLocks::default(),
        }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Routes one lead and commits the outcome.
    ///
    /// `overrides` are layered over the stored record before evaluation, letting
    /// callers route on attributes that are not persisted yet.
    pub async fn assign_lead(
        &self,
        cancel: &CancellationToken,
        org: &OrganizationId,
        target_model: &str,
        lead_id: &LeadId,
        overrides: BTreeMap<String, Value>,
    ) -> Result<AssignmentDecision, EngineError> {
        let result = self
            .route(cancel, org, target_model, lead_id, overrides)
            .await;

        match &result {
            Ok(decision) if decision.changed => self.notify_assigned(org, decision),
            Ok(_) => {}
            Err(err) => self.notify_failed(org, lead_id, err),
        }
        result
    }

    /// Decision the engine would make right now, without writing anything.
    pub fn preview(
        &self,
        org: &OrganizationId,
        target_model: &str,
        lead_id: &LeadId,
        overrides: BTreeMap<String, Value>,
    ) -> Result<AssignmentDecision, EngineError> {
        let record = self.record(org, lead_id, overrides)?;
        Ok(self.propose(org, target_model, lead_id, &record)?.decision)
    }

    pub fn stats_by_user(
        &self,
        org: &OrganizationId,
        target_model: &str,
    ) -> Result<Vec<UserAssignmentStats>, EngineError> {
        self.stats
            .stats_by_user(org, target_model)
            .map_err(EngineError::collaborator("assignment log"))
    }

    pub fn rule_effectiveness(
        &self,
        org: &OrganizationId,
    ) -> Result<Vec<RuleEffectiveness>, EngineError> {
        self.stats
            .rule_effectiveness(org)
            .map_err(EngineError::collaborator("assignment log"))
    }

    /// Forces the next routing call for `org` to reload rules and territories.
    pub fn invalidate_rules(&self, org: &OrganizationId) {
        self.catalog.invalidate(org);
    }

    pub fn fairness_snapshot(&self, org: &OrganizationId, rule: &RuleId) -> Option<FairnessState> {
        self.fairness.snapshot(&FairnessKey::new(org, rule))
    }

    async fn route(
        &self,
        cancel: &CancellationToken,
        org: &OrganizationId,
        target_model: &str,
        lead_id: &LeadId,
        overrides: BTreeMap<String, Value>,
    ) -> Result<AssignmentDecision, EngineError> {
        ensure_active(cancel)?;
        let record = self.record(org, lead_id, overrides)?;
        let attempts = self.config.commit_attempts.max(1);

        for attempt in 1..=attempts {
            ensure_active(cancel)?;
            let proposal = self.propose(org, target_model, lead_id, &record)?;
            if !proposal.decision.changed {
                self.log_unchanged(&proposal, &proposal.decision);
                return Ok(proposal.decision);
            }

            let _guard = self
                .locks
                .acquire(cancel, org, lead_id, self.config.lock_timeout)
                .await?;

            match self.executor.commit(cancel, &proposal)? {
                CommitOutcome::Committed(decision) => return Ok(decision),
                CommitOutcome::Unchanged(decision) => {
                    self.log_unchanged(&proposal, &decision);
                    return Ok(decision);
                }
                CommitOutcome::Stale => {
                    debug!(lead = %lead_id, attempt, "matched rule filled up; re-selecting");
                }
            }
        }

        warn!(organization = %org, lead = %lead_id, attempts, "every commit attempt was stale");
        Err(EngineError::Contention { attempts })
    }

    fn record(
        &self,
        org: &OrganizationId,
        lead_id: &LeadId,
        overrides: BTreeMap<String, Value>,
    ) -> Result<LeadRecord, EngineError> {
        let mut record = self
            .leads
            .record(org, lead_id)
            .map_err(EngineError::collaborator("lead store"))?;
        record.overlay(overrides);
        Ok(record)
    }

    fn propose(
        &self,
        org: &OrganizationId,
        target_model: &str,
        lead_id: &LeadId,
        record: &LeadRecord,
    ) -> Result<AssignmentProposal, EngineError> {
        let owner = self
            .leads
            .get_owner(org, lead_id)
            .map_err(EngineError::collaborator("lead store"))?;
        self.selector.assign(
            org,
            target_model,
            lead_id,
            record,
            owner.as_ref(),
            self.clock.now(),
        )
    }

    /// `already_assigned` and `no_match` outcomes are logged for the stats
    /// projections; a log failure here does not fail the call.
    fn log_unchanged(&self, proposal: &AssignmentProposal, decision: &AssignmentDecision) {
        let entry = AssignmentLogEntry {
            timestamp: self.clock.now(),
            organization_id: proposal.organization_id.clone(),
            target_model: proposal.target_model.clone(),
            lead_id: decision.lead_id.clone(),
            rule_id: decision.matched_rule_id.clone(),
            user_id: decision.assigned_to_id.clone(),
            reason: decision.reason,
        };

        debug!(
            lead = %decision.lead_id,
            reason = decision.reason.label(),
            "lead ownership unchanged"
        );
        if let Err(err) = self.log.append(entry) {
            warn!(lead = %decision.lead_id, error = %err, "failed to log unchanged decision");
        }
    }

    fn notify_assigned(&self, org: &OrganizationId, decision: &AssignmentDecision) {
        let mut details = BTreeMap::new();
        details.insert("reason".to_string(), decision.reason.label().to_string());
        if let Some(previous) = &decision.previous_owner_id {
            details.insert("previous_owner_id".to_string(), previous.to_string());
        }
        if let Some(name) = &decision.assigned_to_name {
            details.insert("assigned_to_name".to_string(), name.clone());
        }

        self.publish(AssignmentEvent {
            kind: AssignmentEventKind::LeadAssigned,
            organization_id: org.clone(),
            lead_id: decision.lead_id.clone(),
            user_id: decision.assigned_to_id.clone(),
            rule_id: decision.matched_rule_id.clone(),
            details,
            timestamp: self.clock.now(),
        });
    }

    fn notify_failed(&self, org: &OrganizationId, lead_id: &LeadId, err: &EngineError) {
        let mut details = BTreeMap::new();
        details.insert("error".to_string(), err.to_string());
        details.insert("retryable".to_string(), err.is_retryable().to_string());

        self.publish(AssignmentEvent {
            kind: AssignmentEventKind::ReassignmentFailed,
            organization_id: org.clone(),
            lead_id: lead_id.clone(),
            user_id: None,
            rule_id: None,
            details,
            timestamp: self.clock.now(),
        });
    }

    fn publish(&self, event: AssignmentEvent) {
        let kind = event.kind.name();
        let lead = event.lead_id.clone();
        match self.events.publish(event) {
            Ok(()) => info!(event = kind, lead = %lead, "assignment event published"),
            Err(err) => {
                warn!(event = kind, lead = %lead, error = %err, "event sink rejected event")
            }
        }
    }
}
