use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::candidates::CandidatePool;
use super::catalog::RuleCatalog;
use super::conditions::matches;
use super::domain::{
    AssignmentDecision, AssignmentReason, LeadId, LeadRecord, OrganizationId, RuleType, UserId,
};
use super::engine::EngineError;
use super::fairness::{FairnessKey, FairnessTracker};
use super::repository::TeamDirectory;

/// Fairness inputs the executor needs to claim the chosen slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSelection {
    pub key: FairnessKey,
    pub strategy: RuleType,
    pub cap: u32,
    pub pool: Vec<UserId>,
    pub user_id: UserId,
}

/// Decision plus everything needed to commit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentProposal {
    pub organization_id: OrganizationId,
    pub target_model: String,
    pub decision: AssignmentDecision,
    /// Present only when the decision changes ownership.
    pub selection: Option<CandidateSelection>,
}

/// First-match-wins selection over the priority-ordered catalog. Never mutates state.
pub struct AssignmentSelector {
    catalog: Arc<RuleCatalog>,
    candidates: CandidatePool,
    fairness: Arc<FairnessTracker>,
    directory: Arc<dyn TeamDirectory>,
}

impl AssignmentSelector {
    pub fn new(
        catalog: Arc<RuleCatalog>,
        fairness: Arc<FairnessTracker>,
        directory: Arc<dyn TeamDirectory>,
    ) -> Self {
        Self {
            catalog,
            candidates: CandidatePool::new(directory.clone()),
            fairness,
            directory,
        }
    }

    pub fn assign(
        &self,
        org: &OrganizationId,
        target_model: &str,
        lead_id: &LeadId,
        record: &LeadRecord,
        current_owner: Option<&UserId>,
        now: DateTime<Utc>,
    ) -> Result<AssignmentProposal, EngineError> {
        let units = self
            .catalog
            .active_rules_for(org, target_model, now)
            .map_err(EngineError::collaborator("rule repository"))?;

        for unit in &units {
            if !matches(unit.conditions(), record) {
                debug!(lead = %lead_id, rule = %unit.id(), "conditions did not match");
                continue;
            }

            let pool = self
                .candidates
                .resolve(unit)
                .map_err(EngineError::collaborator("team directory"))?;
            if pool.is_empty() {
                debug!(lead = %lead_id, rule = %unit.id(), "rule resolved no candidates");
                continue;
            }

            let key = FairnessKey::new(org, unit.id());
            let strategy = unit.strategy();
            let cap = unit.max_assignments_per_user();
            let Some(user_id) = self
                .fairness
                .next_candidate(&key, strategy, cap, &pool)
                .map_err(EngineError::collaborator("counter store"))?
            else {
                debug!(lead = %lead_id, rule = %unit.id(), "every candidate is at capacity");
                continue;
            };

            let assigned_to_name = self
                .directory
                .display_name(org, &user_id)
                .map_err(EngineError::collaborator("team directory"))?;

            let (reason, changed) = match current_owner {
                Some(owner) if owner == &user_id => (AssignmentReason::AlreadyAssigned, false),
                Some(_) => (AssignmentReason::Reassignment, true),
                None => (AssignmentReason::AutoAssignment, true),
            };

            debug!(
                lead = %lead_id,
                rule = %unit.id(),
                user = %user_id,
                reason = reason.label(),
                "rule selected candidate"
            );

            let decision = AssignmentDecision {
                lead_id: lead_id.clone(),
                assigned_to_id: Some(user_id.clone()),
                assigned_to_name,
                reason,
                changed,
                matched_rule_id: Some(unit.id().clone()),
                previous_owner_id: current_owner.cloned(),
            };
            let selection = changed.then(|| CandidateSelection {
                key,
                strategy,
                cap,
                pool,
                user_id,
            });

            return Ok(AssignmentProposal {
                organization_id: org.clone(),
                target_model: target_model.to_string(),
                decision,
                selection,
            });
        }

        Ok(AssignmentProposal {
            organization_id: org.clone(),
            target_model: target_model.to_string(),
            decision: AssignmentDecision::no_match(lead_id.clone(), current_owner.cloned()),
            selection: None,
        })
    }
}
