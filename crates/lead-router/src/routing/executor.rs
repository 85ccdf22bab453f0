use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::clock::Clock;
use super::domain::{
    AssignmentDecision, AssignmentLogEntry, AssignmentReason, LeadId, OrganizationId, UserId,
};
use super::engine::{ensure_active, EngineError};
use super::fairness::{FairnessTracker, Reservation};
use super::repository::{AssignmentLog, LeadStore, TeamDirectory};
use super::selector::AssignmentProposal;

/// Result of applying a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Ownership moved; owner, counter, and log entry are all written.
    Committed(AssignmentDecision),
    /// Nothing was written.
    Unchanged(AssignmentDecision),
    /// Every candidate of the matched rule is at capacity now; the proposal must be
    /// re-selected.
    Stale,
}

/// Applies proposals all-or-nothing: owner write, durable counter, log entry.
///
/// Callers serialize commits per lead (see `AssignmentEngine`); the owner re-check
/// below turns a commit that lost a race into an `already_assigned` no-op.
pub struct AssignmentExecutor {
    leads: Arc<dyn LeadStore>,
    directory: Arc<dyn TeamDirectory>,
    fairness: Arc<FairnessTracker>,
    log: Arc<dyn AssignmentLog>,
    clock: Arc<dyn Clock>,
}

impl AssignmentExecutor {
    pub fn new(
        leads: Arc<dyn LeadStore>,
        directory: Arc<dyn TeamDirectory>,
        fairness: Arc<FairnessTracker>,
        log: Arc<dyn AssignmentLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            leads,
            directory,
            fairness,
            log,
            clock,
        }
    }

    pub fn commit(
        &self,
        cancel: &CancellationToken,
        proposal: &AssignmentProposal,
    ) -> Result<CommitOutcome, EngineError> {
        let decision = &proposal.decision;
        let selection = match &proposal.selection {
            Some(selection) if decision.changed => selection,
            _ => return Ok(CommitOutcome::Unchanged(decision.clone())),
        };

        ensure_active(cancel)?;
        let org = &proposal.organization_id;
        let current = self
            .leads
            .get_owner(org, &decision.lead_id)
            .map_err(EngineError::collaborator("lead store"))?;

        if current != decision.previous_owner_id {
            return Ok(match current {
                Some(owner) => {
                    info!(
                        lead = %decision.lead_id,
                        owner = %owner,
                        "lead was assigned concurrently; keeping current owner"
                    );
                    CommitOutcome::Unchanged(decision.owned_concurrently(owner))
                }
                None => CommitOutcome::Stale,
            });
        }

        let Some(reservation) = self
            .fairness
            .reserve(
                &selection.key,
                selection.strategy,
                selection.cap,
                &selection.pool,
            )
            .map_err(EngineError::collaborator("counter store"))?
        else {
            return Ok(CommitOutcome::Stale);
        };

        if current.as_ref() == Some(&reservation.user_id) {
            self.fairness.release(&reservation);
            return Ok(CommitOutcome::Unchanged(
                self.claimed_decision(decision, &reservation)?,
            ));
        }

        let result = self
            .claimed_decision(decision, &reservation)
            .and_then(|claimed| {
                self.apply(cancel, proposal, &claimed, &reservation)?;
                Ok(claimed)
            });
        match result {
            Ok(claimed) => {
                info!(
                    organization = %org,
                    lead = %claimed.lead_id,
                    user = %reservation.user_id,
                    rule = %reservation.key.rule_id,
                    reason = claimed.reason.label(),
                    "lead assignment committed"
                );
                Ok(CommitOutcome::Committed(claimed))
            }
            Err(err) => {
                self.fairness.release(&reservation);
                Err(err)
            }
        }
    }

    /// The proposal's decision, re-targeted at the user the reservation claimed.
    fn claimed_decision(
        &self,
        proposed: &AssignmentDecision,
        reservation: &Reservation,
    ) -> Result<AssignmentDecision, EngineError> {
        let user = &reservation.user_id;
        if proposed.assigned_to_id.as_ref() == Some(user) {
            return Ok(proposed.clone());
        }

        let assigned_to_name = self
            .directory
            .display_name(&reservation.key.organization_id, user)
            .map_err(EngineError::collaborator("team directory"))?;
        let (reason, changed) = match &proposed.previous_owner_id {
            Some(owner) if owner == user => (AssignmentReason::AlreadyAssigned, false),
            Some(_) => (AssignmentReason::Reassignment, true),
            None => (AssignmentReason::AutoAssignment, true),
        };

        Ok(AssignmentDecision {
            assigned_to_id: Some(user.clone()),
            assigned_to_name,
            reason,
            changed,
            ..proposed.clone()
        })
    }

    fn apply(
        &self,
        cancel: &CancellationToken,
        proposal: &AssignmentProposal,
        decision: &AssignmentDecision,
        reservation: &Reservation,
    ) -> Result<(), EngineError> {
        let org = &proposal.organization_id;
        let previous = decision.previous_owner_id.as_ref();

        ensure_active(cancel)?;
        self.leads
            .set_owner(org, &decision.lead_id, Some(&reservation.user_id))
            .map_err(EngineError::collaborator("lead store"))?;

        let persisted = ensure_active(cancel).and_then(|_| {
            self.fairness
                .persist(reservation)
                .map_err(EngineError::collaborator("counter store"))
        });
        if let Err(err) = persisted {
            self.restore_owner(org, &decision.lead_id, previous);
            return Err(err);
        }

        let entry = AssignmentLogEntry {
            timestamp: self.clock.now(),
            organization_id: org.clone(),
            target_model: proposal.target_model.clone(),
            lead_id: decision.lead_id.clone(),
            rule_id: Some(reservation.key.rule_id.clone()),
            user_id: Some(reservation.user_id.clone()),
            reason: decision.reason,
        };
        let logged = ensure_active(cancel).and_then(|_| {
            self.log
                .append(entry)
                .map_err(EngineError::collaborator("assignment log"))
        });
        if let Err(err) = logged {
            if let Err(undo) = self.fairness.unpersist(reservation) {
                error!(
                    lead = %decision.lead_id,
                    rule = %reservation.key.rule_id,
                    error = %undo,
                    "failed to roll back fairness counter"
                );
            }
            self.restore_owner(org, &decision.lead_id, previous);
            return Err(err);
        }

        Ok(())
    }

    fn restore_owner(&self, org: &OrganizationId, lead: &LeadId, previous: Option<&UserId>) {
        warn!(lead = %lead, "rolling back lead owner after failed commit");
        if let Err(err) = self.leads.set_owner(org, lead, previous) {
            error!(lead = %lead, error = %err, "failed to restore previous lead owner");
        }
    }
}
