use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{OrganizationId, RuleId, UserId};
use super::repository::{AssignmentLog, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAssignmentStats {
    pub user_id: UserId,
    pub assigned_count: u64,
    pub last_assigned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEffectiveness {
    pub rule_id: RuleId,
    pub total_matches: u64,
    pub total_assignments: u64,
    /// Share of the organization's logged decisions that this rule matched.
    pub match_rate: f64,
}

/// Read-only projections over the assignment log.
pub struct StatsReporter {
    log: Arc<dyn AssignmentLog>,
}

impl StatsReporter {
    pub fn new(log: Arc<dyn AssignmentLog>) -> Self {
        Self { log }
    }

    /// Committed assignments per user, busiest first.
    pub fn stats_by_user(
        &self,
        org: &OrganizationId,
        target_model: &str,
    ) -> Result<Vec<UserAssignmentStats>, StoreError> {
        let mut by_user: BTreeMap<UserId, UserAssignmentStats> = BTreeMap::new();

        for entry in self.log.entries(org)? {
            if entry.target_model != target_model || !entry.reason.is_assignment() {
                continue;
            }
            let Some(user_id) = entry.user_id else {
                continue;
            };

            let stats = by_user
                .entry(user_id.clone())
                .or_insert_with(|| UserAssignmentStats {
                    user_id,
                    assigned_count: 0,
                    last_assigned_at: None,
                });
            stats.assigned_count += 1;
            stats.last_assigned_at = stats.last_assigned_at.max(Some(entry.timestamp));
        }

        let mut stats: Vec<UserAssignmentStats> = by_user.into_values().collect();
        stats.sort_by(|left, right| {
            right
                .assigned_count
                .cmp(&left.assigned_count)
                .then_with(|| left.user_id.cmp(&right.user_id))
        });
        Ok(stats)
    }

    pub fn rule_effectiveness(
        &self,
        org: &OrganizationId,
    ) -> Result<Vec<RuleEffectiveness>, StoreError> {
        let entries = self.log.entries(org)?;
        let total_decisions = entries.len() as u64;
        let mut by_rule: BTreeMap<RuleId, (u64, u64)> = BTreeMap::new();

        for entry in &entries {
            let Some(rule_id) = &entry.rule_id else {
                continue;
            };
            let (matches, assignments) = by_rule.entry(rule_id.clone()).or_insert((0, 0));
            *matches += 1;
            if entry.reason.is_assignment() {
                *assignments += 1;
            }
        }

        Ok(by_rule
            .into_iter()
            .map(|(rule_id, (total_matches, total_assignments))| RuleEffectiveness {
                rule_id,
                total_matches,
                total_assignments,
                match_rate: if total_decisions == 0 {
                    0.0
                } else {
                    total_matches as f64 / total_decisions as f64
                },
            })
            .collect())
    }
}
