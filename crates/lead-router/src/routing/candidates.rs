use std::collections::HashSet;
use std::sync::Arc;

use super::domain::{AssignToType, OrganizationId, RoutingUnit, TeamId, UserId};
use super::repository::{StoreError, TeamDirectory};

/// Expands a matched routing unit into a concrete, ordered list of user ids.
pub struct CandidatePool {
    directory: Arc<dyn TeamDirectory>,
}

/// Ordered set keeping the first occurrence of each user.
#[derive(Default)]
struct OrderedPool {
    seen: HashSet<UserId>,
    users: Vec<UserId>,
}

impl OrderedPool {
    fn push(&mut self, user: UserId) {
        if self.seen.insert(user.clone()) {
            self.users.push(user);
        }
    }

    fn extend(&mut self, users: impl IntoIterator<Item = UserId>) {
        for user in users {
            self.push(user);
        }
    }
}

impl CandidatePool {
    pub fn new(directory: Arc<dyn TeamDirectory>) -> Self {
        Self { directory }
    }

    /// An empty result is a valid "no candidates" answer, not an error.
    pub fn resolve(&self, unit: &RoutingUnit) -> Result<Vec<UserId>, StoreError> {
        let org = unit.organization_id();
        let mut pool = OrderedPool::default();

        match unit {
            RoutingUnit::Rule(rule) => match rule.assign_to_type {
                AssignToType::User => {
                    pool.extend(rule.candidate_ids.iter().map(|id| UserId(id.clone())));
                }
                AssignToType::Team => {
                    for team in &rule.candidate_ids {
                        pool.extend(self.members(org, &TeamId(team.clone()))?);
                    }
                }
            },
            RoutingUnit::Territory(territory) => {
                pool.extend(territory.assigned_users.iter().cloned());
                for team in &territory.assigned_teams {
                    pool.extend(self.members(org, team)?);
                }
            }
        }

        Ok(pool.users)
    }

    fn members(&self, org: &OrganizationId, team: &TeamId) -> Result<Vec<UserId>, StoreError> {
        self.directory.members_of(org, team)
    }
}
