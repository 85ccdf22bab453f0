use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::domain::{OrganizationId, RoutingUnit};
use super::repository::{RuleRepository, StoreError};

struct CachedUnits {
    loaded_at: Instant,
    units: Arc<Vec<RoutingUnit>>,
}

/// Priority-ordered view over an organization's rules and territories, cached for a
/// short TTL. A stale cache only delays a rule change taking effect.
pub struct RuleCatalog {
    repository: Arc<dyn RuleRepository>,
    ttl: Duration,
    cache: Mutex<HashMap<(OrganizationId, String), CachedUnits>>,
}

impl RuleCatalog {
    pub fn new(repository: Arc<dyn RuleRepository>, ttl: Duration) -> Self {
        Self {
            repository,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<(OrganizationId, String), CachedUnits>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Units eligible at `now`, sorted by priority, creation time, then id.
    pub fn active_rules_for(
        &self,
        org: &OrganizationId,
        target_model: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RoutingUnit>, StoreError> {
        let units = self.units(org, target_model)?;
        Ok(units
            .iter()
            .filter(|unit| unit.is_active() && unit.schedule().is_open_at(now))
            .cloned()
            .collect())
    }

    /// Drops every cached entry for the organization.
    pub fn invalidate(&self, org: &OrganizationId) {
        self.cache().retain(|(cached_org, _), _| cached_org != org);
    }

    fn units(
        &self,
        org: &OrganizationId,
        target_model: &str,
    ) -> Result<Arc<Vec<RoutingUnit>>, StoreError> {
        let key = (org.clone(), target_model.to_string());
        if let Some(cached) = self.cache().get(&key) {
            if cached.loaded_at.elapsed() < self.ttl {
                return Ok(cached.units.clone());
            }
        }

        let rules = self.repository.list_active_rules(org, target_model)?;
        let territories = self.repository.list_active_territories(org)?;

        let mut units: Vec<RoutingUnit> = rules
            .into_iter()
            .filter(|rule| &rule.organization_id == org && rule.target_model == target_model)
            .map(RoutingUnit::Rule)
            .chain(
                territories
                    .into_iter()
                    .filter(|territory| &territory.organization_id == org)
                    .map(RoutingUnit::Territory),
            )
            .collect();

        units.sort_by(|left, right| {
            left.priority()
                .cmp(&right.priority())
                .then_with(|| left.created_at().cmp(&right.created_at()))
                .then_with(|| left.id().cmp(right.id()))
        });

        for unit in &units {
            for predicate in unit.conditions().unsupported() {
                warn!(
                    organization = %org,
                    rule = %unit.id(),
                    rule_name = unit.name(),
                    field = %predicate.field,
                    "rule predicate is malformed and will never match"
                );
            }
        }

        debug!(organization = %org, target_model, units = units.len(), "rule catalog refreshed");

        let units = Arc::new(units);
        self.cache().insert(
            key,
            CachedUnits {
                loaded_at: Instant::now(),
                units: units.clone(),
            },
        );
        Ok(units)
    }
}
