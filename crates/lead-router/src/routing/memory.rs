//! In-memory collaborators used by the service binary, simulations, and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

use super::clock::Clock;
use super::domain::{
    AssignmentLogEntry, AssignmentRule, LeadId, LeadRecord, OrganizationId, RuleId, TeamId,
    Territory, UserId,
};
use super::engine::Collaborators;
use super::fairness::{CursorMark, FairnessState};
use super::repository::{
    AssignmentEvent, AssignmentLog, CounterKey, CounterStore, EventSink, LeadStore,
    RuleRepository, SinkError, StoreError, TeamDirectory,
};

fn guard<'a, T>(mutex: &'a Mutex<T>, name: &str) -> Result<MutexGuard<'a, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Unavailable(format!("{name} mutex poisoned")))
}

#[derive(Debug, Clone)]
struct StoredLead {
    record: LeadRecord,
    owner: Option<UserId>,
}

#[derive(Default, Clone)]
pub struct InMemoryLeadStore {
    leads: Arc<Mutex<HashMap<(OrganizationId, LeadId), StoredLead>>>,
}

impl InMemoryLeadStore {
    pub fn insert_lead(
        &self,
        org: &OrganizationId,
        lead: &LeadId,
        record: LeadRecord,
        owner: Option<UserId>,
    ) -> Result<(), StoreError> {
        guard(&self.leads, "lead store")?
            .insert((org.clone(), lead.clone()), StoredLead { record, owner });
        Ok(())
    }
}

impl LeadStore for InMemoryLeadStore {
    fn record(&self, org: &OrganizationId, lead: &LeadId) -> Result<LeadRecord, StoreError> {
        guard(&self.leads, "lead store")?
            .get(&(org.clone(), lead.clone()))
            .map(|stored| stored.record.clone())
            .ok_or(StoreError::NotFound)
    }

    fn get_owner(
        &self,
        org: &OrganizationId,
        lead: &LeadId,
    ) -> Result<Option<UserId>, StoreError> {
        guard(&self.leads, "lead store")?
            .get(&(org.clone(), lead.clone()))
            .map(|stored| stored.owner.clone())
            .ok_or(StoreError::NotFound)
    }

    fn set_owner(
        &self,
        org: &OrganizationId,
        lead: &LeadId,
        owner: Option<&UserId>,
    ) -> Result<(), StoreError> {
        let mut leads = guard(&self.leads, "lead store")?;
        let stored = leads
            .get_mut(&(org.clone(), lead.clone()))
            .ok_or(StoreError::NotFound)?;
        stored.owner = owner.cloned();
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryTeamDirectory {
    teams: Arc<Mutex<HashMap<(OrganizationId, TeamId), Vec<UserId>>>>,
    names: Arc<Mutex<HashMap<(OrganizationId, UserId), String>>>,
}

impl InMemoryTeamDirectory {
    /// Replaces the team's membership; the given order is the join order.
    pub fn set_members(
        &self,
        org: &OrganizationId,
        team: &TeamId,
        members: Vec<UserId>,
    ) -> Result<(), StoreError> {
        guard(&self.teams, "team directory")?.insert((org.clone(), team.clone()), members);
        Ok(())
    }

    pub fn set_display_name(
        &self,
        org: &OrganizationId,
        user: &UserId,
        name: impl Into<String>,
    ) -> Result<(), StoreError> {
        guard(&self.names, "team directory")?.insert((org.clone(), user.clone()), name.into());
        Ok(())
    }
}

impl TeamDirectory for InMemoryTeamDirectory {
    fn members_of(&self, org: &OrganizationId, team: &TeamId) -> Result<Vec<UserId>, StoreError> {
        Ok(guard(&self.teams, "team directory")?
            .get(&(org.clone(), team.clone()))
            .cloned()
            .unwrap_or_default())
    }

    fn display_name(
        &self,
        org: &OrganizationId,
        user: &UserId,
    ) -> Result<Option<String>, StoreError> {
        Ok(guard(&self.names, "team directory")?
            .get(&(org.clone(), user.clone()))
            .cloned())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryRuleRepository {
    rules: Arc<Mutex<Vec<AssignmentRule>>>,
    territories: Arc<Mutex<Vec<Territory>>>,
    loads: Arc<AtomicUsize>,
}

impl InMemoryRuleRepository {
    /// Inserts or replaces a rule by id.
    pub fn upsert_rule(&self, rule: AssignmentRule) -> Result<(), StoreError> {
        let mut rules = guard(&self.rules, "rule repository")?;
        rules.retain(|existing| existing.id != rule.id);
        rules.push(rule);
        Ok(())
    }

    pub fn upsert_territory(&self, territory: Territory) -> Result<(), StoreError> {
        let mut territories = guard(&self.territories, "rule repository")?;
        territories.retain(|existing| existing.id != territory.id);
        territories.push(territory);
        Ok(())
    }

    /// Number of `list_active_rules` calls served, for cache assertions.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

impl RuleRepository for InMemoryRuleRepository {
    fn list_active_rules(
        &self,
        org: &OrganizationId,
        target_model: &str,
    ) -> Result<Vec<AssignmentRule>, StoreError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(guard(&self.rules, "rule repository")?
            .iter()
            .filter(|rule| {
                rule.is_active && &rule.organization_id == org && rule.target_model == target_model
            })
            .cloned()
            .collect())
    }

    fn list_active_territories(&self, org: &OrganizationId) -> Result<Vec<Territory>, StoreError> {
        Ok(guard(&self.territories, "rule repository")?
            .iter()
            .filter(|territory| territory.is_active && &territory.organization_id == org)
            .cloned()
            .collect())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryCounterStore {
    states: Arc<Mutex<HashMap<(OrganizationId, RuleId), FairnessState>>>,
}

impl InMemoryCounterStore {
    pub fn count(&self, key: &CounterKey) -> u32 {
        self.states
            .lock()
            .ok()
            .and_then(|states| {
                states
                    .get(&(key.organization_id.clone(), key.rule_id.clone()))
                    .map(|state| state.count_for(&key.user_id))
            })
            .unwrap_or(0)
    }
}

impl CounterStore for InMemoryCounterStore {
    fn load(&self, org: &OrganizationId, rule: &RuleId) -> Result<FairnessState, StoreError> {
        Ok(guard(&self.states, "counter store")?
            .get(&(org.clone(), rule.clone()))
            .cloned()
            .unwrap_or_default())
    }

    fn increment(&self, key: &CounterKey, cursor: CursorMark) -> Result<u32, StoreError> {
        let mut states = guard(&self.states, "counter store")?;
        let state = states
            .entry((key.organization_id.clone(), key.rule_id.clone()))
            .or_default();
        let count = state
            .assignment_count
            .entry(key.user_id.clone())
            .or_insert(0);
        *count += 1;
        let count = *count;
        state.advance_cursor(cursor);
        Ok(count)
    }

    fn decrement(&self, key: &CounterKey, cursor: CursorMark) -> Result<u32, StoreError> {
        let mut states = guard(&self.states, "counter store")?;
        let state = states
            .get_mut(&(key.organization_id.clone(), key.rule_id.clone()))
            .ok_or(StoreError::NotFound)?;
        let count = state
            .assignment_count
            .get_mut(&key.user_id)
            .ok_or(StoreError::NotFound)?;
        *count = count.saturating_sub(1);
        let count = *count;
        state.rewind_cursor(cursor);
        Ok(count)
    }
}

#[derive(Default, Clone)]
pub struct InMemoryAssignmentLog {
    entries: Arc<Mutex<Vec<AssignmentLogEntry>>>,
}

impl InMemoryAssignmentLog {
    pub fn all(&self) -> Vec<AssignmentLogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

impl AssignmentLog for InMemoryAssignmentLog {
    fn append(&self, entry: AssignmentLogEntry) -> Result<(), StoreError> {
        guard(&self.entries, "assignment log")?.push(entry);
        Ok(())
    }

    fn entries(&self, org: &OrganizationId) -> Result<Vec<AssignmentLogEntry>, StoreError> {
        Ok(guard(&self.entries, "assignment log")?
            .iter()
            .filter(|entry| &entry.organization_id == org)
            .cloned()
            .collect())
    }
}

/// Event sink that keeps every published event, for inspection.
#[derive(Default, Clone)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<AssignmentEvent>>>,
}

impl MemoryEventSink {
    pub fn events(&self) -> Vec<AssignmentEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for MemoryEventSink {
    fn publish(&self, event: AssignmentEvent) -> Result<(), SinkError> {
        self.events
            .lock()
            .map_err(|_| SinkError::Transport("event mutex poisoned".to_string()))?
            .push(event);
        Ok(())
    }
}

/// Fan-out sink over a `tokio::sync::broadcast` channel. Sending never blocks;
/// events published while nobody is subscribed are dropped.
#[derive(Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<AssignmentEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AssignmentEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: AssignmentEvent) -> Result<(), SinkError> {
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Convenience bundle of every in-memory collaborator.
#[derive(Default, Clone)]
pub struct InMemoryBackend {
    pub leads: InMemoryLeadStore,
    pub teams: InMemoryTeamDirectory,
    pub rules: InMemoryRuleRepository,
    pub counters: InMemoryCounterStore,
    pub log: InMemoryAssignmentLog,
    pub events: MemoryEventSink,
}

impl InMemoryBackend {
    /// Engine collaborators backed by this store. `events` replaces the built-in
    /// recording sink when given.
    pub fn collaborators(
        &self,
        clock: Arc<dyn Clock>,
        events: Option<Arc<dyn EventSink>>,
    ) -> Collaborators {
        Collaborators {
            leads: Arc::new(self.leads.clone()),
            teams: Arc::new(self.teams.clone()),
            rules: Arc::new(self.rules.clone()),
            counters: Arc::new(self.counters.clone()),
            log: Arc::new(self.log.clone()),
            events: events.unwrap_or_else(|| Arc::new(self.events.clone()) as Arc<dyn EventSink>),
            clock,
        }
    }

    /// Owners of every stored lead in an organization.
    pub fn owners(&self, org: &OrganizationId) -> BTreeMap<LeadId, Option<UserId>> {
        self.leads
            .leads
            .lock()
            .map(|leads| {
                leads
                    .iter()
                    .filter(|((lead_org, _), _)| lead_org == org)
                    .map(|((_, lead), stored)| (lead.clone(), stored.owner.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}
