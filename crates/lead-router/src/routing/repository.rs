use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{
    AssignmentLogEntry, AssignmentRule, LeadId, LeadRecord, OrganizationId, RuleId, TeamId,
    Territory, UserId,
};
use super::fairness::{CursorMark, FairnessState};

/// Org-scoped access to lead ownership, used by the executor.
pub trait LeadStore: Send + Sync {
    /// Routing attributes extracted from the lead.
    fn record(&self, org: &OrganizationId, lead: &LeadId) -> Result<LeadRecord, StoreError>;
    fn get_owner(&self, org: &OrganizationId, lead: &LeadId)
        -> Result<Option<UserId>, StoreError>;
    /// `None` clears ownership; only used when rolling back a failed commit.
    fn set_owner(
        &self,
        org: &OrganizationId,
        lead: &LeadId,
        owner: Option<&UserId>,
    ) -> Result<(), StoreError>;
}

/// Team membership lookups. Members come back in a stable order (join order).
pub trait TeamDirectory: Send + Sync {
    fn members_of(&self, org: &OrganizationId, team: &TeamId) -> Result<Vec<UserId>, StoreError>;
    fn display_name(&self, org: &OrganizationId, user: &UserId)
        -> Result<Option<String>, StoreError>;
}

pub trait RuleRepository: Send + Sync {
    fn list_active_rules(
        &self,
        org: &OrganizationId,
        target_model: &str,
    ) -> Result<Vec<AssignmentRule>, StoreError>;
    fn list_active_territories(&self, org: &OrganizationId) -> Result<Vec<Territory>, StoreError>;
}

/// Key of one durable fairness counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub organization_id: OrganizationId,
    pub rule_id: RuleId,
    pub user_id: UserId,
}

/// Durable storage for fairness counters and round-robin cursors.
pub trait CounterStore: Send + Sync {
    fn load(&self, org: &OrganizationId, rule: &RuleId) -> Result<FairnessState, StoreError>;
    /// Atomically bumps the user's counter and returns the new count. The rule cursor
    /// moves to `cursor` only if its version is newer than the stored one.
    fn increment(&self, key: &CounterKey, cursor: CursorMark) -> Result<u32, StoreError>;
    /// Reverses an increment. The cursor goes back to `cursor.index` only while the
    /// stored version still equals `cursor.version`.
    fn decrement(&self, key: &CounterKey, cursor: CursorMark) -> Result<u32, StoreError>;
}

/// Append-only decision log backing the stats projections.
pub trait AssignmentLog: Send + Sync {
    fn append(&self, entry: AssignmentLogEntry) -> Result<(), StoreError>;
    fn entries(&self, org: &OrganizationId) -> Result<Vec<AssignmentLogEntry>, StoreError>;
}

/// Error enumeration for collaborator failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Fire-and-forget notification hook. Failures are logged, never propagated.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: AssignmentEvent) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentEventKind {
    #[serde(rename = "lead.assigned")]
    LeadAssigned,
    #[serde(rename = "lead.reassignment_failed")]
    ReassignmentFailed,
}

impl AssignmentEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            AssignmentEventKind::LeadAssigned => "lead.assigned",
            AssignmentEventKind::ReassignmentFailed => "lead.reassignment_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentEvent {
    pub kind: AssignmentEventKind,
    pub organization_id: OrganizationId,
    pub lead_id: LeadId,
    pub user_id: Option<UserId>,
    pub rule_id: Option<RuleId>,
    pub details: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("event transport unavailable: {0}")]
    Transport(String),
}
