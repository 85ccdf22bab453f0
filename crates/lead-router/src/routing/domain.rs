use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::conditions::ConditionSet;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Tenant boundary for rules, territories, and counters.
    OrganizationId
);
string_id!(
    /// Identifier of the lead being routed.
    LeadId
);
string_id!(
    /// Identifier of a user that can own leads.
    UserId
);
string_id!(TeamId);
string_id!(
    /// Identifier shared by assignment rules and territories.
    RuleId
);

/// Selection strategy applied to a matched rule's candidate pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    RoundRobin,
    LoadBalanced,
    Territory,
    Manual,
}

impl RuleType {
    pub fn label(&self) -> &'static str {
        match self {
            RuleType::RoundRobin => "round_robin",
            RuleType::LoadBalanced => "load_balanced",
            RuleType::Territory => "territory",
            RuleType::Manual => "manual",
        }
    }
}

/// How `candidate_ids` on a rule are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignToType {
    User,
    Team,
}

/// Optional time-of-day window and weekday filter. Times are evaluated in UTC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSchedule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_window_start: Option<NaiveTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_window_end: Option<NaiveTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_days: Option<Vec<Weekday>>,
}

impl ActiveSchedule {
    /// Whether the schedule admits `now`. A window whose start is after its end wraps
    /// midnight; identical bounds mean the whole day.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        if let Some(days) = &self.active_days {
            if !days.contains(&now.weekday()) {
                return false;
            }
        }

        let time = now.time();
        match (self.assignment_window_start, self.assignment_window_end) {
            (Some(start), Some(end)) if start == end => true,
            (Some(start), Some(end)) if start < end => start <= time && time < end,
            (Some(start), Some(end)) => time >= start || time < end,
            (Some(start), None) => time >= start,
            (None, Some(end)) => time < end,
            (None, None) => true,
        }
    }
}

/// Routing policy scoped to one organization and one target model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRule {
    pub id: RuleId,
    pub organization_id: OrganizationId,
    #[serde(default)]
    pub name: String,
    pub target_model: String,
    pub rule_type: RuleType,
    pub priority: i32,
    pub is_active: bool,
    #[serde(default)]
    pub conditions: ConditionSet,
    pub assign_to_type: AssignToType,
    /// User ids for `assign_to_type = user`, team ids for `team`.
    #[serde(default)]
    pub candidate_ids: Vec<String>,
    /// Zero means unlimited.
    #[serde(default)]
    pub max_assignments_per_user: u32,
    #[serde(flatten)]
    pub schedule: ActiveSchedule,
    pub created_at: DateTime<Utc>,
}

/// Segment-scoped routing unit keyed by assigned users and teams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Territory {
    pub id: RuleId,
    pub organization_id: OrganizationId,
    #[serde(default)]
    pub name: String,
    pub priority: i32,
    pub is_active: bool,
    #[serde(default)]
    pub conditions: ConditionSet,
    #[serde(default)]
    pub assigned_users: Vec<UserId>,
    #[serde(default)]
    pub assigned_teams: Vec<TeamId>,
    #[serde(default)]
    pub max_assignments_per_user: u32,
    #[serde(flatten)]
    pub schedule: ActiveSchedule,
    pub created_at: DateTime<Utc>,
}

/// Either kind of routing unit, evaluated together in one priority-ordered pass.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingUnit {
    Rule(AssignmentRule),
    Territory(Territory),
}

impl RoutingUnit {
    pub fn id(&self) -> &RuleId {
        match self {
            RoutingUnit::Rule(rule) => &rule.id,
            RoutingUnit::Territory(territory) => &territory.id,
        }
    }

    pub fn organization_id(&self) -> &OrganizationId {
        match self {
            RoutingUnit::Rule(rule) => &rule.organization_id,
            RoutingUnit::Territory(territory) => &territory.organization_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RoutingUnit::Rule(rule) => &rule.name,
            RoutingUnit::Territory(territory) => &territory.name,
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            RoutingUnit::Rule(rule) => rule.priority,
            RoutingUnit::Territory(territory) => territory.priority,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            RoutingUnit::Rule(rule) => rule.created_at,
            RoutingUnit::Territory(territory) => territory.created_at,
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            RoutingUnit::Rule(rule) => rule.is_active,
            RoutingUnit::Territory(territory) => territory.is_active,
        }
    }

    pub fn conditions(&self) -> &ConditionSet {
        match self {
            RoutingUnit::Rule(rule) => &rule.conditions,
            RoutingUnit::Territory(territory) => &territory.conditions,
        }
    }

    pub fn schedule(&self) -> &ActiveSchedule {
        match self {
            RoutingUnit::Rule(rule) => &rule.schedule,
            RoutingUnit::Territory(territory) => &territory.schedule,
        }
    }

    pub fn strategy(&self) -> RuleType {
        match self {
            RoutingUnit::Rule(rule) => rule.rule_type,
            RoutingUnit::Territory(_) => RuleType::Territory,
        }
    }

    pub fn max_assignments_per_user(&self) -> u32 {
        match self {
            RoutingUnit::Rule(rule) => rule.max_assignments_per_user,
            RoutingUnit::Territory(territory) => territory.max_assignments_per_user,
        }
    }
}

/// Flat attribute map extracted from a lead (`country_id`, `tag_ids`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeadRecord(pub BTreeMap<String, Value>);

impl LeadRecord {
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Caller-supplied overrides replace extracted attributes field by field.
    pub fn overlay(&mut self, overrides: BTreeMap<String, Value>) {
        self.0.extend(overrides);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentReason {
    AutoAssignment,
    Reassignment,
    AlreadyAssigned,
    NoMatch,
}

impl AssignmentReason {
    pub fn label(&self) -> &'static str {
        match self {
            AssignmentReason::AutoAssignment => "auto_assignment",
            AssignmentReason::Reassignment => "reassignment",
            AssignmentReason::AlreadyAssigned => "already_assigned",
            AssignmentReason::NoMatch => "no_match",
        }
    }

    /// True for reasons that move ownership.
    pub fn is_assignment(&self) -> bool {
        matches!(
            self,
            AssignmentReason::AutoAssignment | AssignmentReason::Reassignment
        )
    }
}

/// Outcome of routing one lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentDecision {
    pub lead_id: LeadId,
    pub assigned_to_id: Option<UserId>,
    pub assigned_to_name: Option<String>,
    pub reason: AssignmentReason,
    pub changed: bool,
    pub matched_rule_id: Option<RuleId>,
    pub previous_owner_id: Option<UserId>,
}

impl AssignmentDecision {
    pub fn no_match(lead_id: LeadId, current_owner: Option<UserId>) -> Self {
        Self {
            lead_id,
            assigned_to_id: current_owner.clone(),
            assigned_to_name: None,
            reason: AssignmentReason::NoMatch,
            changed: false,
            matched_rule_id: None,
            previous_owner_id: current_owner,
        }
    }

    /// Decision reported when another trigger already moved the lead to `owner`.
    pub(crate) fn owned_concurrently(&self, owner: UserId) -> Self {
        let assigned_to_name = if self.assigned_to_id.as_ref() == Some(&owner) {
            self.assigned_to_name.clone()
        } else {
            None
        };

        Self {
            lead_id: self.lead_id.clone(),
            assigned_to_id: Some(owner.clone()),
            assigned_to_name,
            reason: AssignmentReason::AlreadyAssigned,
            changed: false,
            matched_rule_id: self.matched_rule_id.clone(),
            previous_owner_id: Some(owner),
        }
    }
}

/// Append-only record of a routing decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentLogEntry {
    pub timestamp: DateTime<Utc>,
    pub organization_id: OrganizationId,
    pub target_model: String,
    pub lead_id: LeadId,
    pub rule_id: Option<RuleId>,
    pub user_id: Option<UserId>,
    pub reason: AssignmentReason,
}
