//! Lead assignment and territory routing.
//!
//! [`AssignmentEngine`] is the entry point. For each lead it walks the organization's
//! rules and territories in priority order ([`RuleCatalog`]), evaluates their
//! conditions, expands the first match into candidates ([`CandidatePool`]), and picks
//! one under the rule's fairness strategy and per-user cap ([`FairnessTracker`]). The
//! commit ([`AssignmentExecutor`]) writes the owner, the durable counter, and the log
//! entry together, or none of them.
//!
//! Storage stays behind the traits in [`repository`]; [`memory`] ships in-memory
//! implementations of each.

mod candidates;
mod catalog;
mod clock;
mod conditions;
mod domain;
mod engine;
mod executor;
mod fairness;
pub mod fixtures;
pub mod memory;
pub mod repository;
mod router;
mod selector;
mod stats;

#[cfg(test)]
mod tests;

pub use candidates::CandidatePool;
pub use catalog::RuleCatalog;
pub use clock::{Clock, FixedClock, SystemClock};
pub use conditions::{matches, ConditionSet, Operator, Predicate};
pub use domain::{
    ActiveSchedule, AssignToType, AssignmentDecision, AssignmentLogEntry, AssignmentReason,
    AssignmentRule, LeadId, LeadRecord, OrganizationId, RoutingUnit, RuleId, RuleType, TeamId,
    Territory, UserId,
};
pub use engine::{AssignmentEngine, Collaborators, EngineError};
pub use executor::{AssignmentExecutor, CommitOutcome};
pub use fairness::{CursorMark, FairnessKey, FairnessState, FairnessTracker, Reservation};
pub use fixtures::{FixtureError, LeadBatch, LeadFixture, RoutingFixture};
pub use memory::InMemoryBackend;
pub use repository::{
    AssignmentEvent, AssignmentEventKind, AssignmentLog, CounterKey, CounterStore, EventSink,
    LeadStore, RuleRepository, SinkError, StoreError, TeamDirectory,
};
pub use router::{assignment_router, AssignRequest, StatsQuery};
pub use selector::{AssignmentProposal, AssignmentSelector, CandidateSelection};
pub use stats::{RuleEffectiveness, StatsReporter, UserAssignmentStats};
