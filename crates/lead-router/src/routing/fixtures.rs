//! JSON fixtures that seed the in-memory collaborators, used by the `simulate`
//! command and by integration tests.
//!
//! A routing fixture carries one organization's rules, territories, team
//! memberships, and user display names:
//!
//! ```json
//! {
//!   "organization_id": "O1",
//!   "rules": [{ "id": "R1", "organization_id": "O1", "target_model": "leads", ... }],
//!   "territories": [],
//!   "teams": { "inside-sales": ["U1", "U2"] },
//!   "users": { "U1": "Ada Lovelace" }
//! }
//! ```
//!
//! A lead batch is a list of `{ "id", "owner"?, "record" }` objects.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::domain::{
    AssignmentRule, LeadId, LeadRecord, OrganizationId, TeamId, Territory, UserId,
};
use super::memory::InMemoryBackend;
use super::repository::StoreError;

#[derive(Debug)]
pub enum FixtureError {
    Io(std::io::Error),
    Json(serde_json::Error),
    ForeignOrganization { unit: String, organization: String },
    Store(StoreError),
}

impl std::fmt::Display for FixtureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FixtureError::Io(err) => write!(f, "failed to read fixture: {}", err),
            FixtureError::Json(err) => write!(f, "invalid fixture JSON: {}", err),
            FixtureError::ForeignOrganization { unit, organization } => write!(
                f,
                "routing unit '{}' belongs to organization '{}', not the fixture's",
                unit, organization
            ),
            FixtureError::Store(err) => write!(f, "could not seed in-memory store: {}", err),
        }
    }
}

impl std::error::Error for FixtureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FixtureError::Io(err) => Some(err),
            FixtureError::Json(err) => Some(err),
            FixtureError::ForeignOrganization { .. } => None,
            FixtureError::Store(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for FixtureError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for FixtureError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl From<StoreError> for FixtureError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

fn read_json<T: DeserializeOwned, R: Read>(reader: R) -> Result<T, FixtureError> {
    Ok(serde_json::from_reader(reader)?)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingFixture {
    pub organization_id: OrganizationId,
    #[serde(default)]
    pub rules: Vec<AssignmentRule>,
    #[serde(default)]
    pub territories: Vec<Territory>,
    /// Team id to members, in join order.
    #[serde(default)]
    pub teams: BTreeMap<TeamId, Vec<UserId>>,
    #[serde(default)]
    pub users: BTreeMap<UserId, String>,
}

impl RoutingFixture {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, FixtureError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, FixtureError> {
        let fixture: Self = read_json(reader)?;
        fixture.validate()?;
        Ok(fixture)
    }

    fn validate(&self) -> Result<(), FixtureError> {
        let foreign = self
            .rules
            .iter()
            .map(|rule| (&rule.id, &rule.organization_id))
            .chain(
                self.territories
                    .iter()
                    .map(|territory| (&territory.id, &territory.organization_id)),
            )
            .find(|(_, org)| *org != &self.organization_id);

        match foreign {
            Some((unit, organization)) => Err(FixtureError::ForeignOrganization {
                unit: unit.to_string(),
                organization: organization.to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn install(&self, backend: &InMemoryBackend) -> Result<(), FixtureError> {
        let org = &self.organization_id;
        for rule in &self.rules {
            backend.rules.upsert_rule(rule.clone())?;
        }
        for territory in &self.territories {
            backend.rules.upsert_territory(territory.clone())?;
        }
        for (team, members) in &self.teams {
            backend.teams.set_members(org, team, members.clone())?;
        }
        for (user, name) in &self.users {
            backend.teams.set_display_name(org, user, name.clone())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadFixture {
    pub id: LeadId,
    #[serde(default)]
    pub owner: Option<UserId>,
    #[serde(default)]
    pub record: LeadRecord,
}

/// Leads to route, in the order they arrive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeadBatch(pub Vec<LeadFixture>);

impl LeadBatch {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, FixtureError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, FixtureError> {
        read_json(reader)
    }

    pub fn install(
        &self,
        org: &OrganizationId,
        backend: &InMemoryBackend,
    ) -> Result<(), FixtureError> {
        for lead in &self.0 {
            backend
                .leads
                .insert_lead(org, &lead.id, lead.record.clone(), lead.owner.clone())?;
        }
        Ok(())
    }

    pub fn ids(&self) -> impl Iterator<Item = &LeadId> {
        self.0.iter().map(|lead| &lead.id)
    }
}
