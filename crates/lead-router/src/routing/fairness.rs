//! Per-rule assignment counters and round-robin cursors.
//!
//! Every rule gets one [`FairnessState`] behind its own mutex, hydrated lazily from the
//! [`CounterStore`]. Selection ([`FairnessTracker::next_candidate`]) only reads the
//! state. Counters move when the executor commits: [`FairnessTracker::reserve`]
//! re-runs the selection under the rule mutex and claims whichever candidate is next
//! at that moment, then [`FairnessTracker::persist`] makes it durable. Candidate pools
//! are resolved by the caller beforehand, so no collaborator I/O happens while a rule
//! mutex is held.
//!
//! Durable writes happen outside the mutex and may land out of order. Every claim
//! bumps `cursor_version`, and the store only accepts a cursor carrying a newer
//! version, so a late write never moves the durable cursor backwards.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use super::domain::{OrganizationId, RuleId, RuleType, UserId};
use super::repository::{CounterKey, CounterStore, StoreError};

/// Mutable fairness counters of one rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FairnessState {
    pub assignment_count: BTreeMap<UserId, u32>,
    pub last_assigned_index: Option<usize>,
    /// Grows by one per claim; orders cursor writes.
    #[serde(default)]
    pub cursor_version: u64,
}

impl FairnessState {
    pub fn count_for(&self, user: &UserId) -> u32 {
        self.assignment_count.get(user).copied().unwrap_or(0)
    }

    fn has_capacity(&self, user: &UserId, cap: u32) -> bool {
        cap == 0 || self.count_for(user) < cap
    }

    /// Moves the cursor if `mark` is newer than the one already applied.
    pub fn advance_cursor(&mut self, mark: CursorMark) {
        if mark.version > self.cursor_version {
            self.last_assigned_index = mark.index;
            self.cursor_version = mark.version;
        }
    }

    /// Puts the cursor back to `mark.index` unless a newer claim moved it since.
    pub fn rewind_cursor(&mut self, mark: CursorMark) {
        if mark.version == self.cursor_version {
            self.last_assigned_index = mark.index;
        }
    }

    /// Picks the next candidate without mutating anything.
    pub fn next_candidate(&self, strategy: RuleType, cap: u32, pool: &[UserId]) -> Option<UserId> {
        if pool.is_empty() {
            return None;
        }

        match strategy {
            RuleType::RoundRobin => {
                let start = self
                    .last_assigned_index
                    .map(|index| (index + 1) % pool.len())
                    .unwrap_or(0);
                (0..pool.len())
                    .map(|offset| &pool[(start + offset) % pool.len()])
                    .find(|user| self.has_capacity(user, cap))
                    .cloned()
            }
            // min_by_key keeps the first of equal minimums, so ties go to pool order.
            RuleType::LoadBalanced => pool
                .iter()
                .filter(|user| self.has_capacity(user, cap))
                .min_by_key(|user| self.count_for(user))
                .cloned(),
            RuleType::Manual | RuleType::Territory => pool
                .iter()
                .find(|user| self.has_capacity(user, cap))
                .cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FairnessKey {
    pub organization_id: OrganizationId,
    pub rule_id: RuleId,
}

impl FairnessKey {
    pub fn new(organization_id: &OrganizationId, rule_id: &RuleId) -> Self {
        Self {
            organization_id: organization_id.clone(),
            rule_id: rule_id.clone(),
        }
    }

    fn counter_key(&self, user_id: &UserId) -> CounterKey {
        CounterKey {
            organization_id: self.organization_id.clone(),
            rule_id: self.rule_id.clone(),
            user_id: user_id.clone(),
        }
    }
}

/// Cursor position tagged with the claim that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorMark {
    pub index: Option<usize>,
    pub version: u64,
}

/// In-memory claim on a fairness slot, created by [`FairnessTracker::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub key: FairnessKey,
    pub user_id: UserId,
    pub cursor: usize,
    pub previous_cursor: Option<usize>,
    pub version: u64,
}

impl Reservation {
    fn claimed(&self) -> CursorMark {
        CursorMark {
            index: Some(self.cursor),
            version: self.version,
        }
    }

    fn replaced(&self) -> CursorMark {
        CursorMark {
            index: self.previous_cursor,
            version: self.version,
        }
    }
}

pub struct FairnessTracker {
    store: Arc<dyn CounterStore>,
    states: Mutex<HashMap<FairnessKey, Arc<Mutex<FairnessState>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FairnessTracker {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn state(&self, key: &FairnessKey) -> Result<Arc<Mutex<FairnessState>>, StoreError> {
        if let Some(state) = lock(&self.states).get(key) {
            return Ok(state.clone());
        }

        let loaded = self.store.load(&key.organization_id, &key.rule_id)?;
        let mut states = lock(&self.states);
        let state = states
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(loaded)));
        Ok(state.clone())
    }

    pub fn next_candidate(
        &self,
        key: &FairnessKey,
        strategy: RuleType,
        cap: u32,
        pool: &[UserId],
    ) -> Result<Option<UserId>, StoreError> {
        let state = self.state(key)?;
        let guard = lock(&state);
        Ok(guard.next_candidate(strategy, cap, pool))
    }

    /// Claims the candidate the current state selects from `pool`.
    ///
    /// Concurrent commits may have moved the state since the caller peeked, so the
    /// claimed user can differ from the peeked one. Returns `None` only when every
    /// candidate is now at capacity.
    pub fn reserve(
        &self,
        key: &FairnessKey,
        strategy: RuleType,
        cap: u32,
        pool: &[UserId],
    ) -> Result<Option<Reservation>, StoreError> {
        let state = self.state(key)?;
        let mut guard = lock(&state);

        let Some(user) = guard.next_candidate(strategy, cap, pool) else {
            return Ok(None);
        };
        let Some(cursor) = pool.iter().position(|candidate| candidate == &user) else {
            return Ok(None);
        };

        let previous_cursor = guard.last_assigned_index.replace(cursor);
        guard.cursor_version += 1;
        *guard.assignment_count.entry(user.clone()).or_insert(0) += 1;

        Ok(Some(Reservation {
            key: key.clone(),
            user_id: user,
            cursor,
            previous_cursor,
            version: guard.cursor_version,
        }))
    }

    /// Durable increment through the counter store.
    pub fn persist(&self, reservation: &Reservation) -> Result<u32, StoreError> {
        self.store.increment(
            &reservation.key.counter_key(&reservation.user_id),
            reservation.claimed(),
        )
    }

    /// Reverses a persisted increment.
    pub fn unpersist(&self, reservation: &Reservation) -> Result<u32, StoreError> {
        self.store.decrement(
            &reservation.key.counter_key(&reservation.user_id),
            reservation.replaced(),
        )
    }

    /// Drops an in-memory claim. The cursor is only restored if no later claim moved it.
    pub fn release(&self, reservation: &Reservation) {
        let Some(state) = lock(&self.states).get(&reservation.key).cloned() else {
            return;
        };

        let mut guard = lock(&state);
        if let Some(count) = guard.assignment_count.get_mut(&reservation.user_id) {
            *count = count.saturating_sub(1);
        }
        guard.rewind_cursor(reservation.replaced());
    }

    /// Copy of the in-memory state for a rule, if it has been hydrated.
    pub fn snapshot(&self, key: &FairnessKey) -> Option<FairnessState> {
        let state = lock(&self.states).get(key).cloned()?;
        let guard = lock(&state);
        Some(guard.clone())
    }
}
