use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::storage::StoreError;

use super::super::state::{DoseKey, EscalationState, Resolution};
use super::EscalationStore;

/// In-process store; the map's per-shard lock serializes writers per key.
#[derive(Debug, Default)]
pub struct MemoryEscalationStore {
    states: DashMap<DoseKey, EscalationState>,
}

impl MemoryEscalationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl EscalationStore for MemoryEscalationStore {
    fn load(&self, key: &DoseKey) -> Result<Option<EscalationState>, StoreError> {
        Ok(self.states.get(key).map(|entry| entry.value().clone()))
    }

    fn insert_if_absent(&self, state: EscalationState) -> Result<EscalationState, StoreError> {
        let entry = self.states.entry(state.key()).or_insert(state);
        Ok(entry.value().clone())
    }

    fn update(
        &self,
        key: &DoseKey,
        apply: &mut dyn FnMut(&mut EscalationState),
    ) -> Result<Option<EscalationState>, StoreError> {
        match self.states.get_mut(key) {
            Some(mut entry) => {
                apply(entry.value_mut());
                Ok(Some(entry.value().clone()))
            }
            None => Ok(None),
        }
    }

    fn purge_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let before = self.states.len();
        self.states.retain(|_, state| {
            !(state.resolved && state.resolved_at.is_some_and(|at| at < cutoff))
        });
        Ok(before.saturating_sub(self.states.len()))
    }

    fn expire_unresolved_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut expired = 0;
        for mut entry in self.states.iter_mut() {
            let state = entry.value_mut();
            if !state.resolved && state.dose_at < cutoff {
                state.mark_resolved(Resolution::Timeout, now);
                expired += 1;
            }
        }
        Ok(expired)
    }

    fn unresolved_count(&self) -> Result<usize, StoreError> {
        Ok(self.states.iter().filter(|entry| !entry.resolved).count())
    }
}
