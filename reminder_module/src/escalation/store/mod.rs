use chrono::{DateTime, Utc};

use crate::storage::StoreError;

use super::state::{DoseKey, EscalationState};

mod memory;
mod sqlite;

pub use memory::MemoryEscalationStore;
pub use sqlite::SqliteEscalationStore;

/// Persistence for escalation state. Every method is atomic per key: `update`
/// runs `apply` inside a single-writer critical section for that key.
pub trait EscalationStore: Send + Sync {
    fn load(&self, key: &DoseKey) -> Result<Option<EscalationState>, StoreError>;

    /// Inserts `state` unless a record already exists for its key; returns the
    /// record now stored.
    fn insert_if_absent(&self, state: EscalationState) -> Result<EscalationState, StoreError>;

    /// Returns `None` when no record exists for `key`.
    fn update(
        &self,
        key: &DoseKey,
        apply: &mut dyn FnMut(&mut EscalationState),
    ) -> Result<Option<EscalationState>, StoreError>;

    /// Drops resolved records whose resolution happened before `cutoff`.
    fn purge_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Resolves with `Timeout` every unresolved record whose dose is older
    /// than `cutoff`; returns how many were closed.
    fn expire_unresolved_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    fn unresolved_count(&self) -> Result<usize, StoreError>;
}
