use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::channel::Channel;
use crate::storage::{retention_cutoff, StoreError};

use super::ladder::{EscalationLadder, EscalationRule};
use super::state::{DoseKey, EscalationState, Resolution};
use super::store::EscalationStore;

/// Drives escalation state through the ladder. Resolution is terminal: once a
/// state is resolved no later `advance` changes it.
#[derive(Clone)]
pub struct EscalationMachine {
    store: Arc<dyn EscalationStore>,
}

impl EscalationMachine {
    pub fn new(store: Arc<dyn EscalationStore>) -> Self {
        Self { store }
    }

    /// Starts tracking `key` at the ladder's first level. Idempotent: an
    /// existing record (resolved or not) is returned unchanged.
    pub fn start(
        &self,
        key: DoseKey,
        ladder: &EscalationLadder,
        now: DateTime<Utc>,
    ) -> Result<EscalationState, StoreError> {
        let fresh = EscalationState::started(key, ladder.first().level, now);
        let stored = self.store.insert_if_absent(fresh)?;
        if !stored.resolved && stored.checks == 0 {
            info!("escalation started for {} at {}", key, stored.level);
        } else {
            debug!("escalation already tracked for {}", key);
        }
        Ok(stored)
    }

    /// Consumes one attempt at the current level, moving up the ladder once the
    /// level's attempts are spent and resolving with `Timeout` past the top.
    /// Returns `None` when nothing is tracked for `key`.
    pub fn advance(
        &self,
        key: &DoseKey,
        ladder: &EscalationLadder,
        now: DateTime<Utc>,
    ) -> Result<Option<EscalationState>, StoreError> {
        self.store
            .update(key, &mut |state: &mut EscalationState| apply_advance(state, ladder, now))
    }

    /// Like [`advance`](Self::advance) but only applies when exactly `step`
    /// checks were consumed before, so a redelivered check is a no-op.
    pub fn advance_step(
        &self,
        key: &DoseKey,
        ladder: &EscalationLadder,
        step: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<EscalationState>, StoreError> {
        self.store.update(key, &mut |state: &mut EscalationState| {
            if state.checks == step {
                apply_advance(state, ladder, now);
            } else {
                debug!(
                    "skip escalation check {} for {} (already at check {})",
                    step,
                    state.key(),
                    state.checks
                );
            }
        })
    }

    /// Idempotent; the first resolution wins and later calls keep it.
    pub fn resolve(
        &self,
        key: &DoseKey,
        reason: Resolution,
        now: DateTime<Utc>,
    ) -> Result<Option<EscalationState>, StoreError> {
        let resolved = self
            .store
            .update(key, &mut |state: &mut EscalationState| state.mark_resolved(reason, now))?;
        if let Some(state) = &resolved {
            if state.resolution == Some(reason) && state.resolved_at == Some(now) {
                info!("escalation {} resolved: {}", key, reason);
            }
        }
        Ok(resolved)
    }

    pub fn get(&self, key: &DoseKey) -> Result<Option<EscalationState>, StoreError> {
        self.store.load(key)
    }

    pub fn current_rule<'a>(
        &self,
        state: &EscalationState,
        ladder: &'a EscalationLadder,
    ) -> Option<&'a EscalationRule> {
        ladder.rule_for(state.level)
    }

    pub fn next_rule<'a>(
        &self,
        state: &EscalationState,
        ladder: &'a EscalationLadder,
    ) -> Option<&'a EscalationRule> {
        ladder.next_after(state.level)
    }

    pub fn requires_caregiver(&self, state: &EscalationState, ladder: &EscalationLadder) -> bool {
        ladder
            .rule_for(state.level)
            .is_some_and(|rule| rule.notify_caregiver)
    }

    pub fn channels(&self, state: &EscalationState, ladder: &EscalationLadder) -> Vec<Channel> {
        ladder
            .rule_for(state.level)
            .map(|rule| rule.channels.clone())
            .unwrap_or_default()
    }

    /// Time left until the next escalation check, measured from the last
    /// attempt (or the start). `None` once resolved, when the top level has
    /// no attempts left, or for a single-level ladder, which never schedules
    /// checks.
    pub fn time_until_next(
        &self,
        state: &EscalationState,
        ladder: &EscalationLadder,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        if state.resolved || ladder.len() < 2 {
            return None;
        }
        let rule = ladder.rule_for(state.level)?;
        if ladder.next_after(state.level).is_none() && state.attempts >= rule.max_attempts {
            return None;
        }
        let since = state.last_attempt_at.unwrap_or(state.started_at);
        let due = since.checked_add_signed(rule.delay())?;
        Some((due - now).max(Duration::zero()))
    }

    /// Purges resolved states older than `retention`.
    pub fn purge_resolved(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<usize, StoreError> {
        let removed = self.store.purge_resolved_before(retention_cutoff(now, retention))?;
        if removed > 0 {
            debug!("purged {} resolved escalation state(s)", removed);
        }
        Ok(removed)
    }

    /// Times out states still open for doses older than `retention`. Covers
    /// escalations nothing will advance any more: single-level ladders and
    /// ladders whose checks were cancelled.
    pub fn expire_stale(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<usize, StoreError> {
        let expired = self
            .store
            .expire_unresolved_before(retention_cutoff(now, retention), now)?;
        if expired > 0 {
            info!("timed out {} stale escalation state(s)", expired);
        }
        Ok(expired)
    }

    pub fn unresolved_count(&self) -> Result<usize, StoreError> {
        self.store.unresolved_count()
    }
}

fn apply_advance(state: &mut EscalationState, ladder: &EscalationLadder, now: DateTime<Utc>) {
    if state.resolved {
        return;
    }
    state.checks += 1;
    state.attempts += 1;
    state.last_attempt_at = Some(now);
    let Some(rule) = ladder.rule_for(state.level) else {
        // Level removed from the ladder since the dose fired.
        state.mark_resolved(Resolution::Timeout, now);
        return;
    };
    if state.attempts >= rule.max_attempts {
        match ladder.next_after(state.level) {
            Some(next) => {
                state.level = next.level;
                state.attempts = 0;
            }
            None => state.mark_resolved(Resolution::Timeout, now),
        }
    }
}
