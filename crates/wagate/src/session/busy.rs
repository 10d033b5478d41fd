//! The single "busy" flag shared by polling, refreshes and lifecycle intents.
//!
//! Only one occupant may drive status checks for a session at a time. A
//! background refresh yields to everything else; polling cycles and intents
//! never displace each other.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What currently holds the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupant {
    /// A connect-flow polling cycle.
    Polling,
    /// A silent background status check.
    Refresh,
    /// A user-initiated operation (connect, disconnect, manual refresh, ...).
    Intent,
}

struct Claim {
    id: u64,
    occupant: Occupant,
    token: CancellationToken,
}

#[derive(Default)]
struct SlotState {
    current: Option<Claim>,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct BusySlot {
    inner: Arc<Mutex<SlotState>>,
}

impl BusySlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the slot, cancelling a background refresh if one holds it.
    ///
    /// Fails with the current occupant if a polling cycle or an intent holds
    /// the slot, even one that was already cancelled but has not finished.
    pub fn claim(&self, occupant: Occupant) -> Result<BusyGuard, Occupant> {
        let mut state = self.state();
        if let Some(current) = &state.current {
            if current.occupant != Occupant::Refresh {
                return Err(current.occupant);
            }
            debug!(claim = ?occupant, "Preempting background refresh");
            current.token.cancel();
        }
        Ok(self.install(&mut state, occupant))
    }

    /// Claim the slot for a background refresh, only if nobody holds it.
    pub fn try_claim_refresh(&self) -> Option<BusyGuard> {
        let mut state = self.state();
        if state.current.is_some() {
            return None;
        }
        Some(self.install(&mut state, Occupant::Refresh))
    }

    pub fn occupant(&self) -> Option<Occupant> {
        self.state().current.as_ref().map(|c| c.occupant)
    }

    fn install(&self, state: &mut SlotState, occupant: Occupant) -> BusyGuard {
        state.next_id += 1;
        let id = state.next_id;
        let token = CancellationToken::new();
        state.current = Some(Claim {
            id,
            occupant,
            token: token.clone(),
        });
        BusyGuard {
            slot: self.clone(),
            id,
            token,
        }
    }
}

/// Holds the slot until dropped.
pub struct BusyGuard {
    slot: BusySlot,
    id: u64,
    token: CancellationToken,
}

impl BusyGuard {
    /// Cancelled when the holder is preempted or told to stop.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Run `f` only if this guard still holds the slot and was not
    /// cancelled. The slot stays locked while `f` runs, so no claim can
    /// slip in between the check and the write.
    pub fn while_held<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let state = self.slot.state();
        let held = state.current.as_ref().is_some_and(|c| c.id == self.id);
        if !held || self.token.is_cancelled() {
            return None;
        }
        let result = f();
        drop(state);
        Some(result)
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut state = self.slot.state();
        if state.current.as_ref().is_some_and(|c| c.id == self.id) {
            state.current = None;
        }
    }
}
