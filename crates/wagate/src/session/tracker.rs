//! Last-known status and pairing QR for one session.
//!
//! The tracker is the single source of truth the polling engine and the
//! orchestrator write into. Observers are called synchronously after every
//! mutation that changed something, outside the state lock.
//!
//! Invariant: a pairing artifact is only held while the status is
//! `SCAN_QR_CODE`. It holds after every mutation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use wagate_protocol::{PairedIdentity, PairingArtifact, SessionStatus};

type StatusObserver = Arc<dyn Fn(&StatusSnapshot) + Send + Sync>;
type ArtifactObserver = Arc<dyn Fn(Option<&PairingArtifact>) + Send + Sync>;

/// Status as last written into the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub status: SessionStatus,
    /// Only set while the status is `WORKING`.
    pub identity: Option<PairedIdentity>,
    /// When the status was last written, `None` before the first check.
    pub checked_at: Option<DateTime<Utc>>,
}

struct TrackerState {
    status: SessionStatus,
    identity: Option<PairedIdentity>,
    artifact: Option<PairingArtifact>,
    checked_at: Option<DateTime<Utc>>,
}

impl TrackerState {
    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            status: self.status,
            identity: self.identity.clone(),
            checked_at: self.checked_at,
        }
    }

    /// Drop an artifact that outlived its `SCAN_QR_CODE` status.
    fn heal(&mut self) -> bool {
        if self.artifact.is_some() && self.status != SessionStatus::ScanQrCode {
            warn!(status = %self.status, "Pairing QR held outside SCAN_QR_CODE, clearing");
            self.artifact = None;
            return true;
        }
        false
    }

    /// Clear the artifact if the new status no longer allows one.
    fn heal_on_transition(&mut self) -> bool {
        if self.status != SessionStatus::ScanQrCode {
            return self.artifact.take().is_some();
        }
        false
    }
}

#[derive(Default)]
struct Observers {
    status: Vec<StatusObserver>,
    artifact: Vec<ArtifactObserver>,
}

struct Inner {
    state: Mutex<TrackerState>,
    observers: Mutex<Observers>,
}

/// Shared handle to a session's tracked state.
#[derive(Clone)]
pub struct SessionTracker {
    inner: Arc<Inner>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(TrackerState {
                    status: SessionStatus::NotFound,
                    identity: None,
                    artifact: None,
                    checked_at: None,
                }),
                observers: Mutex::new(Observers::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn observers(&self) -> MutexGuard<'_, Observers> {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn status(&self) -> SessionStatus {
        self.state().status
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.state().snapshot()
    }

    pub fn artifact(&self) -> Option<PairingArtifact> {
        let (artifact, healed) = {
            let mut state = self.state();
            let healed = state.heal();
            (state.artifact.clone(), healed)
        };
        if healed {
            self.notify_artifact(None);
        }
        artifact
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Overwrite the status. Leaving `SCAN_QR_CODE` clears the artifact in the
    /// same step.
    pub fn set_status(&self, status: SessionStatus, identity: Option<PairedIdentity>) {
        let identity = if status == SessionStatus::Working {
            identity
        } else {
            None
        };

        let (status_change, artifact_cleared) = {
            let mut state = self.state();
            let status_changed = state.status != status || state.identity != identity;
            state.status = status;
            state.identity = identity;
            state.checked_at = Some(Utc::now());
            let artifact_cleared = state.heal_on_transition();
            (status_changed.then(|| state.snapshot()), artifact_cleared)
        };

        if let Some(snapshot) = status_change {
            debug!(status = %snapshot.status, "Session status changed");
            self.notify_status(&snapshot);
        }
        if artifact_cleared {
            self.notify_artifact(None);
        }
    }

    /// Store a pairing QR. Ignored unless the status is `SCAN_QR_CODE`.
    ///
    /// Returns whether the artifact was accepted.
    pub fn set_pairing_artifact(&self, artifact: PairingArtifact) -> bool {
        let changed = {
            let mut state = self.state();
            if state.status != SessionStatus::ScanQrCode {
                debug!(status = %state.status, "Ignoring pairing QR outside SCAN_QR_CODE");
                return false;
            }
            if state.artifact.as_ref() == Some(&artifact) {
                false
            } else {
                state.artifact = Some(artifact.clone());
                true
            }
        };

        if changed {
            self.notify_artifact(Some(&artifact));
        }
        true
    }

    /// Drop the artifact without touching the status.
    pub fn clear_artifact(&self) {
        let cleared = self.state().artifact.take().is_some();
        if cleared {
            self.notify_artifact(None);
        }
    }

    /// Back to `NOT_FOUND` with no artifact, as after deleting the session.
    pub fn reset(&self) {
        let (status_change, artifact_cleared) = {
            let mut state = self.state();
            let status_changed =
                state.status != SessionStatus::NotFound || state.identity.is_some();
            state.status = SessionStatus::NotFound;
            state.identity = None;
            state.checked_at = None;
            let artifact_cleared = state.artifact.take().is_some();
            (status_changed.then(|| state.snapshot()), artifact_cleared)
        };

        if let Some(snapshot) = status_change {
            self.notify_status(&snapshot);
        }
        if artifact_cleared {
            self.notify_artifact(None);
        }
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    /// Register observers for future changes. Past changes are not replayed.
    pub fn subscribe(
        &self,
        on_status: impl Fn(&StatusSnapshot) + Send + Sync + 'static,
        on_artifact: impl Fn(Option<&PairingArtifact>) + Send + Sync + 'static,
    ) {
        let mut observers = self.observers();
        observers.status.push(Arc::new(on_status));
        observers.artifact.push(Arc::new(on_artifact));
    }

    fn notify_status(&self, snapshot: &StatusSnapshot) {
        let observers = self.observers().status.clone();
        for observer in observers {
            observer(snapshot);
        }
    }

    fn notify_artifact(&self, artifact: Option<&PairingArtifact>) {
        let observers = self.observers().artifact.clone();
        for observer in observers {
            observer(artifact);
        }
    }
}
