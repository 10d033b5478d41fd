//! Events reported to observers of a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{PairedIdentity, PairingArtifact, SessionStatus};

/// Phase of a polling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollMode {
    /// No QR yet; trying to obtain one.
    AcquireQr,
    /// QR obtained; waiting for the user to scan it.
    MonitorPairing,
}

/// Outcome of a polling cycle that ran out of attempts.
///
/// Not an error in itself: when `artifact_obtained` is set the QR is still
/// valid and the user may scan it later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutCondition {
    pub mode: PollMode,
    pub attempts: u32,
    pub last_status: Option<SessionStatus>,
    pub artifact_obtained: bool,
}

impl TimeoutCondition {
    /// A QR that never showed up is a failure; an unscanned one is not.
    pub fn is_error(&self) -> bool {
        !self.artifact_obtained
    }
}

/// Something an observer of a session should know about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StatusChanged {
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity: Option<PairedIdentity>,
    },
    ArtifactChanged {
        artifact: Option<PairingArtifact>,
    },
    /// A non-terminal tick of a polling cycle.
    Progress {
        mode: PollMode,
        attempt: u32,
        max_attempts: u32,
        status: SessionStatus,
    },
    Success {
        message: String,
    },
    Error {
        message: String,
    },
    TimedOut {
        condition: TimeoutCondition,
    },
}

/// A [`SessionEvent`] stamped with its session and time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionNotice {
    pub session: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: SessionEvent,
}

impl SessionNotice {
    pub fn new(session: impl Into<String>, event: SessionEvent) -> Self {
        Self {
            session: session.into(),
            at: Utc::now(),
            event,
        }
    }
}
