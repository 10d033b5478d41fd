//! Types shared between the wagate session manager and the application
//! embedding it.
//!
//! - [`SessionStatus`], [`SessionInfo`], [`PairedIdentity`]: what the gateway
//!   reports about a session
//! - [`PairingArtifact`]: the QR payload used to link a phone
//! - [`SessionEvent`] / [`SessionNotice`]: what the manager reports back to
//!   its observers

mod event;
mod session;

pub use event::{PollMode, SessionEvent, SessionNotice, TimeoutCondition};
pub use session::{PairedIdentity, PairingArtifact, SessionInfo, SessionStatus};
