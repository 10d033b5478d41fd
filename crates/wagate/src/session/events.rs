//! Delivery of session events to observers.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::trace;
use wagate_protocol::{SessionEvent, SessionNotice};

/// Sending half of a session's notice stream.
#[derive(Clone)]
pub struct EventSink {
    session: Arc<str>,
    tx: mpsc::UnboundedSender<SessionNotice>,
}

impl EventSink {
    pub fn new(session: &str, tx: mpsc::UnboundedSender<SessionNotice>) -> Self {
        Self {
            session: Arc::from(session),
            tx,
        }
    }

    /// Create a sink together with the receiver observers read from.
    pub fn channel(session: &str) -> (Self, mpsc::UnboundedReceiver<SessionNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(session, tx), rx)
    }

    pub fn emit(&self, event: SessionEvent) {
        if self
            .tx
            .send(SessionNotice::new(&*self.session, event))
            .is_err()
        {
            trace!(session = %self.session, "No observers left, dropping session event");
        }
    }

    pub fn success(&self, message: impl Into<String>) {
        self.emit(SessionEvent::Success {
            message: message.into(),
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(SessionEvent::Error {
            message: message.into(),
        });
    }
}
