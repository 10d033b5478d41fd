//! In-memory gateway used by the session tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use wagate_protocol::{PairedIdentity, PairingArtifact, SessionInfo, SessionStatus};

use crate::gateway::{GatewayError, SessionGateway, SessionMetadata};

/// One scripted answer to `get_status`: a status, or an HTTP error code.
pub type Step = Result<SessionStatus, u16>;

/// Gateway whose answers come from a script.
///
/// `get_status` pops the status script and repeats the last entry once the
/// script runs out. `fetch_pairing_artifact` pops the artifact script and
/// answers "not yet available" once it is empty.
#[derive(Default)]
pub struct ScriptedGateway {
    statuses: Mutex<VecDeque<Step>>,
    artifacts: Mutex<VecDeque<Option<PairingArtifact>>>,
    calls: Mutex<Vec<&'static str>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    latency: Duration,
    ping_error: Option<u16>,
    action_error: Option<u16>,
}

impl ScriptedGateway {
    pub fn new(statuses: impl IntoIterator<Item = Step>) -> Self {
        Self {
            statuses: Mutex::new(statuses.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn with_artifacts(self, artifacts: impl IntoIterator<Item = Option<PairingArtifact>>) -> Self {
        *self.artifacts.lock().unwrap() = artifacts.into_iter().collect();
        self
    }

    /// Delay applied to every call, to keep requests in flight.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_ping_error(mut self, status: u16) -> Self {
        self.ping_error = Some(status);
        self
    }

    /// Make create/start/stop/restart/delete fail with `status`.
    pub fn with_action_error(mut self, status: u16) -> Self {
        self.action_error = Some(status);
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Replace the rest of the status script.
    pub fn script(&self, statuses: impl IntoIterator<Item = Step>) {
        *self.statuses.lock().unwrap() = statuses.into_iter().collect();
    }

    pub fn push_artifact(&self, artifact: Option<PairingArtifact>) {
        self.artifacts.lock().unwrap().push_back(artifact);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn next_status(&self) -> Step {
        let mut statuses = self.statuses.lock().unwrap();
        if statuses.len() > 1 {
            statuses.pop_front().unwrap()
        } else {
            statuses.front().copied().unwrap_or(Ok(SessionStatus::NotFound))
        }
    }

    fn action_result(&self) -> Result<(), GatewayError> {
        match self.action_error {
            Some(status) => Err(GatewayError::from_status(status, "scripted".to_string())),
            None => Ok(()),
        }
    }
}

pub fn identity() -> PairedIdentity {
    PairedIdentity {
        id: "5491122334455@c.us".to_string(),
        push_name: Some("Front desk".to_string()),
    }
}

pub fn qr(payload: &str) -> PairingArtifact {
    PairingArtifact::raw(payload)
}

#[async_trait]
impl SessionGateway for ScriptedGateway {
    async fn ping(&self) -> Result<(), GatewayError> {
        self.enter("ping").await;
        match self.ping_error {
            Some(status) => Err(GatewayError::from_status(status, "scripted".to_string())),
            None => Ok(()),
        }
    }

    async fn get_status(&self, session: &str) -> Result<SessionInfo, GatewayError> {
        self.enter("get_status").await;
        match self.next_status() {
            Ok(status) => Ok(SessionInfo {
                name: session.to_string(),
                status,
                me: (status == SessionStatus::Working).then(identity),
            }),
            Err(code) => Err(GatewayError::from_status(code, "scripted".to_string())),
        }
    }

    async fn create_session(
        &self,
        session: &str,
        _metadata: &SessionMetadata,
    ) -> Result<SessionInfo, GatewayError> {
        self.enter("create_session").await;
        self.action_result()?;
        Ok(SessionInfo {
            name: session.to_string(),
            status: SessionStatus::Starting,
            me: None,
        })
    }

    async fn start_session(&self, _session: &str) -> Result<(), GatewayError> {
        self.enter("start_session").await;
        self.action_result()
    }

    async fn stop_session(&self, _session: &str) -> Result<(), GatewayError> {
        self.enter("stop_session").await;
        self.action_result()
    }

    async fn restart_session(&self, _session: &str) -> Result<(), GatewayError> {
        self.enter("restart_session").await;
        self.action_result()
    }

    async fn delete_session(&self, _session: &str) -> Result<(), GatewayError> {
        self.enter("delete_session").await;
        self.action_result()
    }

    async fn fetch_pairing_artifact(
        &self,
        _session: &str,
    ) -> Result<Option<PairingArtifact>, GatewayError> {
        self.enter("fetch_pairing_artifact").await;
        Ok(self.artifacts.lock().unwrap().pop_front().flatten())
    }
}
