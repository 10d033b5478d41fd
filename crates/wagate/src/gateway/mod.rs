//! WhatsApp gateway (WAHA) session API.
//!
//! [`SessionGateway`] is the seam the session manager talks through;
//! [`WahaClient`] is the HTTP implementation. The client holds no state
//! between calls.

mod client;
mod error;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use wagate_protocol::{PairingArtifact, SessionInfo};

pub use client::{DEFAULT_QR_ENDPOINTS, WahaClient};
pub use error::{GatewayError, check_response};

/// Session lifecycle operations exposed by the gateway.
#[async_trait]
pub trait SessionGateway: Send + Sync {
    /// Check that the gateway is reachable and accepts our credentials.
    async fn ping(&self) -> Result<(), GatewayError>;

    /// Current session state. A missing session is `SessionStatus::NotFound`,
    /// not an error.
    async fn get_status(&self, session: &str) -> Result<SessionInfo, GatewayError>;

    /// Create the session and start it right away.
    async fn create_session(
        &self,
        session: &str,
        metadata: &SessionMetadata,
    ) -> Result<SessionInfo, GatewayError>;

    async fn start_session(&self, session: &str) -> Result<(), GatewayError>;

    async fn stop_session(&self, session: &str) -> Result<(), GatewayError>;

    async fn restart_session(&self, session: &str) -> Result<(), GatewayError>;

    async fn delete_session(&self, session: &str) -> Result<(), GatewayError>;

    /// Fetch the pairing QR.
    ///
    /// `Ok(None)` means the QR is not available yet and the caller should try
    /// again later.
    async fn fetch_pairing_artifact(
        &self,
        session: &str,
    ) -> Result<Option<PairingArtifact>, GatewayError>;
}

/// Webhook registered on a session at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_webhook_events")]
    pub events: Vec<String>,
}

impl WebhookConfig {
    /// Webhook for message and session status events.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            events: default_webhook_events(),
        }
    }
}

fn default_webhook_events() -> Vec<String> {
    vec!["message".to_string(), "session.status".to_string()]
}

/// Tenant metadata attached to a session when it is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMetadata {
    pub labels: BTreeMap<String, String>,
    pub webhooks: Vec<WebhookConfig>,
}

impl SessionMetadata {
    /// Labels identifying the tenant that owns `session`.
    pub fn for_tenant(session: &str, contact_email: &str) -> Self {
        let labels = BTreeMap::from([
            ("user.id".to_string(), session.to_string()),
            ("user.email".to_string(), contact_email.to_string()),
            ("clinic".to_string(), session.to_string()),
        ]);
        Self {
            labels,
            webhooks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_webhooks(mut self, webhooks: Vec<WebhookConfig>) -> Self {
        self.webhooks = webhooks;
        self
    }
}
