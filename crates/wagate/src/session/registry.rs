//! One orchestrator per tenant session.
//!
//! The registry is the surrounding application's entry point: it derives the
//! session name from the tenant identity, builds the tenant's gateway client
//! on first use and hands out the same orchestrator on every later open.
//! A tenant is bound to one session name until that session is closed, and
//! a name is never shared between tenants. A tenant without an id is known
//! by its session name. All sessions report into one notice stream.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wagate_protocol::SessionNotice;

use super::events::EventSink;
use super::handle::{HandleError, SessionHandle, TenantIdentity};
use super::orchestrator::{OrchestratorConfig, SessionOrchestrator};
use crate::config::{Config, ConfigError};
use crate::gateway::SessionGateway;

type GatewayFactory =
    Box<dyn Fn(&TenantIdentity) -> Result<Arc<dyn SessionGateway>, ConfigError> + Send + Sync>;
type SettingsFactory = Box<dyn Fn(&str) -> OrchestratorConfig + Send + Sync>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("tenant {tenant} already has session {current}; close it before opening {requested}")]
    TenantRebound {
        tenant: String,
        current: String,
        requested: String,
    },

    #[error("session {session} belongs to another tenant")]
    NameTaken { session: String },
}

pub struct SessionRegistry {
    gateways: GatewayFactory,
    settings: SettingsFactory,
    auto_refresh: bool,
    /// Tenant key to its orchestrator.
    sessions: DashMap<String, Arc<SessionOrchestrator>>,
    /// Session name to the tenant key that owns it.
    names: DashMap<String, String>,
    events: mpsc::UnboundedSender<SessionNotice>,
}

impl SessionRegistry {
    /// Build a registry from explicit factories.
    ///
    /// `gateways` builds the gateway for a tenant the first time it is
    /// opened; `settings` yields the orchestrator settings for a session name.
    pub fn new(
        gateways: impl Fn(&TenantIdentity) -> Result<Arc<dyn SessionGateway>, ConfigError>
        + Send
        + Sync
        + 'static,
        settings: impl Fn(&str) -> OrchestratorConfig + Send + Sync + 'static,
        auto_refresh: bool,
    ) -> (Self, mpsc::UnboundedReceiver<SessionNotice>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Self {
            gateways: Box::new(gateways),
            settings: Box::new(settings),
            auto_refresh,
            sessions: DashMap::new(),
            names: DashMap::new(),
            events,
        };
        (registry, rx)
    }

    /// Registry backed by WAHA clients resolved from `config`.
    pub fn from_config(config: Config) -> (Self, mpsc::UnboundedReceiver<SessionNotice>) {
        let auto_refresh = config.session.auto_refresh;
        let config = Arc::new(config);
        let gateway_config = config.clone();

        Self::new(
            move |tenant| {
                let client = gateway_config.gateway_for(tenant.id())?.build_client()?;
                debug!(base_url = %client.base_url(), "Built gateway client");
                let client: Arc<dyn SessionGateway> = Arc::new(client);
                Ok(client)
            },
            move |session| config.orchestrator_config(session),
            auto_refresh,
        )
    }

    /// Get the tenant's orchestrator, creating it on first use.
    ///
    /// Fails if the tenant already has a session under another name, or if
    /// the name belongs to another tenant. Must be called inside a Tokio
    /// runtime when auto-refresh is enabled.
    pub fn open(&self, tenant: &TenantIdentity) -> Result<Arc<SessionOrchestrator>, RegistryError> {
        let handle = SessionHandle::for_tenant(tenant)?;
        let key = tenant.id().unwrap_or(handle.name()).to_string();

        if let Some(existing) = self.sessions.get(&key) {
            return Self::same_session(&key, existing.value(), &handle);
        }

        let reserved = match self.names.entry(handle.name().to_string()) {
            Entry::Occupied(owner) if owner.get() != &key => {
                return Err(RegistryError::NameTaken {
                    session: handle.name().to_string(),
                });
            }
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(key.clone());
                true
            }
        };

        let gateway = match (self.gateways)(tenant) {
            Ok(gateway) => gateway,
            Err(e) => {
                if reserved {
                    self.names.remove(handle.name());
                }
                return Err(e.into());
            }
        };

        let orchestrator = match self.sessions.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let existing = Arc::clone(entry.get());
                drop(entry);
                let result = Self::same_session(&key, &existing, &handle);
                if result.is_err() && reserved {
                    self.names.remove(handle.name());
                }
                return result;
            }
            Entry::Vacant(entry) => {
                let settings = (self.settings)(handle.name());
                let events = EventSink::new(handle.name(), self.events.clone());
                let orchestrator =
                    Arc::new(SessionOrchestrator::new(handle, gateway, events, settings));
                entry.insert(orchestrator.clone());
                orchestrator
            }
        };

        if self.auto_refresh {
            orchestrator.set_auto_refresh(true);
        }
        info!(session = %orchestrator.session(), tenant = %key, "Session opened");
        Ok(orchestrator)
    }

    fn same_session(
        key: &str,
        existing: &Arc<SessionOrchestrator>,
        handle: &SessionHandle,
    ) -> Result<Arc<SessionOrchestrator>, RegistryError> {
        if existing.session() == handle.name() {
            return Ok(Arc::clone(existing));
        }
        warn!(tenant = %key, current = %existing.session(), requested = %handle, "Tenant already bound to a session");
        Err(RegistryError::TenantRebound {
            tenant: key.to_string(),
            current: existing.session().to_string(),
            requested: handle.name().to_string(),
        })
    }

    pub fn get(&self, session: &str) -> Option<Arc<SessionOrchestrator>> {
        let key = self.names.get(session)?.value().clone();
        self.sessions.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a session and stop its background work. Returns whether it was
    /// open. The tenant may then open a session under a new name.
    pub async fn close(&self, session: &str) -> bool {
        let Some((_, key)) = self.names.remove(session) else {
            return false;
        };
        let Some((_, orchestrator)) = self
            .sessions
            .remove_if(&key, |_, orchestrator| orchestrator.session() == session)
        else {
            return false;
        };
        orchestrator.shutdown().await;
        info!(session, tenant = %key, "Session closed");
        true
    }

    pub async fn close_all(&self) {
        for name in self.sessions() {
            self.close(&name).await;
        }
    }

    pub fn sessions(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sessions
            .iter()
            .map(|e| e.value().session().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
