use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use url::Url;

use crate::gateway::{DEFAULT_QR_ENDPOINTS, SessionMetadata, WahaClient, WebhookConfig};
use crate::session::{OrchestratorConfig, PollingConfig};

/// Environment variable consulted when no API key is configured.
pub const API_KEY_ENV: &str = "WAGATE_API_KEY";

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Per-tenant gateway overrides, keyed by tenant id.
    #[serde(default)]
    pub tenants: BTreeMap<String, TenantGatewayConfig>,
    #[serde(default)]
    pub polling: PollingSettings,
    #[serde(default)]
    pub session: SessionSettings,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let config: Self = serde_saphyr::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall or crash the background tasks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("polling.tick_interval_ms", self.polling.tick_interval_ms),
            (
                "polling.acquire_max_attempts",
                u64::from(self.polling.acquire_max_attempts),
            ),
            (
                "polling.monitor_max_attempts",
                u64::from(self.polling.monitor_max_attempts),
            ),
            (
                "session.auto_refresh_interval_seconds",
                self.session.auto_refresh_interval_seconds,
            ),
        ];
        match positive.into_iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(ConfigError::InvalidSetting {
                field,
                reason: "must be greater than zero",
            }),
            None => Ok(()),
        }
    }

    /// Gateway settings for a tenant: its override first, then the global
    /// `gateway` section, then `WAGATE_API_KEY` for the key.
    pub fn gateway_for(&self, tenant_id: Option<&str>) -> Result<ResolvedGateway, ConfigError> {
        self.resolve_gateway(tenant_id, std::env::var(API_KEY_ENV).ok())
    }

    fn resolve_gateway(
        &self,
        tenant_id: Option<&str>,
        env_api_key: Option<String>,
    ) -> Result<ResolvedGateway, ConfigError> {
        let tenant = tenant_id.and_then(|id| self.tenants.get(id));

        let base_url = tenant
            .and_then(|t| non_blank(t.base_url.as_deref()))
            .unwrap_or(self.gateway.base_url.as_str());
        let base_url = Url::parse(base_url).map_err(|e| ConfigError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;

        let api_key = tenant
            .and_then(|t| non_blank(t.api_key.as_deref()))
            .or_else(|| non_blank(self.gateway.api_key.as_deref()))
            .map(str::to_string)
            .or_else(|| env_api_key.filter(|key| !key.trim().is_empty()))
            .ok_or(ConfigError::MissingApiKey)?;

        Ok(ResolvedGateway {
            base_url,
            api_key,
            request_timeout: Duration::from_secs(self.gateway.request_timeout_seconds),
            qr_endpoints: self.gateway.qr_endpoints.clone(),
        })
    }

    /// Orchestrator settings for the session named `session`.
    pub fn orchestrator_config(&self, session: &str) -> OrchestratorConfig {
        let webhooks = self
            .session
            .webhooks
            .iter()
            .map(|url| WebhookConfig::new(url.clone()))
            .collect();

        OrchestratorConfig {
            settle_delay: Duration::from_millis(self.session.settle_delay_ms),
            auto_refresh_interval: Duration::from_secs(self.session.auto_refresh_interval_seconds),
            metadata: SessionMetadata::for_tenant(session, &self.session.contact_email)
                .with_webhooks(webhooks),
            polling: self.polling.to_polling_config(),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

// ============================================================================
// GatewayConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// QR endpoint templates tried in order; `{session}` is replaced by the
    /// session name.
    #[serde(default = "default_qr_endpoints")]
    pub qr_endpoints: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            request_timeout_seconds: default_request_timeout(),
            qr_endpoints: default_qr_endpoints(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_qr_endpoints() -> Vec<String> {
    DEFAULT_QR_ENDPOINTS.iter().map(|s| s.to_string()).collect()
}

/// Tenant-specific gateway. Unset fields fall back to the global section.
#[derive(Debug, Default, Deserialize)]
pub struct TenantGatewayConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Gateway settings after tenant and environment resolution.
#[derive(Debug, Clone)]
pub struct ResolvedGateway {
    pub base_url: Url,
    pub api_key: String,
    pub request_timeout: Duration,
    pub qr_endpoints: Vec<String>,
}

impl ResolvedGateway {
    pub fn build_client(&self) -> Result<WahaClient, ConfigError> {
        let client = Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(ConfigError::HttpClient)?;
        Ok(
            WahaClient::new(client, self.base_url.clone(), self.api_key.clone())
                .with_qr_endpoints(self.qr_endpoints.clone()),
        )
    }
}

// ============================================================================
// PollingSettings
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PollingSettings {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_acquire_max_attempts")]
    pub acquire_max_attempts: u32,
    #[serde(default = "default_monitor_max_attempts")]
    pub monitor_max_attempts: u32,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            acquire_max_attempts: default_acquire_max_attempts(),
            monitor_max_attempts: default_monitor_max_attempts(),
        }
    }
}

impl PollingSettings {
    pub fn to_polling_config(&self) -> PollingConfig {
        PollingConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            acquire_max_attempts: self.acquire_max_attempts,
            monitor_max_attempts: self.monitor_max_attempts,
        }
    }
}

fn default_tick_interval() -> u64 {
    3000
}

fn default_acquire_max_attempts() -> u32 {
    50
}

fn default_monitor_max_attempts() -> u32 {
    30
}

// ============================================================================
// SessionSettings
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    #[serde(default)]
    pub auto_refresh: bool,
    #[serde(default = "default_auto_refresh_interval")]
    pub auto_refresh_interval_seconds: u64,
    /// Stored as `user.email` on created sessions.
    #[serde(default = "default_contact_email")]
    pub contact_email: String,
    /// Webhook URLs registered on created sessions.
    #[serde(default)]
    pub webhooks: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay(),
            auto_refresh: false,
            auto_refresh_interval_seconds: default_auto_refresh_interval(),
            contact_email: default_contact_email(),
            webhooks: Vec::new(),
        }
    }
}

fn default_settle_delay() -> u64 {
    2000
}

fn default_auto_refresh_interval() -> u64 {
    180
}

fn default_contact_email() -> String {
    "dashboard@clinica.com".to_string()
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("invalid gateway URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("no gateway API key configured (set gateway.api_key or WAGATE_API_KEY)")]
    MissingApiKey,

    #[error("invalid setting {field}: {reason}")]
    InvalidSetting {
        field: &'static str,
        reason: &'static str,
    },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(reqwest::Error),
}

// ============================================================================
// Tests
// ============================================================================
