//! Session names derived from tenant identity.

use std::fmt;

use thiserror::Error;

/// Who a session belongs to, as known by the surrounding application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantIdentity {
    pub tenant_id: Option<String>,
    pub subscriber: Option<String>,
}

impl TenantIdentity {
    /// The trimmed tenant id, if one is set.
    pub fn id(&self) -> Option<&str> {
        self.tenant_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("tenant has neither a subscriber name nor a tenant id")]
    MissingIdentity,
}

/// Identifies one logical gateway session for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    name: String,
}

impl SessionHandle {
    /// Derive the session name: subscriber name first, tenant id otherwise.
    ///
    /// Both are trimmed; blank values are skipped.
    pub fn for_tenant(tenant: &TenantIdentity) -> Result<Self, HandleError> {
        [tenant.subscriber.as_deref(), tenant.tenant_id.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|candidate| !candidate.is_empty())
            .map(|name| Self {
                name: name.to_string(),
            })
            .ok_or(HandleError::MissingIdentity)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
