//! Gateway error types.

use thiserror::Error;

/// Read a response, turning any non-2xx status into a [`GatewayError`].
pub async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::from_status(status, body))
}

/// Errors that can occur when talking to the WhatsApp gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Request could not complete (DNS, connect, timeout).
    #[error("gateway unreachable: {0}")]
    Network(#[from] reqwest::Error),

    /// Bad or missing API key (401).
    #[error("gateway rejected credentials (status 401): {body}")]
    Unauthorized { body: String },

    /// Endpoint missing or method not allowed (404/405), usually a wrong base URL.
    #[error("gateway endpoint unavailable (status {status}): {body}")]
    Unavailable { status: u16, body: String },

    /// Any other non-2xx response.
    #[error("gateway error (status {status}): {body}")]
    Api { status: u16, body: String },

    /// 2xx response whose body could not be understood.
    #[error("invalid gateway response: {0}")]
    Decode(String),
}

impl GatewayError {
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 => Self::Unauthorized { body },
            404 | 405 => Self::Unavailable { status, body },
            _ => Self::Api { status, body },
        }
    }

    /// HTTP status carried by the error, if the gateway answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Network(e) => e.status().map(|s| s.as_u16()),
            Self::Unauthorized { .. } => Some(401),
            Self::Unavailable { status, .. } | Self::Api { status, .. } => Some(*status),
            Self::Decode(_) => None,
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Unauthorized { .. } | Self::Unavailable { .. } | Self::Decode(_) => false,
        }
    }

    /// Short message suitable for showing to an operator.
    pub fn user_message(&self) -> String {
        match self {
            Self::Network(_) => "Cannot reach the WhatsApp gateway".to_string(),
            Self::Unauthorized { .. } => {
                "WhatsApp gateway rejected the API key, check the gateway credentials".to_string()
            }
            Self::Unavailable { status, .. } => format!(
                "WhatsApp gateway endpoint unavailable (status {}), check the gateway URL",
                status
            ),
            Self::Api { status, body } => format!("Error {}: {}", status, body),
            Self::Decode(reason) => format!("Unexpected gateway response: {}", reason),
        }
    }
}
