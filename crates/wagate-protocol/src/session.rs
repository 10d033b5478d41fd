//! Session state as reported by the gateway.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Gateway-reported session state.
///
/// `NotFound` never comes from the gateway itself. It is derived locally from
/// a 404 on the status endpoint and means no session has been created yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    NotFound,
    Starting,
    ScanQrCode,
    Working,
    Stopped,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::Starting => "STARTING",
            Self::ScanQrCode => "SCAN_QR_CODE",
            Self::Working => "WORKING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The WhatsApp account linked to a working session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedIdentity {
    /// Peer id, e.g. `5491122334455@c.us`.
    pub id: String,
    /// Display name of the linked account.
    #[serde(rename = "pushName", default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
}

/// Body of `GET /api/sessions/{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<PairedIdentity>,
}

impl SessionInfo {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: SessionStatus::NotFound,
            me: None,
        }
    }
}

/// QR payload needed to pair a device with a session.
///
/// Only meaningful while the session is in `SCAN_QR_CODE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PairingArtifact {
    /// QR payload string, rendered by the consumer.
    Raw { qr: String },
    /// Pre-rendered QR image.
    Image {
        content_type: String,
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
}

impl PairingArtifact {
    pub fn raw(qr: impl Into<String>) -> Self {
        Self::Raw { qr: qr.into() }
    }

    pub fn image(content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::Image {
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    /// Render as something an `<img src>` or terminal QR renderer can take.
    ///
    /// Raw payloads are returned verbatim; images become a base64 data URL.
    pub fn to_data_url(&self) -> String {
        match self {
            Self::Raw { qr } => qr.clone(),
            Self::Image { content_type, data } => {
                format!("data:{};base64,{}", content_type, STANDARD.encode(data))
            }
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
