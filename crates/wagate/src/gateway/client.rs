//! HTTP client for the WAHA session API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;
use wagate_protocol::{PairingArtifact, SessionInfo};

use super::error::{GatewayError, check_response};
use super::{SessionGateway, SessionMetadata, WebhookConfig};

/// QR endpoint shapes, tried in order.
///
/// Gateway deployments disagree on which of these exists, so all of them are
/// probed until one answers.
pub const DEFAULT_QR_ENDPOINTS: &[&str] = &[
    "/api/sessions/{session}/auth/qr",
    "/api/{session}/auth/qr",
    "/api/sessions/{session}/qr",
    "/api/{session}/qr",
];

const SESSION_PLACEHOLDER: &str = "{session}";

/// WAHA session API client authenticated with a static API key.
pub struct WahaClient {
    client: Client,
    base_url: Url,
    api_key: String,
    qr_endpoints: Vec<String>,
}

impl WahaClient {
    pub const API_KEY_HEADER: &'static str = "X-Api-Key";

    #[must_use]
    pub fn new(client: Client, base_url: Url, api_key: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
            qr_endpoints: DEFAULT_QR_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Replace the ordered list of QR endpoint templates. Templates use
    /// `{session}` as the placeholder; an empty list keeps the defaults.
    #[must_use]
    pub fn with_qr_endpoints(mut self, endpoints: Vec<String>) -> Self {
        if !endpoints.is_empty() {
            self.qr_endpoints = endpoints;
        }
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve an endpoint template against the base URL.
    ///
    /// Each path segment is pushed separately so session names are
    /// percent-encoded.
    fn endpoint(&self, template: &str, session: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            for part in template.split('/').filter(|p| !p.is_empty()) {
                segments.push(&part.replace(SESSION_PLACEHOLDER, session));
            }
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header(Self::API_KEY_HEADER, &self.api_key)
    }

    async fn session_action(&self, session: &str, action: &str) -> Result<(), GatewayError> {
        let url = self.endpoint(&format!("/api/sessions/{{session}}/{}", action), session);
        let response = self.request(Method::POST, url).send().await?;
        check_response(response).await?;
        debug!(session, action, "Gateway accepted session action");
        Ok(())
    }
}

#[async_trait]
impl SessionGateway for WahaClient {
    async fn ping(&self) -> Result<(), GatewayError> {
        let mut url = self.endpoint("/api/sessions", "");
        url.query_pairs_mut().append_pair("all", "false");

        let response = self.request(Method::GET, url).send().await?;
        if let Err(err) = check_response(response).await {
            if matches!(err, GatewayError::Unauthorized { .. }) {
                warn!(base_url = %self.base_url, "Gateway rejected API key");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn get_status(&self, session: &str) -> Result<SessionInfo, GatewayError> {
        let url = self.endpoint("/api/sessions/{session}", session);
        let response = self.request(Method::GET, url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(SessionInfo::not_found(session));
        }
        let response = check_response(response).await?;
        decode_json(response).await
    }

    async fn create_session(
        &self,
        session: &str,
        metadata: &SessionMetadata,
    ) -> Result<SessionInfo, GatewayError> {
        let url = self.endpoint("/api/sessions", session);
        let body = CreateSessionRequest {
            name: session,
            start: true,
            config: CreateSessionConfig {
                metadata: &metadata.labels,
                proxy: None,
                debug: false,
                noweb: NowebConfig {
                    store: NowebStore {
                        enabled: true,
                        full_sync: false,
                    },
                },
                webhooks: &metadata.webhooks,
            },
        };

        let response = self.request(Method::POST, url).json(&body).send().await?;
        let response = match check_response(response).await {
            Ok(r) => r,
            Err(err) => {
                match &err {
                    GatewayError::Unauthorized { .. } => {
                        warn!(session, "Session creation rejected: bad gateway credentials")
                    }
                    GatewayError::Unavailable { status: 405, .. } => {
                        warn!(session, base_url = %self.base_url, "Session creation not allowed: gateway unreachable or misconfigured")
                    }
                    _ => warn!(session, error = %err, "Session creation failed"),
                }
                return Err(err);
            }
        };
        decode_json(response).await
    }

    async fn start_session(&self, session: &str) -> Result<(), GatewayError> {
        self.session_action(session, "start").await
    }

    async fn stop_session(&self, session: &str) -> Result<(), GatewayError> {
        self.session_action(session, "stop").await
    }

    async fn restart_session(&self, session: &str) -> Result<(), GatewayError> {
        self.session_action(session, "restart").await
    }

    async fn delete_session(&self, session: &str) -> Result<(), GatewayError> {
        let url = self.endpoint("/api/sessions/{session}", session);
        let response = self.request(Method::DELETE, url).send().await?;
        check_response(response).await?;
        Ok(())
    }

    async fn fetch_pairing_artifact(
        &self,
        session: &str,
    ) -> Result<Option<PairingArtifact>, GatewayError> {
        let mut last_error = None;

        for template in &self.qr_endpoints {
            let url = self.endpoint(template, session);
            let response = match self
                .request(Method::GET, url)
                .header(ACCEPT, "image/png, application/json")
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    debug!(session, endpoint = %template, error = %e, "QR endpoint unreachable");
                    last_error = Some(GatewayError::Network(e));
                    continue;
                }
            };

            if response.status() == StatusCode::NOT_FOUND {
                debug!(session, endpoint = %template, "QR not available at endpoint");
                continue;
            }

            let result = match check_response(response).await {
                Ok(r) => decode_artifact(r).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(Some(artifact)) => {
                    debug!(session, endpoint = %template, "QR obtained");
                    return Ok(Some(artifact));
                }
                Ok(None) => {
                    debug!(session, endpoint = %template, "QR empty, not ready yet");
                }
                Err(e) => {
                    debug!(session, endpoint = %template, error = %e, "QR endpoint failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }
}

async fn decode_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, GatewayError> {
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| GatewayError::Decode(e.to_string()))
}

/// Decode a QR response: either an image body or one of the JSON shapes.
async fn decode_artifact(
    response: reqwest::Response,
) -> Result<Option<PairingArtifact>, GatewayError> {
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase());

    if let Some(content_type) = content_type
        && content_type.starts_with("image/")
    {
        let data = response.bytes().await?;
        if data.is_empty() {
            return Ok(None);
        }
        return Ok(Some(PairingArtifact::image(content_type, data)));
    }

    let body: QrBody = decode_json(response).await?;
    body.into_artifact()
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(serde::Serialize)]
struct CreateSessionRequest<'a> {
    name: &'a str,
    start: bool,
    config: CreateSessionConfig<'a>,
}

#[derive(serde::Serialize)]
struct CreateSessionConfig<'a> {
    metadata: &'a BTreeMap<String, String>,
    proxy: Option<String>,
    debug: bool,
    noweb: NowebConfig,
    webhooks: &'a [WebhookConfig],
}

#[derive(serde::Serialize)]
struct NowebConfig {
    store: NowebStore,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct NowebStore {
    enabled: bool,
    full_sync: bool,
}

/// JSON QR body. Raw payloads come as `qr` (or `value`), rendered images as
/// `mimetype` + base64 `data`.
#[derive(serde::Deserialize)]
struct QrBody {
    #[serde(default, alias = "value")]
    qr: Option<String>,
    #[serde(default)]
    mimetype: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

impl QrBody {
    fn into_artifact(self) -> Result<Option<PairingArtifact>, GatewayError> {
        if let Some(qr) = self.qr
            && !qr.trim().is_empty()
        {
            return Ok(Some(PairingArtifact::raw(qr)));
        }
        if let (Some(mimetype), Some(data)) = (self.mimetype, self.data)
            && !data.is_empty()
        {
            let bytes = STANDARD
                .decode(data.as_bytes())
                .map_err(|e| GatewayError::Decode(format!("invalid QR image data: {}", e)))?;
            return Ok(Some(PairingArtifact::image(mimetype, bytes)));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus, header};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use wagate_protocol::SessionStatus;

    use super::*;

    const API_KEY: &str = "test-key";
    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a];

    #[derive(Clone, Default)]
    struct Recorded {
        created: Arc<Mutex<Vec<Value>>>,
        actions: Arc<Mutex<Vec<String>>>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("x-api-key").and_then(|v| v.to_str().ok()) == Some(API_KEY)
    }

    async fn list_sessions(
        headers: HeaderMap,
        Query(query): Query<std::collections::HashMap<String, String>>,
    ) -> Response {
        if !authorized(&headers) {
            return (AxumStatus::UNAUTHORIZED, "Unauthorized").into_response();
        }
        assert_eq!(query.get("all").map(String::as_str), Some("false"));
        Json(json!([])).into_response()
    }

    async fn session_status(headers: HeaderMap, Path(name): Path<String>) -> Response {
        if !authorized(&headers) {
            return (AxumStatus::UNAUTHORIZED, "Unauthorized").into_response();
        }
        match name.as_str() {
            "missing" => AxumStatus::NOT_FOUND.into_response(),
            "broken" => (AxumStatus::INTERNAL_SERVER_ERROR, "engine crashed").into_response(),
            "garbled" => (AxumStatus::OK, "not json").into_response(),
            _ => Json(json!({
                "name": name,
                "status": "WORKING",
                "me": {"id": "5491122334455@c.us", "pushName": "Clinica Norte"}
            }))
            .into_response(),
        }
    }

    async fn create_session(
        State(recorded): State<Recorded>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Response {
        if !authorized(&headers) {
            return (AxumStatus::UNAUTHORIZED, "Unauthorized").into_response();
        }
        let name = body["name"].clone();
        recorded.created.lock().unwrap().push(body);
        (
            AxumStatus::CREATED,
            Json(json!({"name": name, "status": "STARTING"})),
        )
            .into_response()
    }

    fn record_action(recorded: &Recorded, action: &str, name: &str) -> Response {
        if name == "missing" {
            return (AxumStatus::NOT_FOUND, "Session not found").into_response();
        }
        recorded
            .actions
            .lock()
            .unwrap()
            .push(format!("{}:{}", action, name));
        (AxumStatus::CREATED, Json(json!({}))).into_response()
    }

    async fn start(State(r): State<Recorded>, Path(name): Path<String>) -> Response {
        record_action(&r, "start", &name)
    }

    async fn stop(State(r): State<Recorded>, Path(name): Path<String>) -> Response {
        record_action(&r, "stop", &name)
    }

    async fn restart(State(r): State<Recorded>, Path(name): Path<String>) -> Response {
        record_action(&r, "restart", &name)
    }

    async fn delete(State(r): State<Recorded>, Path(name): Path<String>) -> Response {
        record_action(&r, "delete", &name)
    }

    async fn sessions_auth_qr(Path(name): Path<String>) -> Response {
        match name.as_str() {
            "png" => ([(header::CONTENT_TYPE, "image/png")], PNG).into_response(),
            "encoded" => Json(json!({"mimetype": "image/png", "data": "AQID"})).into_response(),
            _ => AxumStatus::NOT_FOUND.into_response(),
        }
    }

    async fn legacy_auth_qr(Path(name): Path<String>) -> Response {
        match name.as_str() {
            "legacy" => Json(json!({"qr": "2@legacy,qr=="})).into_response(),
            "blank" => Json(json!({"qr": ""})).into_response(),
            _ => AxumStatus::NOT_FOUND.into_response(),
        }
    }

    async fn sessions_qr(Path(name): Path<String>) -> Response {
        match name.as_str() {
            "flaky" => (AxumStatus::INTERNAL_SERVER_ERROR, "boom").into_response(),
            _ => AxumStatus::NOT_FOUND.into_response(),
        }
    }

    async fn legacy_qr() -> Response {
        AxumStatus::NOT_FOUND.into_response()
    }

    async fn spawn_gateway() -> (Url, Recorded) {
        let recorded = Recorded::default();
        let app = Router::new()
            .route("/api/sessions", get(list_sessions).post(create_session))
            .route("/api/sessions/{name}", get(session_status).delete(delete))
            .route("/api/sessions/{name}/start", post(start))
            .route("/api/sessions/{name}/stop", post(stop))
            .route("/api/sessions/{name}/restart", post(restart))
            .route("/api/sessions/{name}/auth/qr", get(sessions_auth_qr))
            .route("/api/sessions/{name}/qr", get(sessions_qr))
            .route("/api/{name}/auth/qr", get(legacy_auth_qr))
            .route("/api/{name}/qr", get(legacy_qr))
            .with_state(recorded.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (Url::parse(&format!("http://{}", addr)).unwrap(), recorded)
    }

    fn client(base_url: Url) -> WahaClient {
        WahaClient::new(Client::new(), base_url, API_KEY.to_string())
    }

    #[test]
    fn endpoint_keeps_base_path_and_encodes_session() {
        let client = client(Url::parse("http://gateway.local:3000/waha/").unwrap());
        let url = client.endpoint("/api/sessions/{session}/auth/qr", "clinica norte");
        assert_eq!(
            url.as_str(),
            "http://gateway.local:3000/waha/api/sessions/clinica%20norte/auth/qr"
        );
    }

    #[tokio::test]
    async fn get_status_parses_working_session() {
        let (base, _) = spawn_gateway().await;
        let info = client(base).get_status("clinica-norte").await.unwrap();
        assert_eq!(info.name, "clinica-norte");
        assert_eq!(info.status, SessionStatus::Working);
        assert_eq!(info.me.unwrap().id, "5491122334455@c.us");
    }

    #[tokio::test]
    async fn get_status_maps_404_to_not_found() {
        let (base, _) = spawn_gateway().await;
        let info = client(base).get_status("missing").await.unwrap();
        assert_eq!(info.status, SessionStatus::NotFound);
        assert_eq!(info.name, "missing");
    }

    #[tokio::test]
    async fn get_status_surfaces_server_error_body() {
        let (base, _) = spawn_gateway().await;
        let err = client(base).get_status("broken").await.unwrap_err();
        match err {
            GatewayError::Api { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "engine crashed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_status_rejects_garbled_body() {
        let (base, _) = spawn_gateway().await;
        let err = client(base).get_status("garbled").await.unwrap_err();
        assert!(matches!(err, GatewayError::Decode(_)));
    }

    #[tokio::test]
    async fn session_names_round_trip_through_encoding() {
        let (base, _) = spawn_gateway().await;
        let info = client(base).get_status("clinica norte").await.unwrap();
        assert_eq!(info.name, "clinica norte");
    }

    #[tokio::test]
    async fn wrong_api_key_is_unauthorized() {
        let (base, _) = spawn_gateway().await;
        let client = WahaClient::new(Client::new(), base, "wrong".to_string());

        let err = client.get_status("clinica-norte").await.unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized { .. }));
        assert!(matches!(
            client.ping().await.unwrap_err(),
            GatewayError::Unauthorized { .. }
        ));
    }

    #[tokio::test]
    async fn ping_lists_sessions() {
        let (base, _) = spawn_gateway().await;
        client(base).ping().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_gateway_is_a_transient_network_error() {
        let client = client(Url::parse("http://127.0.0.1:1").unwrap());
        let err = client.get_status("clinica-norte").await.unwrap_err();
        assert!(matches!(err, GatewayError::Network(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn create_session_sends_start_and_metadata() {
        let (base, recorded) = spawn_gateway().await;
        let metadata = SessionMetadata::for_tenant("clinica-norte", "ops@clinica.com")
            .with_webhooks(vec![WebhookConfig {
                url: "https://n8n.local/webhook/whatsapp".to_string(),
                events: vec!["message".to_string()],
            }]);

        let info = client(base)
            .create_session("clinica-norte", &metadata)
            .await
            .unwrap();
        assert_eq!(info.status, SessionStatus::Starting);

        let created = recorded.created.lock().unwrap();
        let body = &created[0];
        assert_eq!(body["name"], "clinica-norte");
        assert_eq!(body["start"], true);
        assert_eq!(body["config"]["metadata"]["user.id"], "clinica-norte");
        assert_eq!(body["config"]["metadata"]["user.email"], "ops@clinica.com");
        assert!(body["config"]["proxy"].is_null());
        assert_eq!(body["config"]["noweb"]["store"]["fullSync"], false);
        assert_eq!(
            body["config"]["webhooks"][0]["url"],
            "https://n8n.local/webhook/whatsapp"
        );
    }

    #[tokio::test]
    async fn lifecycle_actions_hit_session_endpoints() {
        let (base, recorded) = spawn_gateway().await;
        let client = client(base);

        client.start_session("clinica-norte").await.unwrap();
        client.stop_session("clinica-norte").await.unwrap();
        client.restart_session("clinica-norte").await.unwrap();
        client.delete_session("clinica-norte").await.unwrap();

        assert_eq!(
            *recorded.actions.lock().unwrap(),
            vec![
                "start:clinica-norte",
                "stop:clinica-norte",
                "restart:clinica-norte",
                "delete:clinica-norte",
            ]
        );
    }

    #[tokio::test]
    async fn action_on_missing_session_surfaces_status_and_body() {
        let (base, _) = spawn_gateway().await;
        let err = client(base).stop_session("missing").await.unwrap_err();
        match err {
            GatewayError::Unavailable { status, body } => {
                assert_eq!(status, 404);
                assert_eq!(body, "Session not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_png_artifact() {
        let (base, _) = spawn_gateway().await;
        let artifact = client(base)
            .fetch_pairing_artifact("png")
            .await
            .unwrap()
            .unwrap();
        match artifact {
            PairingArtifact::Image { content_type, data } => {
                assert_eq!(content_type, "image/png");
                assert_eq!(&data[..], PNG);
            }
            other => panic!("expected image, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_base64_image_artifact() {
        let (base, _) = spawn_gateway().await;
        let artifact = client(base)
            .fetch_pairing_artifact("encoded")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(artifact, PairingArtifact::image("image/png", vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn fetch_artifact_falls_back_to_later_endpoints() {
        let (base, _) = spawn_gateway().await;
        let artifact = client(base).fetch_pairing_artifact("legacy").await.unwrap();
        assert_eq!(artifact, Some(PairingArtifact::raw("2@legacy,qr==")));
    }

    #[tokio::test]
    async fn fetch_artifact_not_yet_available() {
        let (base, _) = spawn_gateway().await;
        let client = client(base);
        assert_eq!(client.fetch_pairing_artifact("pending").await.unwrap(), None);
        assert_eq!(client.fetch_pairing_artifact("blank").await.unwrap(), None);
    }

    #[tokio::test]
    async fn fetch_artifact_reports_hard_failure() {
        let (base, _) = spawn_gateway().await;
        let err = client(base)
            .fetch_pairing_artifact("flaky")
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
    }

    #[tokio::test]
    async fn custom_qr_endpoints_replace_defaults() {
        let (base, _) = spawn_gateway().await;
        let client = client(base).with_qr_endpoints(vec!["/api/{session}/auth/qr".to_string()]);
        assert_eq!(client.fetch_pairing_artifact("png").await.unwrap(), None);
        assert!(client.fetch_pairing_artifact("legacy").await.unwrap().is_some());
    }
}
