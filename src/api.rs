use crate::config::CallSettings;
use crate::error::{CallError, IntoCallError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Response of `POST /v1/call/start`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(default)]
    pub voice_id: Option<String>,
    #[serde(default)]
    pub persona: Option<String>,
    #[serde(default)]
    pub websocket_url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    #[serde(default)]
    pub timestamp: String,
}

/// Response of `GET /v1/call/{session_id}/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub status: String,
    #[serde(default)]
    pub persona: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub conversation: Vec<ConversationEntry>,
}

/// Session lifecycle calls the call engine makes around the WebSocket
///
/// The engine calls `start_session` once before connecting and `end_session`
/// and `log_usage` once each when the call ends.
#[async_trait]
pub trait CallBackend: Send + Sync {
    async fn start_session(&self, character_id: Option<&str>) -> Result<SessionInfo, CallError>;

    async fn end_session(&self, session_id: &str) -> Result<(), CallError>;

    async fn log_usage(&self, character_id: &str, duration_seconds: u64) -> Result<(), CallError>;

    async fn session_status(&self, session_id: &str) -> Result<SessionStatus, CallError>;
}

/// REST client for the call backend
pub struct HttpCallBackend {
    client: Client,
    base_url: Url,
    api_token: Option<String>,
}

impl HttpCallBackend {
    pub fn new(api_base_url: &str, api_token: Option<String>) -> Result<Self, CallError> {
        if !api_base_url.starts_with("http://") && !api_base_url.starts_with("https://") {
            return Err(CallError::Config(format!(
                "Invalid API Base URL: '{}'. Must start with http:// or https://",
                api_base_url
            )));
        }

        let base_url = Url::parse(api_base_url)
            .map_call_err(|e| CallError::Config(format!("Invalid API Base URL '{}': {}", api_base_url, e)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_call_err(|e| CallError::Api(format!("Failed to create HTTP client: {}", e)))?;

        log::info!("Call backend: {} (token {})", base_url, if api_token.is_some() { "provided" } else { "not provided" });

        Ok(Self {
            client,
            base_url,
            api_token,
        })
    }

    pub fn from_settings(settings: &CallSettings) -> Result<Self, CallError> {
        Self::new(&settings.api_base_url, settings.api_token.clone())
    }

    /// Shared client, also used to fetch AI audio by URL
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Build `{base}/{segments...}`, keeping any path prefix of the base URL
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, CallError> {
        let mut url = self.base_url.clone();
        url.set_query(None);
        url.path_segments_mut()
            .map_err(|_| CallError::Config(format!("{} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post(&self, url: Url) -> Result<reqwest::Response, CallError> {
        log::debug!("POST {}", url);
        let mut request = self.client.post(url.clone());
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        check_status(&url, response).await
    }
}

async fn check_status(url: &Url, response: reqwest::Response) -> Result<reqwest::Response, CallError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CallError::Api(format!("{} returned HTTP {}: {}", url.path(), status, body)))
}

#[async_trait]
impl CallBackend for HttpCallBackend {
    async fn start_session(&self, character_id: Option<&str>) -> Result<SessionInfo, CallError> {
        let mut url = self.endpoint(&["v1", "call", "start"])?;
        if let Some(id) = character_id {
            url.query_pairs_mut().append_pair("character_id", id);
        }

        let info: SessionInfo = self.post(url).await?.json().await?;
        log::info!("✓ Call session started: {}", info.session_id);
        Ok(info)
    }

    async fn end_session(&self, session_id: &str) -> Result<(), CallError> {
        let url = self.endpoint(&["v1", "call", session_id, "end"])?;
        self.post(url).await?;
        log::info!("Call session {} ended on backend", session_id);
        Ok(())
    }

    async fn log_usage(&self, character_id: &str, duration_seconds: u64) -> Result<(), CallError> {
        let mut url = self.endpoint(&["v1", "character", "characters", character_id, "usage"])?;
        url.query_pairs_mut()
            .append_pair("call_duration", &duration_seconds.to_string());
        self.post(url).await?;
        log::info!("Logged {}s of call usage for character {}", duration_seconds, character_id);
        Ok(())
    }

    async fn session_status(&self, session_id: &str) -> Result<SessionStatus, CallError> {
        let url = self.endpoint(&["v1", "call", session_id, "status"])?;
        log::debug!("GET {}", url);
        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        let response = check_status(&url, request.send().await?).await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHttpServer;

    #[test]
    fn test_rejects_non_http_base_url() {
        assert!(matches!(
            HttpCallBackend::new("ws://localhost:8000", None),
            Err(CallError::Config(_))
        ));
    }

    #[test]
    fn test_endpoints_keep_base_path() {
        let backend = HttpCallBackend::new("https://api.example.com/prefix/", None).unwrap();
        assert_eq!(
            backend.endpoint(&["v1", "call", "abc", "end"]).unwrap().as_str(),
            "https://api.example.com/prefix/v1/call/abc/end"
        );

        let backend = HttpCallBackend::new("http://localhost:8000", None).unwrap();
        assert_eq!(
            backend.endpoint(&["v1", "call", "start"]).unwrap().as_str(),
            "http://localhost:8000/v1/call/start"
        );
    }

    #[tokio::test]
    async fn test_start_session_sends_character_and_token() {
        let server = MockHttpServer::respond_once(
            200,
            r#"{"session_id":"s-1","voice_id":"v-9","persona":"friendly","websocket_url":"/v1/call/ws/call/s-1","status":"active"}"#,
        )
        .await;
        let backend = HttpCallBackend::new(&server.origin(), Some("secret".into())).unwrap();

        let info = backend.start_session(Some("char-7")).await.unwrap();
        assert_eq!(info.session_id, "s-1");
        assert_eq!(info.voice_id.as_deref(), Some("v-9"));

        let request = server.request().await;
        assert_eq!(request.method, "POST");
        assert_eq!(request.url, "/v1/call/start?character_id=char-7");
        assert_eq!(request.header("authorization"), Some("Bearer secret"));
    }

    #[tokio::test]
    async fn test_session_status_parses_conversation() {
        let server = MockHttpServer::respond_once(
            200,
            r#"{"session_id":"s-1","status":"active","conversation":[{"type":"user","content":"hi","timestamp":"t0"},{"type":"ai","content":"hello"}]}"#,
        )
        .await;
        let backend = HttpCallBackend::new(&server.origin(), None).unwrap();

        let status = backend.session_status("s-1").await.unwrap();
        assert_eq!(status.status, "active");
        assert_eq!(status.conversation.len(), 2);
        assert_eq!(status.conversation[1].kind, "ai");
        assert_eq!(status.conversation[1].timestamp, "");

        let request = server.request().await;
        assert_eq!(request.method, "GET");
        assert_eq!(request.url, "/v1/call/s-1/status");
        assert_eq!(request.header("Authorization"), None);
    }

    #[tokio::test]
    async fn test_usage_logging_path_and_error_status() {
        let server = MockHttpServer::respond_once(500, "boom").await;
        let backend = HttpCallBackend::new(&server.origin(), None).unwrap();

        let err = backend.log_usage("char-7", 95).await.unwrap_err();
        assert!(matches!(err, CallError::Api(ref m) if m.contains("500")), "{:?}", err);

        let request = server.request().await;
        assert_eq!(request.method, "POST");
        assert_eq!(request.url, "/v1/character/characters/char-7/usage?call_duration=95");
    }
}
