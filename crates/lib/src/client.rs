//! HTTP client for the agent server's request/response API.
//!
//! Used to seed the cache before (or while) the event stream patches it:
//! `GET /session` for the session list and `GET /session/{id}/message` for one
//! session's messages.

use std::time::Duration;

use crate::config::ServerConfig;
use crate::event::{SessionInfo, SessionMessage};
use crate::store::QueryCache;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:56050";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the server HTTP API.
#[derive(Clone)]
pub struct ServerClient {
    base_url: String,
    directory: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("server request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server api error: {0}")]
    Api(String),
}

impl ServerClient {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            directory: None,
            client: reqwest::Client::new(),
        }
    }

    /// Build from config, with the configured request timeout and directory scope.
    pub fn from_config(base_url: &str, config: &ServerConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            directory: config.directory.clone(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of the server-sent event stream.
    pub fn event_endpoint(&self) -> String {
        format!("{}/event", self.base_url)
    }

    /// GET /session: all sessions, as the server orders them.
    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ClientError> {
        self.get_json(&format!("{}/session", self.base_url)).await
    }

    /// GET /session/{id}/message: one session's messages with their parts.
    pub async fn session_messages(
        &self,
        session_id: &str,
    ) -> Result<Vec<SessionMessage>, ClientError> {
        self.get_json(&format!("{}/session/{}/message", self.base_url, session_id))
            .await
    }

    /// Fetch the session list into `cache`. Returns the number of sessions.
    pub async fn seed_sessions(&self, cache: &QueryCache) -> Result<usize, ClientError> {
        let sessions = self.list_sessions().await?;
        let n = sessions.len();
        cache.set_sessions(sessions).await;
        log::debug!("seeded {} session(s)", n);
        Ok(n)
    }

    /// Fetch one session's messages into `cache`. Returns the number of messages.
    pub async fn seed_messages(
        &self,
        cache: &QueryCache,
        session_id: &str,
    ) -> Result<usize, ClientError> {
        let messages = self.session_messages(session_id).await?;
        let n = messages.len();
        cache.set_messages(session_id, messages).await;
        log::debug!("seeded {} message(s) for session {}", n, session_id);
        Ok(n)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, ClientError> {
        let mut req = self.client.get(url);
        if let Some(dir) = &self.directory {
            req = req.query(&[("directory", dir)]);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ClientError::Api(format!("{} {}", status, body)));
        }
        Ok(res.json().await?)
    }
}
