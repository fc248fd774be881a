//! Bearer credentials for the websocket handshake: the configured API key,
//! or a short-lived `client_secret` minted per connection.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::BackendConfig;

// ---------------------------------------------------------------------------
// AuthError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no API key configured (set backend.api_key or OPENAI_API_KEY)")]
    MissingKey,

    #[error("token request failed: {0}")]
    Request(String),

    #[error("token request timed out")]
    Timeout,

    #[error("token endpoint returned HTTP {0}")]
    Rejected(u16),

    #[error("failed to parse token response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AuthError::Timeout
        } else {
            AuthError::Request(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// TokenProvider
// ---------------------------------------------------------------------------

/// Supplies the bearer credential for each new connection.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, AuthError>;
}

/// Uses a fixed key for every connection.
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn bearer_token(&self) -> Result<String, AuthError> {
        if self.token.trim().is_empty() {
            return Err(AuthError::MissingKey);
        }
        Ok(self.token.clone())
    }
}

/// POSTs `{model, voice}` to a session-minting endpoint and returns
/// `client_secret.value`.  The long-lived key never reaches the websocket.
pub struct EphemeralTokenProvider {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    voice: String,
}

impl EphemeralTokenProvider {
    pub fn new(url: String, api_key: String, backend: &BackendConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(backend.connect_timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url,
            api_key,
            model: backend.model.clone(),
            voice: backend.voice.clone(),
        }
    }
}

#[async_trait]
impl TokenProvider for EphemeralTokenProvider {
    async fn bearer_token(&self) -> Result<String, AuthError> {
        let body = serde_json::json!({
            "model": self.model,
            "voice": self.voice,
        });
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Rejected(status.as_u16()));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AuthError::Parse(e.to_string()))?;
        client_secret(&json)
    }
}

fn client_secret(json: &serde_json::Value) -> Result<String, AuthError> {
    json["client_secret"]["value"]
        .as_str()
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AuthError::Parse("missing client_secret.value".into()))
}

/// Pick the provider for `backend`: ephemeral when `token_url` is set,
/// otherwise the API key directly.
pub fn provider_from_config(backend: &BackendConfig) -> Result<Arc<dyn TokenProvider>, AuthError> {
    let key = backend
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or(AuthError::MissingKey)?
        .to_string();

    match backend.token_url.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(url) => Ok(Arc::new(EphemeralTokenProvider::new(url.to_string(), key, backend))),
        None => Ok(Arc::new(StaticToken::new(key))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
