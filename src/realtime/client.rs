//! Opening the websocket transport.

use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request};

use super::auth::TokenProvider;
use super::connection::{establish, ConnectError, ConnectionHandle, InboundEvent};
use super::protocol::ClientEvent;
use crate::config::BackendConfig;

/// Opens a transport and runs the session handshake.
///
/// The session orchestrator only sees this trait, so tests can swap in an
/// in-memory transport.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and wait for the peer to confirm the session.  `setup` is
    /// sent in order once the peer is ready; inbound frames go to `events`.
    async fn connect(
        &self,
        setup: Vec<ClientEvent>,
        events: mpsc::UnboundedSender<InboundEvent>,
    ) -> Result<ConnectionHandle, ConnectError>;
}

/// Connects to the configured backend over TLS websockets.
pub struct WebSocketConnector {
    backend: BackendConfig,
    tokens: Arc<dyn TokenProvider>,
}

impl WebSocketConnector {
    pub fn new(backend: BackendConfig, tokens: Arc<dyn TokenProvider>) -> Self {
        Self { backend, tokens }
    }

    fn request(&self, token: &str) -> Result<Request<()>, ConnectError> {
        let mut request = self
            .backend
            .endpoint()
            .into_client_request()
            .map_err(|e| ConnectError::Request(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ConnectError::Request(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert("Authorization", bearer);
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));
        Ok(request)
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        setup: Vec<ClientEvent>,
        events: mpsc::UnboundedSender<InboundEvent>,
    ) -> Result<ConnectionHandle, ConnectError> {
        let token = self.tokens.bearer_token().await?;
        let request = self.request(&token)?;

        let limit = self.backend.connect_timeout();
        let (socket, response) = timeout(limit, connect_async(request))
            .await
            .map_err(|_| ConnectError::ConnectTimeout(limit))?
            .map_err(|e| ConnectError::Refused(e.to_string()))?;
        info!(
            "realtime: transport open to {} (HTTP {})",
            self.backend.url,
            response.status().as_u16()
        );

        establish(socket, setup, events, self.backend.handshake_timeout()).await
    }
}
