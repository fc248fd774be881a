//! Realtime backend connection: wire protocol, credentials and the duplex
//! websocket.

pub mod auth;
pub mod client;
pub mod connection;
pub mod protocol;

#[cfg(test)]
pub mod testing;

pub use auth::{provider_from_config, AuthError, EphemeralTokenProvider, StaticToken, TokenProvider};
pub use client::{Connector, WebSocketConnector};
pub use connection::{
    ConnectError, ConnectionHandle, InboundEvent, Lifecycle, TranscriptSource,
};
pub use protocol::{ClientEvent, PeerError, ProtocolError, ServerEvent};
