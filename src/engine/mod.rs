#![expect(
    clippy::module_name_repetitions,
    reason = "Engine types expose their domain in the name for clarity"
)]

//! Transport abstraction.
//!
//! An [`Engine`] is one WebSocket connection's worth of I/O: it is opened by
//! a [`Transport`], delivers inbound messages through a channel pulled by the
//! supervisor, and accepts outbound messages as a synchronous enqueue. The
//! supervisor treats engines as opaque and performs no reconnection inside
//! them; a dead engine is simply dropped and replaced.
//!
//! [`TungsteniteTransport`] is the provided implementation. Custom transports
//! implement [`Transport`] and are installed through
//! [`Config::transport`](crate::Config).

pub mod tungstenite;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::Result;

pub use tungstenite::TungsteniteTransport;

/// A single message at the connection boundary.
///
/// Only text and binary payloads exist; WebSocket control frames never
/// surface here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// UTF-8 text message
    Text(String),
    /// Raw byte message
    Binary(Vec<u8>),
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self::Binary(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

/// Where and how a transport should connect.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    /// Server URL (`ws` or `wss` scheme)
    pub url: Url,
    /// Opaque headers added to the handshake request
    pub headers: HashMap<String, String>,
    /// Interval for transport-level ping frames, if any
    pub ping_interval: Option<Duration>,
}

/// One live connection handed from a [`Transport`] to the supervisor.
pub struct EngineHandle {
    /// Send/close half of the connection
    pub engine: Arc<dyn Engine>,
    /// Inbound message stream. An `Err` item reports a stream error; channel
    /// closure is normal completion. The stream is finite either way.
    pub events: mpsc::UnboundedReceiver<Result<Payload>>,
}

/// Opens one connection per call, completing only after handshake success.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Perform the handshake and return the live connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails for any reason.
    async fn connect(&self, target: &ConnectTarget) -> Result<EngineHandle>;
}

/// Send/close operations on one live connection.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Enqueue a message for delivery. Returns synchronously; transport
    /// failures surface through the event stream's error path.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is already torn down.
    fn send(&self, payload: Payload) -> Result<()>;

    /// Request orderly shutdown and wait for teardown. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake could not be initiated.
    async fn close(&self, code: Option<u16>, reason: Option<String>) -> Result<()>;
}
