#![expect(
    clippy::module_name_repetitions,
    reason = "The transport is named after the library backing it"
)]

//! Default transport backed by `tokio-tungstenite`.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::{self, Instant, Interval};
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};

use super::{ConnectTarget, Engine, EngineHandle, Payload, Transport};
use crate::{Result, error::Error, log};

pub use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const NORMAL_CLOSURE: u16 = 1000;

/// [`Transport`] implementation using `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteTransport {
    config: Option<WebSocketConfig>,
}

impl TungsteniteTransport {
    /// Create a transport, optionally with a custom protocol configuration.
    #[must_use]
    pub fn new(config: Option<WebSocketConfig>) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl Transport for TungsteniteTransport {
    async fn connect(&self, target: &ConnectTarget) -> Result<EngineHandle> {
        let mut request = target.url.as_str().into_client_request()?;
        for (name, value) in &target.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::validation(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::validation(format!("invalid header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (ws_stream, _response) =
            connect_async_with_config(request, self.config, false).await?;

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        let ping_interval = target.ping_interval;

        let task = tokio::spawn(async move {
            run_io(ws_stream, outgoing_rx, events_tx, ping_interval).await;
            _ = done_tx.send(true);
        });

        Ok(EngineHandle {
            engine: Arc::new(TungsteniteEngine {
                outgoing: outgoing_tx,
                done: done_rx,
                io_task: task.abort_handle(),
            }),
            events: events_rx,
        })
    }
}

struct TungsteniteEngine {
    outgoing: mpsc::UnboundedSender<Message>,
    done: watch::Receiver<bool>,
    io_task: AbortHandle,
}

#[async_trait::async_trait]
impl Engine for TungsteniteEngine {
    fn send(&self, payload: Payload) -> Result<()> {
        self.outgoing
            .send(payload.into())
            .map_err(|_| Error::closed())
    }

    async fn close(&self, code: Option<u16>, reason: Option<String>) -> Result<()> {
        let frame = if code.is_none() && reason.is_none() {
            None
        } else {
            Some(CloseFrame {
                code: CloseCode::from(code.unwrap_or(NORMAL_CLOSURE)),
                reason: reason.unwrap_or_default().into(),
            })
        };

        // An error here means the I/O task is already gone; waiting on the
        // done signal below covers both orderings.
        _ = self.outgoing.send(Message::Close(frame));

        let mut done = self.done.clone();
        _ = done.wait_for(|finished| *finished).await;
        Ok(())
    }
}

impl Drop for TungsteniteEngine {
    fn drop(&mut self) {
        self.io_task.abort();
    }
}

impl From<Payload> for Message {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => Self::Text(text.into()),
            Payload::Binary(bytes) => Self::Binary(bytes.into()),
        }
    }
}

/// Pump the socket until it closes: outbound messages from the engine,
/// inbound frames to the supervisor, optional protocol pings.
async fn run_io(
    ws_stream: WsStream,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<Result<Payload>>,
    ping_interval: Option<Duration>,
) {
    let (mut write, mut read) = ws_stream.split();
    let mut ping = ping_interval.map(|every| time::interval_at(Instant::now() + every, every));

    loop {
        tokio::select! {
            message = outgoing.recv() => {
                match message {
                    Some(message) => {
                        if write.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Engine handle dropped without an explicit close.
                        _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(Ok(Payload::Text(text.to_string()))).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if events.send(Ok(Payload::Binary(bytes.to_vec()))).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::emit(&format!("server closed the connection: {frame:?}"));
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/pong frames are handled by tungstenite itself.
                    }
                    Some(Err(e)) => {
                        _ = events.send(Err(e.into()));
                        break;
                    }
                    None => break,
                }
            }

            _ = tick(ping.as_mut()), if ping.is_some() => {
                if write.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => futures::future::pending().await,
    }
}
