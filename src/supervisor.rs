#![expect(
    clippy::module_name_repetitions,
    reason = "The supervisor type is the module's namesake"
)]

//! Connection supervision.
//!
//! The [`Supervisor`] owns at most one live [`Engine`](crate::engine::Engine)
//! and keeps the logical connection alive across physical disconnections:
//! unexpected losses schedule a reconnect through the configured backoff
//! strategy, heartbeat probes detect silently dead sockets, and the reported
//! [`ConnectionState`] always reflects the socket underneath.
//!
//! All mutable state lives behind one mutex whose critical sections never
//! span an `await`; timer firings, stream callbacks, and public methods all
//! serialize on it. Spawned tasks hold a weak back-reference plus the engine
//! generation they belong to, and no-op when either is stale.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::{sleep, timeout};

use crate::backoff::BackoffStrategy;
use crate::config::Config;
use crate::engine::tungstenite::TungsteniteTransport;
use crate::engine::{ConnectTarget, Engine, EngineHandle, Payload, Transport};
use crate::heartbeat::HeartbeatConfig;
use crate::{Result, error::Error, log};

/// How long a not-yet-connected `send` waits for the connection to come up.
const SEND_WAIT: Duration = Duration::from_secs(5);

/// How long an orderly engine close may take before it is abandoned.
const CLOSE_WAIT: Duration = Duration::from_secs(5);

/// Broadcast capacity for inbound messages.
const INBOUND_CAPACITY: usize = 1024;

/// Broadcast capacity for state changes.
const STATE_CAPACITY: usize = 64;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Connected,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Supervised WebSocket connection.
///
/// Cloning is cheap and every clone drives the same connection.
///
/// # Examples
///
/// ```rust, no_run
/// use okws::{Config, ConnectionState, Supervisor};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let supervisor = Supervisor::new("wss://example.com/socket", Config::default())?;
///
///     let mut states = supervisor.on_state_change();
///     let mut messages = supervisor.on_receive();
///
///     supervisor.connect().await;
///     assert_eq!(supervisor.state(), ConnectionState::Connected);
///
///     supervisor.send("hello").await;
///     while let Ok(message) = messages.recv().await {
///         println!("received: {message:?}");
///     }
///
///     supervisor.dispose();
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

struct Shared {
    target: ConnectTarget,
    transport: Arc<dyn Transport>,
    heartbeat: Option<HeartbeatConfig>,
    /// Current state; synchronous reads plus the race-free wait used by
    /// buffered sends.
    state_tx: watch::Sender<ConnectionState>,
    core: Mutex<Core>,
}

struct Core {
    engine: Option<Arc<dyn Engine>>,
    /// Task pumping the live engine's event stream
    reader: Option<AbortHandle>,
    /// Set by `disconnect`/`dispose`; suppresses reconnection
    expected_disconnect: bool,
    /// Guard preventing concurrent reconnect scheduling
    reconnecting: bool,
    /// Consecutive failed attempts since the last successful connection
    attempt: u32,
    /// Incremented per installed engine; stale callbacks compare against it
    epoch: u64,
    backoff: Box<dyn BackoffStrategy>,
    reconnect_timer: Option<AbortHandle>,
    heartbeat_tick: Option<AbortHandle>,
    /// Armed only between sending a probe and classifying its response
    heartbeat_timeout: Option<AbortHandle>,
    /// Incremented per armed timeout; a fired timeout must match it
    heartbeat_seq: u64,
    disposed: bool,
    state_stream: Option<broadcast::Sender<ConnectionState>>,
    inbound_stream: Option<broadcast::Sender<Payload>>,
}

impl Supervisor {
    /// Create a supervisor for `url`. No connection is attempted until
    /// [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// Returns an error if `url` is not a valid `ws`/`wss` URL.
    pub fn new(url: &str, config: Config) -> Result<Self> {
        let url = url::Url::parse(url)?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(Error::validation(format!(
                    "unsupported url scheme {other:?}, expected ws or wss"
                )));
            }
        }

        let transport = config
            .transport
            .unwrap_or_else(|| Arc::new(TungsteniteTransport::new(config.transport_config)));

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (state_stream, _) = broadcast::channel(STATE_CAPACITY);
        let (inbound_stream, _) = broadcast::channel(INBOUND_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                target: ConnectTarget {
                    url,
                    headers: config.headers,
                    ping_interval: config.ping_interval,
                },
                transport,
                heartbeat: config.heartbeat,
                state_tx,
                core: Mutex::new(Core {
                    engine: None,
                    reader: None,
                    expected_disconnect: false,
                    reconnecting: false,
                    attempt: 0,
                    epoch: 0,
                    backoff: config.backoff,
                    reconnect_timer: None,
                    heartbeat_tick: None,
                    heartbeat_timeout: None,
                    heartbeat_seq: 0,
                    disposed: false,
                    state_stream: Some(state_stream),
                    inbound_stream: Some(inbound_stream),
                }),
            }),
        })
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Subscribe to state changes.
    ///
    /// Late subscribers see only future transitions. After
    /// [`dispose`](Self::dispose) the returned receiver is already closed.
    #[must_use]
    pub fn on_state_change(&self) -> broadcast::Receiver<ConnectionState> {
        let core = self.shared.lock();
        core.state_stream
            .as_ref()
            .map_or_else(closed_receiver, broadcast::Sender::subscribe)
    }

    /// Subscribe to inbound messages, after heartbeat filtering.
    ///
    /// Each call returns an independent receiver; multiple subscribers
    /// receive messages concurrently without blocking each other.
    #[must_use]
    pub fn on_receive(&self) -> broadcast::Receiver<Payload> {
        let core = self.shared.lock();
        core.inbound_stream
            .as_ref()
            .map_or_else(closed_receiver, broadcast::Sender::subscribe)
    }

    /// Open the connection.
    ///
    /// Completes once the handshake attempt finishes, successfully or not;
    /// the resulting state is observable on [`on_state_change`](Self::on_state_change).
    /// A no-op while already `Connecting` or `Connected`, and after dispose.
    pub async fn connect(&self) {
        {
            let mut core = self.shared.lock();
            if core.disposed || self.state() != ConnectionState::Disconnected {
                return;
            }
            core.expected_disconnect = false;
            core.reconnecting = false;
            if let Some(timer) = core.reconnect_timer.take() {
                timer.abort();
            }
        }
        self.shared.establish().await;
    }

    /// Close the connection and stop reconnecting.
    ///
    /// The engine is given [`CLOSE_WAIT`] to shut down cleanly; on expiry
    /// the close is logged and abandoned. Never fails.
    pub async fn disconnect(&self) {
        let engine = {
            let mut core = self.shared.lock();
            if let Some(timer) = core.reconnect_timer.take() {
                timer.abort();
            }
            core.expected_disconnect = true;
            core.reconnecting = false;
            core.stop_heartbeat();
            if let Some(reader) = core.reader.take() {
                reader.abort();
            }
            self.shared.transition(&mut core, ConnectionState::Disconnected);
            core.engine.take()
        };

        if let Some(engine) = engine {
            close_engine(&*engine).await;
        }
    }

    /// Send one message, waiting briefly for the connection if necessary.
    ///
    /// Returns `true` once the engine accepted the message. While not
    /// connected, waits up to five seconds for a `Connected` transition and
    /// sends then; returns `false` on timeout, on engine failure, or after
    /// dispose. No queueing: each call carries exactly one message, and
    /// concurrent calls have no ordering guarantee.
    pub async fn send(&self, payload: impl Into<Payload>) -> bool {
        let payload = payload.into();

        let mut state_rx = {
            let core = self.shared.lock();
            if core.disposed {
                log::emit("send rejected: supervisor disposed");
                return false;
            }
            if self.state().is_connected()
                && let Some(engine) = core.engine.clone()
            {
                drop(core);
                return dispatch(&*engine, payload);
            }
            self.shared.state_tx.subscribe()
        };

        // Not connected: wait for the state stream to report Connected
        // within the window. Dropping the receiver on every path below
        // cancels the listener.
        match timeout(SEND_WAIT, state_rx.wait_for(|state| state.is_connected())).await {
            Ok(Ok(_)) => {
                let engine = {
                    let core = self.shared.lock();
                    if core.disposed { None } else { core.engine.clone() }
                };
                match engine {
                    Some(engine) => dispatch(&*engine, payload),
                    None => false,
                }
            }
            _ => {
                log::emit("send timed out waiting for connection");
                false
            }
        }
    }

    /// Tear the supervisor down.
    ///
    /// Disconnects, cancels every pending timer, and closes both broadcast
    /// streams; subsequent [`send`](Self::send) calls return `false`.
    /// Idempotent.
    pub fn dispose(&self) {
        let engine = {
            let mut core = self.shared.lock();
            if core.disposed {
                return;
            }
            core.disposed = true;
            core.expected_disconnect = true;
            core.reconnecting = false;
            if let Some(timer) = core.reconnect_timer.take() {
                timer.abort();
            }
            core.stop_heartbeat();
            if let Some(reader) = core.reader.take() {
                reader.abort();
            }
            self.shared.transition(&mut core, ConnectionState::Disconnected);
            core.state_stream = None;
            core.inbound_stream = None;
            core.engine.take()
        };

        // Closing is bounded but asynchronous; detach it so dispose itself
        // stays synchronous even outside a runtime.
        if let Some(engine) = engine
            && let Ok(handle) = Handle::try_current()
        {
            handle.spawn(async move { close_engine(&*engine).await });
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emit a state change exactly once per actual change.
    fn transition(&self, core: &mut Core, next: ConnectionState) {
        let previous = *self.state_tx.borrow();
        if previous == next {
            return;
        }
        log::emit(&format!("state: {previous:?} -> {next:?}"));
        _ = self.state_tx.send(next);
        if let Some(stream) = &core.state_stream {
            _ = stream.send(next);
        }
    }

    /// Run one handshake attempt and install the engine on success.
    ///
    /// Entered from [`Supervisor::connect`] and from a fired reconnect
    /// timer; the `Disconnected` check below makes concurrent entries
    /// collapse into one.
    async fn establish(self: &Arc<Self>) {
        {
            let mut core = self.lock();
            if core.disposed || *self.state_tx.borrow() != ConnectionState::Disconnected {
                return;
            }
            self.transition(&mut core, ConnectionState::Connecting);
        }

        log::emit(&format!("connecting to {}", self.target.url));
        let result = self.transport.connect(&self.target).await;

        match result {
            Ok(EngineHandle { engine, events }) => {
                let discard = {
                    let mut core = self.lock();
                    if core.disposed || core.expected_disconnect {
                        core.reconnecting = false;
                        // The racing disconnect may have landed before the
                        // Connecting report above; roll the state back so it
                        // settles on Disconnected either way.
                        self.transition(&mut core, ConnectionState::Disconnected);
                        true
                    } else {
                        core.epoch += 1;
                        let epoch = core.epoch;
                        core.engine = Some(Arc::clone(&engine));
                        core.attempt = 0;
                        core.backoff.reset();
                        core.reconnecting = false;
                        self.transition(&mut core, ConnectionState::Connected);
                        core.reader = Some(self.spawn_reader(epoch, events));
                        if let Some(heartbeat) = &self.heartbeat {
                            core.heartbeat_tick =
                                Some(self.spawn_heartbeat(epoch, heartbeat.interval));
                        }
                        false
                    }
                };

                // The handshake cannot be cancelled mid-flight, so a
                // disconnect issued while it ran is honored here: the fresh
                // engine is closed and never observed as Connected.
                if discard {
                    log::emit("discarding connection established after disconnect");
                    close_engine(&*engine).await;
                }
            }
            Err(e) => {
                log::emit(&format!("connection failed: {e}"));
                let mut core = self.lock();
                core.reconnecting = false;
                self.handle_disconnect_locked(&mut core);
            }
        }
    }

    /// Entry point for disconnection events raised by spawned tasks.
    ///
    /// `epoch` is the engine generation the caller belongs to; an event from
    /// a previous generation is stale and ignored.
    fn handle_disconnect(self: &Arc<Self>, epoch: Option<u64>) {
        let mut core = self.lock();
        if core.disposed {
            return;
        }
        if let Some(epoch) = epoch
            && epoch != core.epoch
        {
            return;
        }
        self.handle_disconnect_locked(&mut core);
    }

    /// The disconnect handler: stop the heartbeat, drop the engine, report
    /// `Disconnected` once, and schedule a reconnect unless the loss was
    /// expected or one is already scheduled.
    fn handle_disconnect_locked(self: &Arc<Self>, core: &mut Core) {
        core.stop_heartbeat();
        if let Some(reader) = core.reader.take() {
            reader.abort();
        }
        // No close call: the engine is already gone or never lived.
        core.engine = None;

        self.transition(core, ConnectionState::Disconnected);

        if !core.expected_disconnect && !core.reconnecting {
            core.reconnecting = true;
            core.attempt += 1;
            let delay = core.backoff.next(core.attempt);
            log::emit(&format!(
                "reconnecting in {delay:?} (attempt {})",
                core.attempt
            ));
            if let Some(timer) = core.reconnect_timer.take() {
                timer.abort();
            }
            core.reconnect_timer = Some(self.spawn_reconnect(delay));
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, delay: Duration) -> AbortHandle {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            sleep(delay).await;
            let Some(shared) = weak.upgrade() else { return };
            let proceed = {
                let mut core = shared.lock();
                core.reconnect_timer = None;
                if core.disposed || core.expected_disconnect {
                    core.reconnecting = false;
                    false
                } else {
                    true
                }
            };
            if proceed {
                shared.establish().await;
            }
        })
        .abort_handle()
    }

    /// Pump one engine's event stream: classification, forwarding, and the
    /// disconnect handler once the stream ends.
    fn spawn_reader(
        self: &Arc<Self>,
        epoch: u64,
        mut events: mpsc::UnboundedReceiver<Result<Payload>>,
    ) -> AbortHandle {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(shared) = weak.upgrade() else { return };
                match event {
                    Ok(payload) => shared.route_inbound(epoch, payload),
                    Err(e) => {
                        log::emit(&format!("connection lost: {e}"));
                        break;
                    }
                }
            }
            if let Some(shared) = weak.upgrade() {
                shared.handle_disconnect(Some(epoch));
            }
        })
        .abort_handle()
    }

    /// Classify one inbound message and forward it unless intercepted.
    ///
    /// Messages from an engine that is no longer current, or arriving after
    /// the connection was already reported lost, are discarded.
    fn route_inbound(self: &Arc<Self>, epoch: u64, payload: Payload) {
        let mut core = self.lock();
        if core.disposed || epoch != core.epoch {
            return;
        }
        if *self.state_tx.borrow() != ConnectionState::Connected {
            return;
        }

        if let Some(heartbeat) = &self.heartbeat
            && heartbeat.is_response(&payload)
        {
            if let Some(timer) = core.heartbeat_timeout.take() {
                timer.abort();
            }
            if heartbeat.intercept_response {
                return;
            }
        }

        if let Some(stream) = &core.inbound_stream {
            _ = stream.send(payload);
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>, epoch: u64, interval: Duration) -> AbortHandle {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let Some(shared) = weak.upgrade() else { return };
                if !shared.heartbeat_tick(epoch) {
                    return;
                }
            }
        })
        .abort_handle()
    }

    /// One heartbeat tick: probe and arm the response timeout.
    ///
    /// Returns `false` once the tick loop should stop.
    fn heartbeat_tick(self: &Arc<Self>, epoch: u64) -> bool {
        let mut core = self.lock();
        if core.disposed || epoch != core.epoch {
            return false;
        }
        if *self.state_tx.borrow() != ConnectionState::Connected {
            return false;
        }
        let Some(heartbeat) = &self.heartbeat else {
            return false;
        };
        let Some(engine) = core.engine.clone() else {
            return false;
        };

        if let Err(e) = engine.send(heartbeat.request.clone()) {
            // The engine's own error path reports the loss; raising one here
            // as well would disconnect twice.
            log::emit(&format!("heartbeat send failed: {e}"));
            return true;
        }

        if let Some(timer) = core.heartbeat_timeout.take() {
            timer.abort();
        }
        core.heartbeat_seq += 1;
        let seq = core.heartbeat_seq;
        let weak = Arc::downgrade(self);
        let timeout_after = heartbeat.timeout;
        core.heartbeat_timeout = Some(
            tokio::spawn(async move {
                sleep(timeout_after).await;
                if let Some(shared) = weak.upgrade() {
                    shared.heartbeat_timeout_fired(epoch, seq);
                }
            })
            .abort_handle(),
        );
        true
    }

    /// A probe went unanswered: treat it as an unexpected disconnect.
    fn heartbeat_timeout_fired(self: &Arc<Self>, epoch: u64, seq: u64) {
        let mut core = self.lock();
        if core.disposed || epoch != core.epoch || seq != core.heartbeat_seq {
            return;
        }
        // A response may have cancelled this timeout between the timer
        // firing and the lock being taken.
        if core.heartbeat_timeout.take().is_none() {
            return;
        }
        log::emit("heartbeat timed out; treating connection as lost");
        self.handle_disconnect_locked(&mut core);
    }
}

impl Core {
    fn stop_heartbeat(&mut self) {
        if let Some(tick) = self.heartbeat_tick.take() {
            tick.abort();
        }
        if let Some(timer) = self.heartbeat_timeout.take() {
            timer.abort();
        }
    }
}

/// Fire-and-forget engine send, reported as a boolean.
fn dispatch(engine: &dyn Engine, payload: Payload) -> bool {
    match engine.send(payload) {
        Ok(()) => true,
        Err(e) => {
            log::emit(&format!("send failed: {e}"));
            false
        }
    }
}

async fn close_engine(engine: &dyn Engine) {
    match timeout(CLOSE_WAIT, engine.close(None, None)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::emit(&format!("engine close failed: {e}")),
        Err(_) => log::emit(&format!("engine close timed out after {CLOSE_WAIT:?}")),
    }
}

fn closed_receiver<T: Clone>() -> broadcast::Receiver<T> {
    let (sender, receiver) = broadcast::channel(1);
    drop(sender);
    receiver
}
