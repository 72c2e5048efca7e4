#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use okws::backoff::{BackoffStrategy, Linear};
use okws::{
    Config, ConnectTarget, ConnectionState, Engine, EngineHandle, Error, HeartbeatConfig, Payload,
    Supervisor, Transport,
};
use tokio::sync::{Semaphore, broadcast, mpsc, watch};
use tokio::time::{sleep, timeout};

const EVENT_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Accept,
    Refuse,
}

/// One accepted connection, seen from the test side.
struct MockLink {
    /// Payloads the supervisor sent through the engine
    sent: mpsc::UnboundedReceiver<Payload>,
    /// Injects inbound traffic; dropping it completes the stream
    inbound: Option<mpsc::UnboundedSender<okws::Result<Payload>>>,
    /// Flips to true once the supervisor closed the engine
    closed: watch::Receiver<bool>,
}

impl MockLink {
    fn end_stream(&mut self) {
        self.inbound = None;
    }

    fn inject(&self, payload: impl Into<Payload>) {
        self.inbound
            .as_ref()
            .expect("stream already ended")
            .send(Ok(payload.into()))
            .unwrap();
    }
}

/// Scripted in-memory transport. Each `connect` pops the next outcome
/// (accepting once the script runs out) and hands the test a [`MockLink`]
/// for every accepted connection.
struct MockTransport {
    outcomes: Mutex<VecDeque<Outcome>>,
    exhausted: Outcome,
    links_tx: mpsc::UnboundedSender<MockLink>,
    started_tx: mpsc::UnboundedSender<()>,
    /// When present, each handshake parks here until the test releases it
    gate: Option<Arc<Semaphore>>,
}

struct MockHandles {
    links: mpsc::UnboundedReceiver<MockLink>,
    started: mpsc::UnboundedReceiver<()>,
}

impl MockTransport {
    fn new(script: Vec<Outcome>, exhausted: Outcome) -> (Arc<Self>, MockHandles) {
        Self::build(script, exhausted, None)
    }

    fn gated(gate: Arc<Semaphore>) -> (Arc<Self>, MockHandles) {
        Self::build(Vec::new(), Outcome::Accept, Some(gate))
    }

    fn build(
        script: Vec<Outcome>,
        exhausted: Outcome,
        gate: Option<Arc<Semaphore>>,
    ) -> (Arc<Self>, MockHandles) {
        let (links_tx, links) = mpsc::unbounded_channel();
        let (started_tx, started) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                outcomes: Mutex::new(script.into()),
                exhausted,
                links_tx,
                started_tx,
                gate,
            }),
            MockHandles { links, started },
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _target: &ConnectTarget) -> okws::Result<EngineHandle> {
        _ = self.started_tx.send(());
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.exhausted);
        match outcome {
            Outcome::Refuse => Err(Error::validation("scripted handshake failure")),
            Outcome::Accept => {
                let (sent_tx, sent_rx) = mpsc::unbounded_channel();
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let (closed_tx, closed_rx) = watch::channel(false);

                _ = self.links_tx.send(MockLink {
                    sent: sent_rx,
                    inbound: Some(events_tx),
                    closed: closed_rx,
                });

                Ok(EngineHandle {
                    engine: Arc::new(MockEngine {
                        sent: sent_tx,
                        closed: closed_tx,
                    }),
                    events: events_rx,
                })
            }
        }
    }
}

struct MockEngine {
    sent: mpsc::UnboundedSender<Payload>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl Engine for MockEngine {
    fn send(&self, payload: Payload) -> okws::Result<()> {
        self.sent.send(payload).map_err(|_| Error::closed())
    }

    async fn close(&self, _code: Option<u16>, _reason: Option<String>) -> okws::Result<()> {
        _ = self.closed.send(true);
        Ok(())
    }
}

/// Backoff that records every `next`/`reset` call for assertions.
#[derive(Debug)]
struct RecordingBackoff {
    delay: Duration,
    attempts: Arc<Mutex<Vec<u32>>>,
    resets: Arc<AtomicUsize>,
}

impl BackoffStrategy for RecordingBackoff {
    fn next(&mut self, attempt: u32) -> Duration {
        self.attempts.lock().unwrap().push(attempt);
        self.delay
    }

    fn reset(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

fn supervisor_with(transport: Arc<MockTransport>, config: Option<Config>) -> Supervisor {
    let mut config = config.unwrap_or_default();
    config.transport = Some(transport);
    Supervisor::new("ws://mock.invalid/socket", config).unwrap()
}

async fn next_state(states: &mut broadcast::Receiver<ConnectionState>) -> ConnectionState {
    timeout(EVENT_WAIT, states.recv())
        .await
        .expect("timed out waiting for state change")
        .expect("state stream closed")
}

async fn next_link(handles: &mut MockHandles) -> MockLink {
    timeout(EVENT_WAIT, handles.links.recv())
        .await
        .expect("timed out waiting for connection")
        .expect("transport dropped")
}

#[tokio::test]
async fn connect_reports_connecting_then_connected() {
    let (transport, mut handles) = MockTransport::new(Vec::new(), Outcome::Accept);
    let supervisor = supervisor_with(transport, None);
    let mut states = supervisor.on_state_change();

    supervisor.connect().await;

    assert_eq!(next_state(&mut states).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut states).await, ConnectionState::Connected);
    assert_eq!(supervisor.state(), ConnectionState::Connected);
    let _link = next_link(&mut handles).await;
    assert!(handles.started.try_recv().is_ok());

    // Idempotent: a second connect changes nothing.
    supervisor.connect().await;
    sleep(Duration::from_millis(50)).await;
    assert!(states.try_recv().is_err());
    assert!(handles.started.try_recv().is_err());
}

#[tokio::test]
async fn handshake_failures_retry_with_counted_attempts() {
    let (transport, mut handles) =
        MockTransport::new(vec![Outcome::Refuse, Outcome::Refuse], Outcome::Accept);
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let resets = Arc::new(AtomicUsize::new(0));
    let mut config = Config::default();
    config.backoff = Box::new(RecordingBackoff {
        delay: Duration::from_millis(20),
        attempts: Arc::clone(&attempts),
        resets: Arc::clone(&resets),
    });
    let supervisor = supervisor_with(transport, Some(config));
    let mut states = supervisor.on_state_change();

    supervisor.connect().await;

    let expected = [
        ConnectionState::Connecting,
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
    ];
    for state in expected {
        assert_eq!(next_state(&mut states).await, state);
    }

    assert_eq!(*attempts.lock().unwrap(), vec![1, 2]);
    assert_eq!(resets.load(Ordering::SeqCst), 1);
    let _link = next_link(&mut handles).await;

    supervisor.dispose();
}

#[tokio::test]
async fn disconnect_terminates_the_reconnect_loop() {
    let (transport, mut handles) = MockTransport::new(Vec::new(), Outcome::Refuse);
    let mut config = Config::default();
    config.backoff = Box::new(Linear::new(Duration::from_millis(30)));
    let supervisor = supervisor_with(transport, Some(config));
    let mut states = supervisor.on_state_change();

    supervisor.connect().await;
    assert_eq!(next_state(&mut states).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut states).await, ConnectionState::Disconnected);

    supervisor.disconnect().await;
    // Drain the handshakes that may already be in flight, then expect silence.
    sleep(Duration::from_millis(150)).await;
    while handles.started.try_recv().is_ok() {}
    sleep(Duration::from_millis(150)).await;

    assert!(handles.started.try_recv().is_err());
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_during_handshake_discards_the_fresh_engine() {
    let gate = Arc::new(Semaphore::new(0));
    let (transport, mut handles) = MockTransport::gated(Arc::clone(&gate));
    let supervisor = supervisor_with(transport, None);
    let mut states = supervisor.on_state_change();

    let connecting = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.connect().await })
    };

    // Wait for the handshake to start, then disconnect while it is parked.
    assert!(timeout(EVENT_WAIT, handles.started.recv()).await.unwrap().is_some());
    assert_eq!(next_state(&mut states).await, ConnectionState::Connecting);
    supervisor.disconnect().await;
    assert_eq!(next_state(&mut states).await, ConnectionState::Disconnected);

    gate.add_permits(1);
    connecting.await.unwrap();

    // The engine born from the stale handshake is closed, never installed.
    let mut link = next_link(&mut handles).await;
    timeout(EVENT_WAIT, link.closed.wait_for(|closed| *closed))
        .await
        .expect("fresh engine was not closed")
        .unwrap();
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    sleep(Duration::from_millis(50)).await;
    assert!(states.try_recv().is_err());
}

#[tokio::test]
async fn disconnect_racing_connect_never_wedges_the_state() {
    let gate = Arc::new(Semaphore::new(0));
    let (transport, mut handles) = MockTransport::gated(Arc::clone(&gate));
    let supervisor = supervisor_with(transport, None);

    let connecting = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.connect().await })
    };

    // Disconnect right away, without waiting for Connecting to be observed.
    tokio::task::yield_now().await;
    supervisor.disconnect().await;

    gate.add_permits(1);
    connecting.await.unwrap();

    // However the race resolved, the fresh engine is closed and the reported
    // state settles on Disconnected rather than sticking at Connecting.
    let mut link = next_link(&mut handles).await;
    timeout(EVENT_WAIT, link.closed.wait_for(|closed| *closed))
        .await
        .expect("fresh engine was not closed")
        .unwrap();
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);

    // The supervisor is not wedged: a later connect still goes through.
    gate.add_permits(1);
    supervisor.connect().await;
    assert_eq!(supervisor.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn send_while_connected_reaches_the_engine() {
    let (transport, mut handles) = MockTransport::new(Vec::new(), Outcome::Accept);
    let supervisor = supervisor_with(transport, None);

    supervisor.connect().await;
    let mut link = next_link(&mut handles).await;

    assert!(supervisor.send("hi").await);
    let sent = timeout(EVENT_WAIT, link.sent.recv()).await.unwrap().unwrap();
    assert_eq!(sent, Payload::Text("hi".to_owned()));
}

#[tokio::test]
async fn send_waits_for_the_connection_to_come_up() {
    let (transport, mut handles) = MockTransport::new(Vec::new(), Outcome::Accept);
    let supervisor = supervisor_with(transport, None);

    let sending = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.send("queued").await })
    };

    sleep(Duration::from_millis(100)).await;
    supervisor.connect().await;

    assert!(sending.await.unwrap());
    let mut link = next_link(&mut handles).await;
    let sent = timeout(EVENT_WAIT, link.sent.recv()).await.unwrap().unwrap();
    assert_eq!(sent, Payload::Text("queued".to_owned()));
}

#[tokio::test]
async fn stream_end_reconnects_with_a_single_disconnected() {
    let (transport, mut handles) = MockTransport::new(Vec::new(), Outcome::Accept);
    let mut config = Config::default();
    config.backoff = Box::new(Linear::new(Duration::from_millis(20)));
    let supervisor = supervisor_with(transport, Some(config));
    let mut states = supervisor.on_state_change();

    supervisor.connect().await;
    let mut link = next_link(&mut handles).await;
    assert_eq!(next_state(&mut states).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut states).await, ConnectionState::Connected);

    // Server goes away: the engine stream completes.
    link.end_stream();

    let mut disconnects = 0;
    loop {
        let state = next_state(&mut states).await;
        if state == ConnectionState::Disconnected {
            disconnects += 1;
        }
        if state == ConnectionState::Connected {
            break;
        }
    }
    assert_eq!(disconnects, 1);
    let _second = next_link(&mut handles).await;

    supervisor.dispose();
}

#[tokio::test]
async fn heartbeat_timeout_disconnects_exactly_once_per_cycle() {
    let (transport, mut handles) = MockTransport::new(Vec::new(), Outcome::Accept);
    let mut heartbeat = HeartbeatConfig::new("ping");
    heartbeat.interval = Duration::from_millis(50);
    heartbeat.timeout = Duration::from_millis(50);
    let mut config = Config::default();
    config.heartbeat = Some(heartbeat);
    config.backoff = Box::new(Linear::new(Duration::from_millis(200)));
    let supervisor = supervisor_with(transport, Some(config));
    let mut states = supervisor.on_state_change();

    supervisor.connect().await;
    let mut link = next_link(&mut handles).await;
    assert_eq!(next_state(&mut states).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut states).await, ConnectionState::Connected);

    // The probe goes out but nothing ever answers.
    let probe = timeout(EVENT_WAIT, link.sent.recv()).await.unwrap().unwrap();
    assert_eq!(probe, Payload::Text("ping".to_owned()));

    assert_eq!(next_state(&mut states).await, ConnectionState::Disconnected);
    // The stale engine's stream ending must not produce a second report: the
    // next transitions are the reconnect itself, with no duplicate in between.
    link.end_stream();
    assert_eq!(next_state(&mut states).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut states).await, ConnectionState::Connected);

    supervisor.dispose();
}

#[tokio::test]
async fn heartbeat_response_keeps_the_connection_alive() {
    let (transport, mut handles) = MockTransport::new(Vec::new(), Outcome::Accept);
    let mut heartbeat = HeartbeatConfig::new("ping");
    heartbeat.interval = Duration::from_millis(30);
    heartbeat.timeout = Duration::from_millis(60);
    heartbeat.validator = Some(Arc::new(|payload: &Payload| {
        matches!(payload, Payload::Text(text) if text == "pong")
    }));
    let mut config = Config::default();
    config.heartbeat = Some(heartbeat);
    let supervisor = supervisor_with(transport, Some(config));
    let mut received = supervisor.on_receive();

    supervisor.connect().await;
    let mut link = next_link(&mut handles).await;

    // Answer every probe for a while.
    let answered = tokio::spawn(async move {
        for _ in 0..5 {
            let probe = timeout(EVENT_WAIT, link.sent.recv()).await.unwrap().unwrap();
            assert_eq!(probe, Payload::Text("ping".to_owned()));
            link.inject("pong");
        }
        link
    });
    let _link = answered.await.unwrap();

    assert_eq!(supervisor.state(), ConnectionState::Connected);
    // Responses are intercepted by default: subscribers never see them.
    assert!(received.try_recv().is_err());

    supervisor.dispose();
}

#[tokio::test]
async fn dispose_closes_streams_and_rejects_sends() {
    let (transport, mut handles) = MockTransport::new(Vec::new(), Outcome::Accept);
    let supervisor = supervisor_with(transport, None);
    let mut states = supervisor.on_state_change();
    let mut received = supervisor.on_receive();

    supervisor.connect().await;
    let _link = next_link(&mut handles).await;
    assert_eq!(next_state(&mut states).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut states).await, ConnectionState::Connected);

    supervisor.dispose();
    supervisor.dispose(); // idempotent

    assert_eq!(next_state(&mut states).await, ConnectionState::Disconnected);
    assert!(matches!(
        states.recv().await,
        Err(broadcast::error::RecvError::Closed)
    ));
    assert!(matches!(
        received.recv().await,
        Err(broadcast::error::RecvError::Closed)
    ));

    assert!(!supervisor.send("late").await);
    assert!(supervisor.on_state_change().recv().await.is_err());

    // A disposed supervisor never reconnects.
    sleep(Duration::from_millis(100)).await;
    while handles.started.try_recv().is_ok() {}
    supervisor.connect().await;
    assert!(handles.started.try_recv().is_err());
}

#[tokio::test]
async fn inbound_messages_reach_all_subscribers() {
    let (transport, mut handles) = MockTransport::new(Vec::new(), Outcome::Accept);
    let supervisor = supervisor_with(transport, None);
    let mut first = supervisor.on_receive();
    let mut second = supervisor.on_receive();

    supervisor.connect().await;
    let link = next_link(&mut handles).await;

    link.inject("broadcast");

    let expected = Payload::Text("broadcast".to_owned());
    assert_eq!(
        timeout(EVENT_WAIT, first.recv()).await.unwrap().unwrap(),
        expected
    );
    assert_eq!(
        timeout(EVENT_WAIT, second.recv()).await.unwrap().unwrap(),
        expected
    );

    supervisor.dispose();
}
