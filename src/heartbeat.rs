#![expect(
    clippy::module_name_repetitions,
    reason = "Heartbeat types expose their domain in the name for clarity"
)]

//! Application-level heartbeat configuration.
//!
//! A heartbeat is a liveness probe above the transport: while connected, the
//! supervisor sends `request` every `interval` and expects a response within
//! `timeout`. A missed response is treated as an unexpected disconnect even
//! when the socket still looks open, which is exactly the failure mode
//! transport-level pings can miss.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::Payload;
use crate::log;

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Predicate deciding whether an inbound message answers a heartbeat.
pub type Validator = Arc<dyn Fn(&Payload) -> bool + Send + Sync>;

#[non_exhaustive]
#[derive(Clone)]
pub struct HeartbeatConfig {
    /// Time between probes
    pub interval: Duration,
    /// Time allowed for a response after each probe
    pub timeout: Duration,
    /// Probe payload sent on every tick
    pub request: Payload,
    /// Classifier for responses. With no validator, any inbound message
    /// counts as a response (keep-alive mode).
    pub validator: Option<Validator>,
    /// Drop responses instead of forwarding them to subscribers
    pub intercept_response: bool,
}

impl HeartbeatConfig {
    /// Heartbeat with the given probe payload and default timings.
    pub fn new(request: impl Into<Payload>) -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            request: request.into(),
            validator: None,
            intercept_response: true,
        }
    }

    /// Whether `payload` answers the heartbeat.
    ///
    /// A panicking validator is contained and treated as "not a response" so
    /// user code cannot unwind into connection handling.
    #[must_use]
    pub fn is_response(&self, payload: &Payload) -> bool {
        match &self.validator {
            Some(validator) => {
                panic::catch_unwind(AssertUnwindSafe(|| validator(payload))).unwrap_or_else(|_| {
                    log::emit("heartbeat validator panicked; treating message as not a response");
                    false
                })
            }
            None => true,
        }
    }
}

impl fmt::Debug for HeartbeatConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatConfig")
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("request", &self.request)
            .field("validator", &self.validator.as_ref().map(|_| "<fn>"))
            .field("intercept_response", &self.intercept_response)
            .finish()
    }
}
