#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::{BackoffStrategy, Linear};
use crate::engine::Transport;
use crate::engine::tungstenite::WebSocketConfig;
use crate::heartbeat::HeartbeatConfig;

/// Configuration for a [`Supervisor`](crate::Supervisor).
///
/// Start from [`Config::default`] and set the fields you need:
///
/// ```rust
/// use std::time::Duration;
///
/// use okws::backoff::Exponential;
/// use okws::{Config, HeartbeatConfig};
///
/// let mut config = Config::default();
/// config.backoff = Box::new(Exponential::default());
/// config.heartbeat = Some(HeartbeatConfig::new("ping"));
/// config.ping_interval = Some(Duration::from_secs(30));
/// ```
#[non_exhaustive]
pub struct Config {
    /// Opaque headers passed to the transport handshake
    pub headers: HashMap<String, String>,
    /// Interval for transport-level ping frames, if any
    pub ping_interval: Option<Duration>,
    /// Protocol configuration handed to the default transport
    pub transport_config: Option<WebSocketConfig>,
    /// Delay strategy between reconnect attempts
    pub backoff: Box<dyn BackoffStrategy>,
    /// Application-level heartbeat, if any
    pub heartbeat: Option<HeartbeatConfig>,
    /// Replacement transport. `None` uses the tungstenite transport built
    /// from `transport_config`.
    pub transport: Option<Arc<dyn Transport>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            headers: HashMap::new(),
            ping_interval: None,
            transport_config: None,
            backoff: Box::new(Linear::default()),
            heartbeat: None,
            transport: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("headers", &self.headers)
            .field("ping_interval", &self.ping_interval)
            .field("transport_config", &self.transport_config)
            .field("backoff", &self.backoff)
            .field("heartbeat", &self.heartbeat)
            .field("transport", &self.transport.as_ref().map(|_| "<custom>"))
            .finish()
    }
}
