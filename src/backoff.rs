#![expect(
    clippy::module_name_repetitions,
    reason = "Strategy types expose their domain in the name for clarity"
)]

//! Reconnection delay strategies.
//!
//! The supervisor asks its strategy for a delay before every reconnect
//! attempt. Attempts are counted consecutively between successful
//! connections, starting at 1, and the counter is reset once a connection is
//! established.

use std::fmt;
use std::time::Duration;

use rand::Rng as _;

const DEFAULT_LINEAR_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.5;
const DEFAULT_BACKOFF_JITTER: f64 = 0.2;

/// Strategy deciding how long to wait before a reconnect attempt.
///
/// `next` must be a function of `attempt` and the strategy's configuration
/// only (plus internal randomness for jitter). Callers pass `attempt >= 1`.
pub trait BackoffStrategy: fmt::Debug + Send + 'static {
    /// Delay before the given attempt.
    fn next(&mut self, attempt: u32) -> Duration;

    /// Clear any internal counter after a successful connection.
    fn reset(&mut self) {}
}

/// Constant delay between attempts.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Linear {
    /// Delay returned for every attempt
    pub interval: Duration,
}

impl Linear {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for Linear {
    fn default() -> Self {
        Self::new(DEFAULT_LINEAR_INTERVAL)
    }
}

impl BackoffStrategy for Linear {
    fn next(&mut self, _attempt: u32) -> Duration {
        self.interval
    }
}

/// Exponentially growing delay with jitter.
///
/// The delay for attempt `n` is `initial * multiplier^(n-1)`, capped at
/// `max`, with a uniformly drawn offset of up to `jitter` times the capped
/// value in either direction. The final result is clamped to `[0, max]`.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Exponential {
    /// Delay before the first attempt
    pub initial: Duration,
    /// Upper bound for any produced delay
    pub max: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
    /// Jitter fraction, e.g. `0.2` for +/-20%
    pub jitter: f64,
}

impl Default for Exponential {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_BACKOFF,
            max: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: DEFAULT_BACKOFF_JITTER,
        }
    }
}

impl BackoffStrategy for Exponential {
    fn next(&mut self, attempt: u32) -> Duration {
        let exponent = f64::from(attempt.saturating_sub(1));
        let max = self.max.as_secs_f64();
        let base = (self.initial.as_secs_f64() * self.multiplier.powf(exponent)).min(max);

        let offset = if self.jitter > 0.0 {
            let unit = rand::rng().random::<f64>().mul_add(2.0, -1.0);
            unit * self.jitter * base
        } else {
            0.0
        };

        let delay = (base + offset).clamp(0.0, max);
        if delay.is_finite() {
            Duration::from_secs_f64(delay)
        } else {
            self.max
        }
    }
}
