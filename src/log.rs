//! Process-wide log sink.
//!
//! Disabled by default. [`init`] enables logging and optionally installs an
//! adapter receiving each pre-formatted line; without an adapter, lines go to
//! stdout. Repeated calls are allowed and the last call wins.

use std::io::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::Lazy;

/// Receives each pre-formatted log line.
pub type LogAdapter = Arc<dyn Fn(&str) + Send + Sync>;

struct Sink {
    enabled: bool,
    adapter: Option<LogAdapter>,
}

static SINK: Lazy<RwLock<Sink>> = Lazy::new(|| {
    RwLock::new(Sink {
        enabled: false,
        adapter: None,
    })
});

/// Configure the process-wide log sink.
pub fn init(enabled: bool, adapter: Option<LogAdapter>) {
    let mut sink = SINK.write().unwrap_or_else(PoisonError::into_inner);
    sink.enabled = enabled;
    sink.adapter = adapter;
}

/// Emit a line through the sink, if enabled.
///
/// Never panics: a panicking adapter is swallowed and a failed stdout write
/// is ignored, so logging cannot unwind into connection handling.
pub(crate) fn emit(message: &str) {
    let adapter = {
        let sink = SINK.read().unwrap_or_else(PoisonError::into_inner);
        if !sink.enabled {
            return;
        }
        sink.adapter.clone()
    };

    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
    let line = format!("[OkWs] {timestamp} {message}");

    match adapter {
        Some(adapter) => {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| adapter(&line)));
        }
        None => {
            _ = std::io::stdout().write_fmt(format_args!("{line}\n"));
        }
    }
}
