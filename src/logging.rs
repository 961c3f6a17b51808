//! Named-channel debug logging for the runtime.
//!
//! Diagnostics are grouped into channels (`driver`, `jit`, `fibers`), each
//! independently enabled through the `HILTI_DEBUG` environment variable as a
//! colon-separated list, e.g. `HILTI_DEBUG=jit:fibers`. Disabled channels
//! cost one hash lookup and no formatting.

use rustc_hash::FxHashSet;
use std::fs::File;
use std::io::Write;
use std::sync::Mutex;

/// Debug logger recording runtime diagnostics on named channels.
pub struct DebugLogger {
    streams: FxHashSet<String>,
    output: Mutex<Output>,
}

enum Output {
    Stderr,
    File(File),
}

impl DebugLogger {
    /// Create a logger with the given colon-separated channel spec.
    pub fn new(spec: &str) -> Self {
        let streams = spec
            .split(':')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        DebugLogger {
            streams,
            output: Mutex::new(Output::Stderr),
        }
    }

    /// Create a logger from the `HILTI_DEBUG` environment variable.
    pub fn from_env() -> Self {
        let mut logger = DebugLogger::new(&std::env::var("HILTI_DEBUG").unwrap_or_default());
        if let Ok(path) = std::env::var("HILTI_DEBUG_FILE") {
            if let Ok(file) = File::create(&path) {
                logger.output = Mutex::new(Output::File(file));
            }
        }
        logger
    }

    /// Whether a channel is enabled.
    pub fn is_enabled(&self, stream: &str) -> bool {
        self.streams.contains(stream)
    }

    /// Write one message to a channel. No-op when the channel is disabled.
    pub fn debug(&self, stream: &str, msg: &str) {
        if !self.is_enabled(stream) {
            return;
        }
        let line = format!("[{}] {}", stream, msg);
        match &mut *self.output.lock().unwrap_or_else(|e| e.into_inner()) {
            Output::Stderr => eprintln!("{}", line),
            Output::File(f) => {
                let _ = writeln!(f, "{}", line);
            }
        }
    }
}

/// Whether a channel is enabled on the current runtime's logger.
pub fn enabled(stream: &str) -> bool {
    match crate::global::try_global_state() {
        Some(gs) => gs.debug_logger.is_enabled(stream),
        None => false,
    }
}

/// Emit a message on the current runtime's logger.
pub fn emit(stream: &str, msg: &str) {
    if let Some(gs) = crate::global::try_global_state() {
        gs.debug_logger.debug(stream, msg);
    }
}

/// Log to a named debug channel. The format arguments are only evaluated
/// when the channel is enabled.
#[macro_export]
macro_rules! rt_debug {
    ($stream:expr, $($arg:tt)*) => {
        if $crate::logging::enabled($stream) {
            $crate::logging::emit($stream, &format!($($arg)*));
        }
    };
}
