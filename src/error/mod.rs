//! Unified error system for the runtime core.
//!
//! All failure modes are typed (`ErrorKind`) and surfaced through `HResult`.
//! This module also owns the abort-on-error boundary: when the configuration
//! enables `abort_on_errors` and no `DisableAbortOnErrors` guard is active,
//! an error escaping a fiber terminates the process with a diagnostic
//! instead of propagating to the driver.

mod builders;
mod types;

pub use types::{ErrorKind, HError, HResult};

use crate::global;

/// RAII guard suppressing the abort-on-error behavior while alive.
///
/// Guards nest: the behavior is suppressed as long as at least one guard
/// exists.
pub struct DisableAbortOnErrors;

impl DisableAbortOnErrors {
    pub fn new() -> Self {
        let gs = global::global_state();
        gs.disable_abort_on_errors
            .set(gs.disable_abort_on_errors.get() + 1);
        DisableAbortOnErrors
    }
}

impl Default for DisableAbortOnErrors {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DisableAbortOnErrors {
    fn drop(&mut self) {
        if let Some(gs) = global::try_global_state() {
            let n = gs.disable_abort_on_errors.get();
            debug_assert!(n > 0, "unbalanced DisableAbortOnErrors guard");
            gs.disable_abort_on_errors.set(n.saturating_sub(1));
        }
    }
}

/// True when an error escaping the outer fiber boundary must terminate the
/// process.
pub fn abort_on_error_enabled() -> bool {
    match global::try_global_state() {
        Some(gs) => {
            gs.configuration.borrow().abort_on_errors && gs.disable_abort_on_errors.get() == 0
        }
        None => false,
    }
}

/// Terminate the process with a diagnostic. Only called at the outer fiber
/// boundary when `abort_on_error_enabled()` holds.
pub(crate) fn report_fatal(err: &HError) -> ! {
    eprintln!("hilti: uncaught runtime error: {}", err);
    std::process::abort();
}
