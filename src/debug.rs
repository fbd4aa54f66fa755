//! Diagnostic logging, off unless switched on with [`set_debug`].
use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG: AtomicBool = AtomicBool::new(false);

/// Turns diagnostic events for threshold updates, bucket checks and redistributions on or off
/// for the whole process.
///
/// Events are emitted through [`tracing`] at the `DEBUG` level, so a subscriber must also be
/// installed for them to go anywhere.
pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::Relaxed);
}

/// Returns whether diagnostic events are switched on.
pub fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

macro_rules! debug_log {
    ($($arg:tt)+) => {
        if $crate::debug::debug_enabled() {
            ::tracing::debug!($($arg)+);
        }
    };
}

pub(crate) use debug_log;
