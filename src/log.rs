//! Logging macros for control-plane events.
//!
//! The macros keep a single call shape across the crate and forward to
//! [`tracing`] under the [`TARGET`] target, so subscribers can filter the
//! control plane independently of the embedding application.

use tracing_subscriber::EnvFilter;

#[doc(hidden)]
pub use tracing as __tracing;

/// Target attached to every event emitted by this crate.
pub const TARGET: &str = "tcp_usrreq";

/// Logs a message at the error level.
#[macro_export]
macro_rules! error {
    ($($arg:tt)+) => {{
        $crate::log::__tracing::error!(target: $crate::log::TARGET, $($arg)+);
    }};
}

/// Logs a message at the warn level.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => {{
        $crate::log::__tracing::warn!(target: $crate::log::TARGET, $($arg)+);
    }};
}

/// Logs a message at the info level.
#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => {{
        $crate::log::__tracing::info!(target: $crate::log::TARGET, $($arg)+);
    }};
}

/// Logs a message at the debug level.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => {{
        $crate::log::__tracing::debug!(target: $crate::log::TARGET, $($arg)+);
    }};
}

/// Installs a global `fmt` subscriber.
///
/// The filter is read from `RUST_LOG` when set, otherwise `default_filter` is
/// used. Installing twice is harmless; the second subscriber is discarded.
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_level(true)
        .with_target(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
