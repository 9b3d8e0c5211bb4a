//! Per-term tracing that is compiled out unless the `tstore_debug-trace` feature is enabled.

/// Forwards to [log::trace] when the `tstore_debug-trace` feature is enabled,
/// and expands to nothing otherwise. Used for messages that are emitted for
/// every allocated or swept term.
///
/// # Examples
///
/// ```
/// use tstore_utilities::debug_trace;
///
/// let cell = 42;
/// debug_trace!("Sweeping cell {}", cell);
/// ```
#[macro_export]
#[cfg(feature = "tstore_debug-trace")]
macro_rules! debug_trace {
    ($($arg:tt)*) => {
        {
            log::trace!($($arg)*);
        }
    };
}

#[macro_export]
#[cfg(not(feature = "tstore_debug-trace"))]
macro_rules! debug_trace {
    ($($arg:tt)*) => {{}};
}
