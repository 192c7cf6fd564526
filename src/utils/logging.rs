//! Logging macros gated by a module-level `ENABLE_LOGS` flag.
//!
//! Hot-path modules (the detection loop, the stream adapter) log every cycle,
//! so each of them declares its own switch and the macros expand to nothing
//! observable when it is off:
//!
//! ```ignore
//! const ENABLE_LOGS: bool = true;
//!
//! use crate::{log_debug, log_info};
//!
//! log_info!("cycle {} finished", seq);
//! ```

/// Shared expansion for the level-specific macros below.
#[doc(hidden)]
#[macro_export]
macro_rules! gated_log {
    ($level:ident, $($arg:tt)*) => {
        if ENABLE_LOGS {
            log::$level!($($arg)*);
        }
    };
}

/// `log::debug!` when the calling module's `ENABLE_LOGS` is true.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::gated_log!(debug, $($arg)*)
    };
}

/// `log::info!` when the calling module's `ENABLE_LOGS` is true.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::gated_log!(info, $($arg)*)
    };
}

/// `log::warn!` when the calling module's `ENABLE_LOGS` is true.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::gated_log!(warn, $($arg)*)
    };
}

/// `log::error!` when the calling module's `ENABLE_LOGS` is true.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::gated_log!(error, $($arg)*)
    };
}
