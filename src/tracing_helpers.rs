//! Zero-cost tracing for the insert and split paths.
//!
//! The tree narrates itself at three levels when the `tracing` feature is
//! enabled; without it, every call site compiles to nothing:
//!
//! - [`trace_log!`]: per-attempt chatter on the insert path (slot races
//!   lost, descents retried).
//! - [`debug_log!`]: split lifecycle (lock transitions, node splits, root
//!   growth).
//! - [`warn_log!`]: abnormal but survivable conditions (the split
//!   clustering stopping at its iteration cap).
//!
//! ```bash
//! RUST_LOG=ktree=debug cargo test --features tracing
//! ```

/// Forward one event to `tracing` at the given level. Compiles to nothing
/// without the `tracing` feature.
#[cfg(feature = "tracing")]
macro_rules! emit {
    ($level:ident, $($arg:tt)*) => {
        tracing::$level!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! emit {
    ($level:ident, $($arg:tt)*) => {};
}

pub(crate) use emit;

/// Insert-path chatter: slot races lost, descents retried.
macro_rules! trace_log {
    ($($arg:tt)*) => {
        $crate::tracing_helpers::emit!(trace, $($arg)*)
    };
}

/// Split lifecycle: lock transitions, node splits, root growth.
macro_rules! debug_log {
    ($($arg:tt)*) => {
        $crate::tracing_helpers::emit!(debug, $($arg)*)
    };
}

/// Abnormal but survivable conditions.
macro_rules! warn_log {
    ($($arg:tt)*) => {
        $crate::tracing_helpers::emit!(warn, $($arg)*)
    };
}

pub(crate) use {debug_log, trace_log, warn_log};
