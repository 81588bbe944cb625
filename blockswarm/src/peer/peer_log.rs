//! Logging macros for everything that concerns a single peer connection.
//!
//! The first parameter is the peer's address, while the rest of the
//! parameters are the format string and its arguments. Prefixing each line
//! with the address allows filtering the log down to a single peer.

macro_rules! peer_warn {
    ($addr:expr, $($arg:tt)*) => ({
        ::log::warn!("[{}] {}", $addr, format!($($arg)*));
    })
}

macro_rules! peer_info {
    ($addr:expr, $($arg:tt)*) => ({
        ::log::info!("[{}] {}", $addr, format!($($arg)*));
    })
}

macro_rules! peer_debug {
    ($addr:expr, $($arg:tt)*) => ({
        ::log::debug!("[{}] {}", $addr, format!($($arg)*));
    })
}

macro_rules! peer_trace {
    ($addr:expr, $($arg:tt)*) => ({
        ::log::trace!("[{}] {}", $addr, format!($($arg)*));
    })
}
