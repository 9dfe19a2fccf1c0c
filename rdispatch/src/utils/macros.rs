/// Reports a fatal misuse of the runtime. Continuing would corrupt shared
/// structures, so this never returns.
macro_rules! crash {
    ($($arg:tt)+) => {{
        tracing::error!($($arg)+);
        panic!($($arg)+)
    }};
}

/// Logs an unexpected environment error once per call site. The caller
/// treats the operation as a no-op.
macro_rules! warn_once {
    ($($arg:tt)+) => {{
        static WARNED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
        if !WARNED.swap(true, std::sync::atomic::Ordering::Relaxed) {
            tracing::warn!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    }};
}
