// src/macros.rs

/// Logs a line with the component as the `log` target.
/// Usage:
/// ```ignore
/// keygrab_log!(Level::Info, "lifecycle", "Starting key scan for pid {}", pid);
/// keygrab_log!(Level::Warn, "worker", "read failed: {}", err);
/// ```
/// With the fern format from `main.rs` this renders as:
/// [2025-04-25T16:32:10+02:00][INFO ][lifecycle][pid=4568][tid=ThreadId(3)] Starting key scan for pid 812
#[macro_export]
macro_rules! keygrab_log {
    ($level:expr, $component:expr, $($arg:tt)+) => {
        log::log!(target: $component, $level, $($arg)+)
    };
}
