/// Checks a queue invariant. In debug builds (and so in tests) a violation panics; in release
/// builds the violation is logged and execution continues, so the caller must be prepared to
/// fail safe.
#[macro_export]
macro_rules! log_assert {
    ($check:expr, $($field:tt)*) => {{
        let check: bool = $check;
        debug_assert!(check);
        if !check {
            tracing::error!($($field)*)
        }
    }}
}

/// Marks a branch that should be unreachable if the queue's invariants hold.
#[macro_export]
macro_rules! illegal_state {
    ($msg:expr, $($field:tt)*) => {{
        debug_assert!(false, "illegal state: {}", $msg);
        tracing::error!($($field)*, "illegal state: {}", $msg)
    }}
}
