use std::sync::atomic::Ordering;

/// Memory ordering used for all counters and flags shared between queue threads.
/// The queue has no hot atomic paths that would benefit from weaker orderings.
pub const ORDERING: Ordering = Ordering::SeqCst;
