pub mod atomic;
pub mod decay;
pub mod error;
pub mod event_bus;
pub mod exit;
pub mod log_assert;
pub mod net_async;
pub mod net_protocol;
pub mod retry;
pub mod server_shutdown;
pub mod time;

/// Version of the queue protocol. Workers must report the same version as the queue they
/// register with, or they are blocked from receiving work.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
