//! The worker side: fetching buckets from a queue, running their tests, and reporting back.

pub mod command_runner;
pub mod dist_worker;
pub mod runner;
pub mod test_like_runner;
