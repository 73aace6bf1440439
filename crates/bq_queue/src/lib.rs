//! The bucket queue: splits jobs into buckets, hands them out to workers, and collects their
//! results.

pub mod aliveness;
pub mod balancing;
pub mod bucket_queue;
pub mod client;
pub mod events;
pub mod periodic;
pub mod prioritize;
pub mod results;
pub mod server;
pub mod split;
pub mod utilize;

#[cfg(test)]
mod test_utils;
