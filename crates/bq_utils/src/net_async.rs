//! Tokio-async server/client connections between queue, workers and clients.

pub mod tcp;
