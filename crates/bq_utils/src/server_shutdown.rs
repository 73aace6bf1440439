//! Coordinates shutdown of the queue server and the tasks it spawns.

use std::{
    io,
    sync::{atomic::AtomicBool, Arc},
};

use tokio::sync::broadcast;

use crate::atomic::ORDERING;

/// Owns the shutdown signal. Receivers are handed to every task that must stop with the server.
pub struct ShutdownManager {
    retired: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown: bool,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            retired: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown: false,
        }
    }
}

impl ShutdownManager {
    pub fn new_pair() -> (Self, ShutdownReceiver) {
        let mut manager = Self::default();
        let recv = manager.add_receiver();
        (manager, recv)
    }

    pub fn add_receiver(&mut self) -> ShutdownReceiver {
        ShutdownReceiver {
            retired: self.retired.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
        }
    }

    /// A retired server finishes in-flight work but takes on no new jobs.
    pub fn is_retired(&self) -> bool {
        self.retired.load(ORDERING)
    }

    pub fn retire(&mut self) {
        self.retired.store(true, ORDERING)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Signals every receiver. Returns the number of receivers that were listening.
    pub fn shutdown_immediately(&mut self) -> io::Result<usize> {
        if self.shutdown {
            return Ok(0);
        }
        self.shutdown = true;
        self.shutdown_tx.send(()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "no task is listening for shutdown",
            )
        })
    }
}

pub struct ShutdownReceiver {
    retired: Arc<AtomicBool>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ShutdownReceiver {
    pub async fn recv_shutdown_immediately(&mut self) -> io::Result<()> {
        self.shutdown_rx
            .recv()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(ORDERING)
    }
}
