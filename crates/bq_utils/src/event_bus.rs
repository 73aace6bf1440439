//! Fan-out of events to any number of subscribers.
//!
//! Publishing never blocks and never fails: with no subscribers the event is dropped, and a
//! subscriber that falls behind by more than the bus capacity skips the events it missed.

use tokio::sync::broadcast;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn post(&self, event: E) {
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Subscription<E> {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct Subscription<E> {
    rx: broadcast::Receiver<E>,
}

impl<E: Clone> Subscription<E> {
    /// Waits for the next event. Returns `None` once every bus handle is dropped.
    pub async fn next(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Takes every event already published, without waiting.
    pub fn drain(&mut self) -> Vec<E> {
        let mut events = vec![];
        loop {
            match self.rx.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return events,
            }
        }
    }
}

/// Runs `handle` on every event posted to `bus` until the bus is dropped.
pub fn spawn_subscriber<E, F>(bus: &EventBus<E>, mut handle: F) -> tokio::task::JoinHandle<()>
where
    E: Clone + Send + 'static,
    F: FnMut(E) + Send + 'static,
{
    let mut subscription = bus.subscribe();
    tokio::spawn(async move {
        while let Some(event) = subscription.next().await {
            handle(event);
        }
    })
}
