//! Broadcast-based graceful shutdown.
//!
//! A single [`ShutdownTx`] terminates every worker holding a [`ShutdownRx`].
//! Workers observe the signal between units of work so shutdown only happens
//! at safe boundaries.

use tokio::sync::watch;

/// Transmitter side of the shutdown channel.
#[derive(Debug)]
pub struct ShutdownTx(watch::Sender<bool>);

impl ShutdownTx {
    /// Signals shutdown to every subscribed worker.
    pub fn shutdown(&self) {
        // Send only fails when all receivers are gone, which means every
        // worker already stopped.
        let _ = self.0.send(true);
    }

    /// Creates a new receiver subscribed to this shutdown signal.
    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }
}

/// Receiver side of the shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    /// Returns `true` once shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Waits until shutdown is signaled.
    ///
    /// Also resolves when the transmitter is dropped, treating a vanished
    /// coordinator as a shutdown.
    pub async fn signaled(&mut self) {
        while !*self.0.borrow() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Creates a connected shutdown channel pair.
pub fn create_shutdown() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), ShutdownRx(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signaled_resolves_after_shutdown() {
        let (tx, mut rx) = create_shutdown();
        assert!(!rx.is_shutdown());

        tx.shutdown();
        tokio::time::timeout(Duration::from_secs(1), rx.signaled())
            .await
            .unwrap();
        assert!(rx.is_shutdown());
    }

    #[tokio::test]
    async fn test_dropped_transmitter_counts_as_shutdown() {
        let (tx, mut rx) = create_shutdown();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), rx.signaled())
            .await
            .unwrap();
    }
}
