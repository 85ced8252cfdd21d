//! A one-shot shutdown signal shared by every long-running task.

use std::sync::Arc;

use tokio::sync::Semaphore;

/// A multi-producer, multi-consumer shutdown signal.
///
/// - Clone freely; every handle can both send and receive.
/// - Receivers that subscribe after the signal was sent still observe it,
///   unlike [`tokio::sync::broadcast`].
/// - Sending more than once is harmless.
///
/// Implementation: a [`Semaphore`] with zero permits. [`Semaphore::acquire`]
/// on such a semaphore only returns once it is closed, so closing the
/// semaphore is "send" and getting an `AcquireError` is "recv".
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    inner: Arc<Semaphore>,
}

impl ShutdownSignal {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
        }
    }

    /// Signal shutdown. All pending and future [`recv`](Self::recv) calls
    /// complete.
    pub fn send(&self) {
        self.inner.close();
    }

    /// Wait for the shutdown signal. Returns immediately if it was already
    /// sent.
    pub async fn recv(&self) {
        // Acquiring a permit can only succeed if someone added permits, which
        // nothing does; the only exit is the semaphore being closed.
        let result = self.inner.acquire().await;
        assert!(result.is_err(), "acquired a permit on a 0-permit semaphore");
    }

    /// Whether the signal has already been sent.
    pub fn is_sent(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn send_twice_is_fine() {
        let shutdown = ShutdownSignal::new();
        shutdown.send();
        shutdown.send();
        assert!(shutdown.is_sent());
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscriber_still_observes() {
        let shutdown = ShutdownSignal::new();
        shutdown.send();
        let late = shutdown.clone();
        tokio::time::timeout(Duration::from_secs(1), late.recv())
            .await
            .expect("late subscriber should observe the signal");
    }

    #[tokio::test(start_paused = true)]
    async fn recv_blocks_until_send() {
        let shutdown = ShutdownSignal::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        shutdown.send();
        handle.await.unwrap();
    }
}
