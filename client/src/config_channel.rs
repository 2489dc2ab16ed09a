//! One-shot delivery of the tunnel endpoint into the worker.
//!
//! The first [`ConfigChannel::set_endpoint`] opens the gate; later calls only
//! replace the value. Waiters never see a missed wake-up: the watch channel
//! keeps the latest value, so a waiter arriving after the first delivery
//! returns immediately.

use std::sync::Arc;

use tokio::sync::watch;

/// Gate plus latest-value cell for the tunnel endpoint.
#[derive(Clone)]
pub struct ConfigChannel {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl ConfigChannel {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Store a new endpoint. The first call releases every pending waiter.
    pub fn set_endpoint(&self, url: impl Into<String>) {
        self.tx.send_replace(Some(url.into()));
    }

    /// Wait for the first delivery, then return the latest endpoint.
    ///
    /// Suspends indefinitely if nothing is ever delivered; callers apply
    /// their own timeout.
    pub async fn await_endpoint(&self) -> String {
        let mut rx = self.tx.subscribe();
        let endpoint = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|value| value.clone());
        match endpoint {
            Some(endpoint) => endpoint,
            // The sender lives in `self`, so the channel cannot close while we wait.
            None => std::future::pending::<String>().await,
        }
    }

    /// Latest endpoint without waiting.
    pub fn current(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    pub fn is_configured(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl Default for ConfigChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_await_suspends_until_first_delivery() {
        let channel = ConfigChannel::new();
        assert!(!channel.is_configured());
        assert!(timeout(Duration::from_millis(50), channel.await_endpoint())
            .await
            .is_err());

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.await_endpoint().await })
        };
        tokio::task::yield_now().await;

        channel.set_endpoint("wss://a");
        assert_eq!(waiter.await.unwrap(), "wss://a");
        assert_eq!(channel.await_endpoint().await, "wss://a");
    }

    #[tokio::test]
    async fn test_later_deliveries_replace_value() {
        let channel = ConfigChannel::new();
        channel.set_endpoint("wss://a");
        channel.set_endpoint("wss://b");
        assert_eq!(channel.await_endpoint().await, "wss://b");
        assert_eq!(channel.current().as_deref(), Some("wss://b"));
    }

    #[tokio::test]
    async fn test_many_waiters_all_released() {
        let channel = ConfigChannel::new();
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let channel = channel.clone();
                tokio::spawn(async move { channel.await_endpoint().await })
            })
            .collect();
        tokio::task::yield_now().await;

        channel.set_endpoint("wss://a");
        for w in waiters {
            assert_eq!(w.await.unwrap(), "wss://a");
        }
    }
}
