//! Transport boundary.
//!
//! The bridge needs exactly two capabilities from a message channel: send
//! bytes to an address, and subscribe a handler to an address. Delivery is
//! at-most-once and FIFO per address; there is no request/response.
//!
//! Implementations:
//! - [`MemoryTransport`]: in-process queues, for tests and single-process use
//! - [`TcpTransport`]: client of a [`crate::BrokerServer`]

mod memory;
pub mod protocol;
mod queues;
mod tcp;

pub use memory::MemoryTransport;
pub use queues::AddressStats;
pub(crate) use queues::QueueTable;
pub use tcp::TcpTransport;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Callback receiving every message delivered to a subscribed address.
///
/// Called from the transport's delivery task, one message at a time. It must
/// not block; long work belongs on a spawned task.
pub type MessageHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// A message channel with per-address queues.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send `message` to `address`. Messages for an address without a
    /// consumer are buffered by the transport.
    async fn send(&self, address: &str, message: Bytes) -> Result<()>;

    /// Become the consumer of `address`. An address has at most one consumer.
    async fn subscribe(&self, address: &str, handler: MessageHandler) -> Result<Subscription>;
}

/// Live subscription. Dropping it stops delivery to its handler.
pub struct Subscription {
    address: String,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Create a subscription that runs `release` exactly once when cancelled
    /// or dropped.
    pub fn new(address: impl Into<String>, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            address: address.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Unsubscribe now.
    pub fn cancel(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("address", &self.address)
            .field("active", &self.release.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscription_releases_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let subscription = Subscription::new("a", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(subscription.address(), "a");

        subscription.cancel();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_releases_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        {
            let counter = released.clone();
            let _subscription = Subscription::new("a", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
