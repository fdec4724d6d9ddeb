//! In-process transport.

use super::{AddressStats, MessageHandler, QueueTable, Subscription, Transport};
use crate::config::BrokerConfig;
use crate::correlation::lock;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Queues living in this process. Clones share the same queues, so one
/// instance can connect any number of bridges.
#[derive(Clone)]
pub struct MemoryTransport {
    queues: Arc<Mutex<QueueTable>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("addresses", &self.stats().len())
            .finish()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_max_pending(BrokerConfig::MAX_PENDING_PER_ADDRESS)
    }

    pub fn with_max_pending(max_pending: usize) -> Self {
        Self {
            queues: Arc::new(Mutex::new(QueueTable::new(max_pending))),
        }
    }

    pub fn stats(&self) -> Vec<AddressStats> {
        lock(&self.queues).stats()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, address: &str, message: Bytes) -> Result<()> {
        lock(&self.queues).publish(address, message);
        Ok(())
    }

    async fn subscribe(&self, address: &str, handler: MessageHandler) -> Result<Subscription> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let id = lock(&self.queues)
            .attach(address, Box::new(move |message| tx.send(message).is_ok()))?;

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                handler(message);
            }
        });

        let queues = self.queues.clone();
        let owned = address.to_string();
        Ok(Subscription::new(address, move || {
            lock(&queues).detach(&owned, id);
        }))
    }
}
