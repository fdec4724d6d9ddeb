//! Per-address queue table shared by the in-process transport and the broker.

use crate::error::{BridgeError, Result};
use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, warn};

/// Consumer side of an address. Returns `false` once the consumer is gone.
pub(crate) type Sink = Box<dyn Fn(Bytes) -> bool + Send + Sync>;

struct Consumer {
    id: u64,
    sink: Sink,
}

/// Queue depth and consumer presence of one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressStats {
    pub address: String,
    pub pending: usize,
    pub has_consumer: bool,
}

/// Address -> consumer, plus messages waiting for a consumer.
///
/// Not synchronized; owners wrap it in a mutex. Sinks run under that lock and
/// must only enqueue.
pub(crate) struct QueueTable {
    consumers: HashMap<String, Consumer>,
    pending: HashMap<String, VecDeque<Bytes>>,
    next_id: u64,
    max_pending: usize,
}

impl QueueTable {
    pub(crate) fn new(max_pending: usize) -> Self {
        Self {
            consumers: HashMap::new(),
            pending: HashMap::new(),
            next_id: 1,
            max_pending: max_pending.max(1),
        }
    }

    /// Hand `message` to the consumer of `address`, or buffer it.
    pub(crate) fn publish(&mut self, address: &str, message: Bytes) {
        if let Some(consumer) = self.consumers.get(address) {
            if (consumer.sink)(message.clone()) {
                return;
            }
            debug!("Consumer of {} is gone, buffering", address);
            self.consumers.remove(address);
        }

        let queue = self.pending.entry(address.to_string()).or_default();
        if queue.len() >= self.max_pending {
            queue.pop_front();
            warn!(
                "Address {} has {} undelivered messages, dropping the oldest",
                address, self.max_pending
            );
        }
        queue.push_back(message);
    }

    /// Make `sink` the consumer of `address` and flush buffered messages to it.
    pub(crate) fn attach(&mut self, address: &str, sink: Sink) -> Result<u64> {
        if self.consumers.contains_key(address) {
            return Err(BridgeError::AlreadyRegistered {
                address: address.to_string(),
            });
        }

        let id = self.next_id;
        self.next_id += 1;

        if let Some(mut queue) = self.pending.remove(address) {
            debug!("Flushing {} buffered message(s) to {}", queue.len(), address);
            while let Some(message) = queue.pop_front() {
                if !sink(message.clone()) {
                    queue.push_front(message);
                    self.pending.insert(address.to_string(), queue);
                    return Err(BridgeError::transport(format!(
                        "consumer for {} closed while attaching",
                        address
                    )));
                }
            }
        }

        self.consumers.insert(address.to_string(), Consumer { id, sink });
        Ok(id)
    }

    /// Remove the consumer `id` from `address`. A newer consumer is left alone.
    pub(crate) fn detach(&mut self, address: &str, id: u64) -> bool {
        match self.consumers.get(address) {
            Some(consumer) if consumer.id == id => {
                self.consumers.remove(address);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn stats(&self) -> Vec<AddressStats> {
        let addresses: BTreeSet<&String> =
            self.consumers.keys().chain(self.pending.keys()).collect();
        addresses
            .into_iter()
            .map(|address| AddressStats {
                address: address.clone(),
                pending: self.pending.get(address).map(VecDeque::len).unwrap_or(0),
                has_consumer: self.consumers.contains_key(address),
            })
            .collect()
    }
}
