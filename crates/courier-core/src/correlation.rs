//! Correlation registry.
//!
//! Maps a call id to a FIFO inbox of raw reply messages. The reply listener
//! `put`s every inbound reply under its call id; the calling task waits on the
//! same key until a reply is there.
//!
//! # Lifecycle
//!
//! An inbox is created by whichever comes first, `put` or `wait_for`, and is
//! removed when:
//! - a waiter takes the last message (successful match),
//! - the wait times out or is cancelled,
//! - the periodic sweep finds it orphaned (see [`CorrelationRegistry::evict_stale`]).
//!
//! Finished keys, matched or abandoned, are tombstoned for a while so a
//! duplicate or late reply is rejected instead of lingering in the map.
//!
//! # Thread Safety
//!
//! The key map lock is held only to look up, insert or remove an inbox. Each
//! inbox has its own lock and `Notify`, so a stalled call never delays
//! delivery for another key.

use crate::cancel::CancellationToken;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use bytes::Bytes;
use mini_moka::sync::Cache;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

struct Inbox {
    messages: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    closed: AtomicBool,
    created: Instant,
}

impl Inbox {
    fn new() -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            created: Instant::now(),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Wait for the oldest message. `None` once the inbox is closed.
    async fn receive(&self) -> Option<Bytes> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = lock(&self.messages).pop_front();
            if next.is_some() {
                return next;
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }
}

/// Process-wide map from call id to reply inbox.
pub struct CorrelationRegistry {
    inboxes: Mutex<HashMap<String, Arc<Inbox>>>,
    max_depth: usize,
    tombstones: Cache<String, ()>,
}

impl std::fmt::Debug for CorrelationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("pending", &self.len())
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationRegistry {
    /// Create a registry with the default limits from [`BridgeConfig`].
    pub fn new() -> Self {
        Self::with_limits(BridgeConfig::MAX_INBOX_DEPTH, BridgeConfig::TOMBSTONE_TTL)
    }

    /// Create a registry with an explicit inbox depth and tombstone lifetime.
    pub fn with_limits(max_depth: usize, tombstone_ttl: Duration) -> Self {
        Self {
            inboxes: Mutex::new(HashMap::new()),
            max_depth: max_depth.max(1),
            tombstones: Cache::builder()
                .max_capacity(BridgeConfig::MAX_TOMBSTONES)
                .time_to_live(tombstone_ttl)
                .build(),
        }
    }

    fn inbox(&self, key: &str) -> Arc<Inbox> {
        lock(&self.inboxes)
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Inbox::new()))
            .clone()
    }

    /// Queue a message under `key` and wake a waiter.
    ///
    /// Fails if the key was recently abandoned, or if the inbox already holds
    /// the maximum number of undelivered messages.
    pub fn put(&self, key: &str, message: Bytes) -> Result<()> {
        if self.tombstones.contains_key(&key.to_string()) {
            warn!("Dropping late reply for finished call {}", key);
            return Err(BridgeError::LateReply {
                key: key.to_string(),
            });
        }

        let inbox = self.inbox(key);
        {
            let mut messages = lock(&inbox.messages);
            if messages.len() >= self.max_depth {
                warn!(
                    "Inbox for call {} already holds {} message(s), dropping duplicate",
                    key,
                    messages.len()
                );
                return Err(BridgeError::InboxFull {
                    key: key.to_string(),
                    depth: messages.len(),
                });
            }
            messages.push_back(message);
        }

        debug!("Queued reply for call {}", key);
        inbox.notify.notify_one();
        Ok(())
    }

    /// Wait for the oldest message under `key`.
    ///
    /// With `timeout = None` the wait is unbounded. On timeout or cancellation
    /// the inbox is removed and the key tombstoned.
    pub async fn wait_for(
        &self,
        key: &str,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Bytes> {
        let inbox = self.inbox(key);
        debug!("Waiting for reply to call {}", key);

        let cancelled = || BridgeError::Cancelled {
            call_id: key.to_string(),
        };
        let received = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, inbox.receive())
                    .await
                    .map_err(|_| BridgeError::CorrelationTimeout {
                        call_id: key.to_string(),
                        timeout: limit,
                    })?
                    .ok_or_else(cancelled),
                None => inbox.receive().await.ok_or_else(cancelled),
            }
        };

        let result = tokio::select! {
            result = received => result,
            _ = wait_cancelled(cancel) => Err(cancelled()),
        };

        match &result {
            Ok(_) => self.release(key, &inbox),
            Err(e) => {
                debug!("Abandoning call {}: {}", key, e);
                self.abandon(key, &inbox);
            }
        }
        result
    }

    /// Cancel every wait on `key` and drop its inbox.
    ///
    /// Returns `true` if an inbox existed.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = lock(&self.inboxes).remove(key);
        self.tombstones.insert(key.to_string(), ());
        match removed {
            Some(inbox) => {
                inbox.close();
                true
            }
            None => false,
        }
    }

    /// Remove inboxes older than `max_age` that nobody is waiting on.
    ///
    /// These hold replies whose caller vanished without timing out. Returns
    /// the number of inboxes removed.
    pub fn evict_stale(&self, max_age: Duration) -> usize {
        let mut inboxes = lock(&self.inboxes);
        let before = inboxes.len();
        inboxes.retain(|key, inbox| {
            let orphaned = Arc::strong_count(inbox) == 1 && inbox.created.elapsed() >= max_age;
            if orphaned {
                debug!("Evicting orphaned inbox for call {}", key);
            }
            !orphaned
        });
        before - inboxes.len()
    }

    /// Number of live inboxes.
    pub fn len(&self) -> usize {
        lock(&self.inboxes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.inboxes).contains_key(key)
    }

    /// Drop the inbox after a successful match if it is drained and unshared.
    ///
    /// The key is tombstoned so a duplicate reply arriving afterwards is
    /// rejected.
    fn release(&self, key: &str, inbox: &Arc<Inbox>) {
        let mut inboxes = lock(&self.inboxes);
        let unused = match inboxes.get(key) {
            // One reference in the map, one held by this waiter.
            Some(current) => {
                Arc::ptr_eq(current, inbox)
                    && Arc::strong_count(inbox) == 2
                    && lock(&inbox.messages).is_empty()
            }
            None => false,
        };
        if unused {
            self.tombstones.insert(key.to_string(), ());
            inboxes.remove(key);
        }
    }

    fn abandon(&self, key: &str, inbox: &Arc<Inbox>) {
        {
            let mut inboxes = lock(&self.inboxes);
            if inboxes
                .get(key)
                .map(|current| Arc::ptr_eq(current, inbox))
                .unwrap_or(false)
            {
                inboxes.remove(key);
            }
        }
        self.tombstones.insert(key.to_string(), ());
    }
}

async fn wait_cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
