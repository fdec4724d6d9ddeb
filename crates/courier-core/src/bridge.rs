//! The bridge binds the correlation registry, proxies and dispatchers to a
//! [`Transport`].
//!
//! Outbound: calls are sent to the shared outbound address with the bridge's
//! reply address in `reply_to`. One subscription on the reply address feeds
//! every reply into the [`CorrelationRegistry`] under its call id.
//!
//! Inbound: [`Bridge::register`] subscribes an address and runs every call
//! delivered there through a [`Dispatcher`] on its own task. The returned
//! [`Registration`] owns the subscription; dropping it unregisters.

use crate::config::{BridgeConfig, DirectoryConfig, FaultClass};
use crate::correlation::{lock, CorrelationRegistry};
use crate::directory::DirectoryClient;
use crate::dispatcher::Dispatcher;
use crate::envelope::{peek_call_id, CallEnvelope, ResultEnvelope};
use crate::error::{BridgeError, Result};
use crate::filter::{ServiceDescriptor, ServiceFilter};
use crate::proxy::{CallOptions, RemoteProxy};
use crate::transport::{MessageHandler, Subscription, Transport};
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct BridgeInner {
    transport: Arc<dyn Transport>,
    registry: Arc<CorrelationRegistry>,
    outbound_address: String,
    reply_address: String,
    call_timeout: Option<Duration>,
    principal: String,
    credentials: Value,
    reply_subscription: Mutex<Option<Subscription>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    registered: Mutex<HashSet<String>>,
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        if let Some(sweeper) = lock(&self.sweeper).take() {
            sweeper.abort();
        }
    }
}

/// Connects local proxies and dispatchers to a transport.
///
/// Cheap to clone; clones share the reply address and registry.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("reply_address", &self.inner.reply_address)
            .field("outbound_address", &self.inner.outbound_address)
            .field("call_timeout", &self.inner.call_timeout)
            .field("pending", &self.inner.registry.len())
            .finish()
    }
}

/// Builder for [`Bridge`].
pub struct BridgeBuilder {
    transport: Arc<dyn Transport>,
    outbound_address: String,
    reply_address: Option<String>,
    call_timeout: Option<Duration>,
    principal: String,
    credentials: Value,
    max_inbox_depth: usize,
    tombstone_ttl: Duration,
    sweep_interval: Duration,
    stale_inbox_age: Duration,
}

impl BridgeBuilder {
    /// Address replies are consumed from. Defaults to `CLIENT-<uuid>`.
    pub fn reply_address(mut self, address: impl Into<String>) -> Self {
        self.reply_address = Some(address.into());
        self
    }

    /// Shared address every outbound call is sent to.
    pub fn outbound_address(mut self, address: impl Into<String>) -> Self {
        self.outbound_address = address.into();
        self
    }

    /// Default reply timeout. `None` waits without bound.
    pub fn call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = principal.into();
        self
    }

    /// Opaque credentials attached to every call.
    pub fn credentials(mut self, credentials: Value) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn max_inbox_depth(mut self, depth: usize) -> Self {
        self.max_inbox_depth = depth;
        self
    }

    pub fn tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = ttl;
        self
    }

    /// Period and age threshold of the orphaned-inbox sweep.
    pub fn sweep(mut self, interval: Duration, stale_age: Duration) -> Self {
        self.sweep_interval = interval;
        self.stale_inbox_age = stale_age;
        self
    }

    /// Subscribe the reply address and start the sweeper.
    pub async fn build(self) -> Result<Bridge> {
        if self.max_inbox_depth == 0 {
            return Err(BridgeError::Config {
                message: "max_inbox_depth must be at least 1".to_string(),
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(BridgeError::Config {
                message: "sweep interval must be non-zero".to_string(),
            });
        }

        let registry = Arc::new(CorrelationRegistry::with_limits(
            self.max_inbox_depth,
            self.tombstone_ttl,
        ));
        let reply_address = self
            .reply_address
            .unwrap_or_else(|| format!("{}{}", BridgeConfig::REPLY_ADDRESS_PREFIX, Uuid::new_v4()));

        let reply_subscription = self
            .transport
            .subscribe(&reply_address, reply_handler(registry.clone()))
            .await?;

        let sweeper = tokio::spawn(sweep_loop(
            Arc::downgrade(&registry),
            self.sweep_interval,
            self.stale_inbox_age,
        ));

        info!("Bridge listening for replies on {}", reply_address);

        Ok(Bridge {
            inner: Arc::new(BridgeInner {
                transport: self.transport,
                registry,
                outbound_address: self.outbound_address,
                reply_address,
                call_timeout: self.call_timeout,
                principal: self.principal,
                credentials: self.credentials,
                reply_subscription: Mutex::new(Some(reply_subscription)),
                sweeper: Mutex::new(Some(sweeper)),
                registered: Mutex::new(HashSet::new()),
            }),
        })
    }
}

fn reply_handler(registry: Arc<CorrelationRegistry>) -> MessageHandler {
    Arc::new(move |message: Bytes| match peek_call_id(&message) {
        Ok(call_id) => {
            // put() logs rejected replies itself
            let _ = registry.put(&call_id, message);
        }
        Err(e) => warn!("Discarding reply without a call id: {}", e),
    })
}

async fn sweep_loop(registry: Weak<CorrelationRegistry>, interval: Duration, stale_age: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(registry) = registry.upgrade() else {
            break;
        };
        let evicted = registry.evict_stale(stale_age);
        if evicted > 0 {
            debug!("Evicted {} orphaned reply inbox(es)", evicted);
        }
    }
}

impl Bridge {
    pub fn builder(transport: Arc<dyn Transport>) -> BridgeBuilder {
        BridgeBuilder {
            transport,
            outbound_address: BridgeConfig::OUTBOUND_ADDRESS.to_string(),
            reply_address: None,
            call_timeout: Some(BridgeConfig::CALL_TIMEOUT),
            principal: BridgeConfig::DEFAULT_PRINCIPAL.to_string(),
            credentials: Value::Null,
            max_inbox_depth: BridgeConfig::MAX_INBOX_DEPTH,
            tombstone_ttl: BridgeConfig::TOMBSTONE_TTL,
            sweep_interval: BridgeConfig::SWEEP_INTERVAL,
            stale_inbox_age: BridgeConfig::STALE_INBOX_AGE,
        }
    }

    /// Bridge with default settings.
    pub async fn connect(transport: Arc<dyn Transport>) -> Result<Self> {
        Self::builder(transport).build().await
    }

    pub fn reply_address(&self) -> &str {
        &self.inner.reply_address
    }

    pub fn outbound_address(&self) -> &str {
        &self.inner.outbound_address
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.inner.call_timeout
    }

    pub fn principal(&self) -> &str {
        &self.inner.principal
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.inner.registry
    }

    /// Whether both handles refer to the same bridge.
    pub fn same_bridge(&self, other: &Bridge) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stand-in for the remote service selected by `filter`.
    pub fn proxy(&self, filter: ServiceFilter) -> RemoteProxy {
        RemoteProxy::new(self.clone(), filter)
    }

    /// Send a call to the outbound address.
    ///
    /// Fills in the reply address when the call awaits a reply, and the
    /// bridge identity when the call carries none. Returns the call id.
    pub async fn send_call(&self, mut call: CallEnvelope) -> Result<String> {
        if call.principal.is_empty() {
            call.principal = self.inner.principal.clone();
            call.credentials = self.inner.credentials.clone();
        }
        if call.awaits_reply && call.reply_to.is_none() {
            call.reply_to = Some(self.inner.reply_address.clone());
        }

        debug!(
            "Sending call {} {} to {}",
            call.call_id, call.method_name, call.target_filter
        );
        let bytes = call.encode()?;
        self.inner
            .transport
            .send(&self.inner.outbound_address, bytes)
            .await?;
        Ok(call.call_id)
    }

    /// Wait for the result of call `call_id`.
    pub async fn await_reply(
        &self,
        call_id: &str,
        options: &CallOptions,
    ) -> Result<ResultEnvelope> {
        let timeout = options.timeout.resolve(self.inner.call_timeout);
        let bytes = self
            .inner
            .registry
            .wait_for(call_id, timeout, options.cancel.as_ref())
            .await?;
        ResultEnvelope::decode(&bytes)
    }

    /// Serve calls delivered to `address` with `dispatcher`.
    pub async fn register(&self, address: &str, dispatcher: Dispatcher) -> Result<Registration> {
        {
            let mut registered = lock(&self.inner.registered);
            if !registered.insert(address.to_string()) {
                return Err(BridgeError::AlreadyRegistered {
                    address: address.to_string(),
                });
            }
        }

        let transport = self.inner.transport.clone();
        let runtime = tokio::runtime::Handle::current();
        let handler: MessageHandler = Arc::new(move |message: Bytes| {
            runtime.spawn(serve_call(transport.clone(), dispatcher.clone(), message));
        });

        match self.inner.transport.subscribe(address, handler).await {
            Ok(subscription) => {
                info!("Registered service at {}", address);
                Ok(Registration {
                    address: address.to_string(),
                    subscription: Some(subscription),
                    bridge: Arc::downgrade(&self.inner),
                })
            }
            Err(e) => {
                lock(&self.inner.registered).remove(address);
                Err(e)
            }
        }
    }

    pub fn is_registered(&self, address: &str) -> bool {
        lock(&self.inner.registered).contains(address)
    }

    /// Register `dispatcher` at the descriptor's address and announce it to
    /// the service directory.
    pub async fn publish(
        &self,
        descriptor: ServiceDescriptor,
        dispatcher: Dispatcher,
    ) -> Result<PublishedService> {
        let registration = self.register(&descriptor.address, dispatcher).await?;
        let directory = self.directory();
        directory.register(&descriptor).await?;
        info!(
            "Published {} ({}) at {}",
            descriptor.interface, descriptor.id, descriptor.address
        );
        Ok(PublishedService {
            descriptor,
            directory,
            registration: Some(registration),
        })
    }

    /// Client for the service directory reachable through this bridge.
    pub fn directory(&self) -> DirectoryClient {
        DirectoryClient::new(self.proxy(
            ServiceFilter::for_interface(DirectoryConfig::INTERFACE)
                .with_id(DirectoryConfig::INSTANCE_ID),
        ))
    }

    /// Stop the sweeper and stop consuming replies. Pending calls run into
    /// their timeout.
    pub fn shutdown(&self) {
        if let Some(sweeper) = lock(&self.inner.sweeper).take() {
            sweeper.abort();
        }
        if lock(&self.inner.reply_subscription).take().is_some() {
            info!("Bridge stopped listening on {}", self.inner.reply_address);
        }
    }
}

async fn serve_call(transport: Arc<dyn Transport>, dispatcher: Dispatcher, message: Bytes) {
    let call = match CallEnvelope::decode(&message) {
        Ok(call) => call,
        Err(e) => {
            warn!("Discarding undecodable call: {}", e);
            return;
        }
    };

    let awaits_reply = call.awaits_reply;
    let reply_to = call.reply_to.clone();
    let call_id = call.call_id.clone();
    let result = dispatcher.dispatch(call).await;

    if !awaits_reply {
        debug!("Call {} is fire-and-forget, no reply", call_id);
        return;
    }
    let Some(reply_to) = reply_to else {
        warn!("Call {} awaits a reply but names no reply address", call_id);
        return;
    };

    let sent = match result.encode() {
        Ok(bytes) => transport.send(&reply_to, bytes).await,
        Err(e) => Err(e),
    };
    let Err(e) = sent else {
        return;
    };
    warn!("Failed to send result of call {} to {}: {}", call_id, reply_to, e);

    // A result the channel refuses still has to release the caller.
    let refused = matches!(e, BridgeError::Validation { .. } | BridgeError::Json { .. });
    if result.is_fault() || !refused {
        return;
    }
    let fault = ResultEnvelope::fault(
        &call_id,
        FaultClass::INTERNAL,
        format!("result not deliverable: {}", e),
    );
    let sent = match fault.encode() {
        Ok(bytes) => transport.send(&reply_to, bytes).await,
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        warn!("Failed to report undeliverable result of call {}: {}", call_id, e);
    }
}

/// A registered local service. Dropping it unregisters.
///
/// Unregistration is best-effort: a call already delivered may still be
/// processed after it.
pub struct Registration {
    address: String,
    subscription: Option<Subscription>,
    bridge: Weak<BridgeInner>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("address", &self.address)
            .field("active", &self.subscription.is_some())
            .finish()
    }
}

impl Registration {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Stop serving the address.
    pub fn unregister(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };
        subscription.cancel();
        if let Some(bridge) = self.bridge.upgrade() {
            lock(&bridge.registered).remove(&self.address);
        }
        info!("Unregistered service at {}", self.address);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

/// A registration announced to the service directory.
pub struct PublishedService {
    descriptor: ServiceDescriptor,
    directory: DirectoryClient,
    registration: Option<Registration>,
}

impl std::fmt::Debug for PublishedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishedService")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

impl PublishedService {
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Withdraw the service from the directory, then stop serving it.
    pub async fn unpublish(mut self) -> Result<()> {
        let withdrawn = self
            .directory
            .unregister(&self.descriptor.interface, &self.descriptor.id)
            .await;
        if let Some(registration) = self.registration.take() {
            registration.unregister();
        }
        withdrawn.map(|_| ())
    }
}

impl Drop for PublishedService {
    fn drop(&mut self) {
        // Not unpublished explicitly; withdraw in the background.
        if self.registration.is_none() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let directory = self.directory.clone();
            let interface = self.descriptor.interface.clone();
            let id = self.descriptor.id.clone();
            runtime.spawn(async move {
                if let Err(e) = directory.unregister(&interface, &id).await {
                    debug!("Background withdrawal of {} failed: {}", id, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::MethodTable;
    use crate::envelope::{Argument, ResultKind};
    use crate::proxy::CallTimeout;
    use crate::transport::MemoryTransport;
    use serde_json::json;

    struct Echo;

    fn echo_dispatcher() -> Dispatcher {
        MethodTable::builder(Echo)
            .method1("echo", |_: &Echo, text: String| Ok(text))
            .into_dispatcher()
    }

    #[tokio::test]
    async fn test_builder_rejects_zero_depth() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let err = Bridge::builder(transport).max_inbox_depth(0).build().await.unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));
    }

    #[tokio::test]
    async fn test_reply_address_defaults_to_client_prefix() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let a = Bridge::connect(transport.clone()).await.unwrap();
        let b = Bridge::connect(transport).await.unwrap();

        assert!(a.reply_address().starts_with(BridgeConfig::REPLY_ADDRESS_PREFIX));
        assert_ne!(a.reply_address(), b.reply_address());
        assert_eq!(a.outbound_address(), BridgeConfig::OUTBOUND_ADDRESS);
        assert!(a.same_bridge(&a.clone()));
        assert!(!a.same_bridge(&b));
    }

    #[tokio::test]
    async fn test_registered_service_replies_to_reply_address() {
        let transport = Arc::new(MemoryTransport::new());
        let bridge = Bridge::connect(transport.clone()).await.unwrap();
        let _registration = bridge.register("svc-1", echo_dispatcher()).await.unwrap();

        // Deliver a call straight to the service address, as a router would.
        let mut call = CallEnvelope::new(
            "(objectClass=Echo)",
            "echo",
            vec![Argument::of(&"hi".to_string()).unwrap()],
        );
        call.reply_to = Some(bridge.reply_address().to_string());
        transport.send("svc-1", call.encode().unwrap()).await.unwrap();

        let result = bridge
            .await_reply(&call.call_id, &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(result.kind, ResultKind::Value);
        assert_eq!(result.payload, json!("hi"));
        assert!(bridge.registry().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let bridge = Bridge::connect(transport).await.unwrap();

        let registration = bridge.register("svc-1", echo_dispatcher()).await.unwrap();
        assert!(bridge.is_registered("svc-1"));
        assert!(matches!(
            bridge.register("svc-1", echo_dispatcher()).await,
            Err(BridgeError::AlreadyRegistered { .. })
        ));

        registration.unregister();
        assert!(!bridge.is_registered("svc-1"));
        let _again = bridge.register("svc-1", echo_dispatcher()).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_call_fills_reply_address_and_identity() {
        let transport = Arc::new(MemoryTransport::new());
        let bridge = Bridge::builder(transport.clone())
            .principal("admin")
            .credentials(json!({"password": "secret"}))
            .build()
            .await
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _tap = transport
            .subscribe(
                BridgeConfig::OUTBOUND_ADDRESS,
                Arc::new(move |m: Bytes| {
                    let _ = tx.send(m);
                }),
            )
            .await
            .unwrap();

        let call_id = bridge
            .send_call(CallEnvelope::new("(objectClass=X)", "ping", vec![]))
            .await
            .unwrap();

        let sent = CallEnvelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(sent.call_id, call_id);
        assert_eq!(sent.reply_to.as_deref(), Some(bridge.reply_address()));
        assert_eq!(sent.principal, "admin");
        assert_eq!(sent.credentials, json!({"password": "secret"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_reply_times_out_and_cleans_up() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let bridge = Bridge::builder(transport)
            .call_timeout(Some(Duration::from_secs(2)))
            .build()
            .await
            .unwrap();

        let err = bridge
            .await_reply("missing", &CallOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(bridge.registry().is_empty());

        let options = CallOptions::default().with_timeout(Duration::from_millis(10));
        assert_eq!(options.timeout, CallTimeout::After(Duration::from_millis(10)));
        assert!(bridge.await_reply("other", &options).await.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_shutdown_stops_reply_consumption() {
        let transport = Arc::new(MemoryTransport::new());
        let bridge = Bridge::connect(transport.clone()).await.unwrap();
        bridge.shutdown();

        // A second bridge may now take over the reply address.
        let replacement = Bridge::builder(transport)
            .reply_address(bridge.reply_address())
            .build()
            .await;
        assert!(replacement.is_ok());
    }
}
