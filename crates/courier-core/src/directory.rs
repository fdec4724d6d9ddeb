//! Service directory and router.
//!
//! Callers send every call to one shared outbound address and name the target
//! only by its filter. The [`ServiceRouter`] consumes that address, resolves
//! each call's filter against the published [`ServiceDescriptor`]s and
//! forwards the untouched message to the first match. A call no service
//! matches is answered with a `courier.NoSuchService` fault, so it fails
//! instead of waiting out its timeout.
//!
//! The directory itself is a service (`courier.ServiceDirectory`, instance
//! `directory`) reachable through the router; [`DirectoryClient`] is its
//! stand-in.

use crate::bridge::{Bridge, Registration};
use crate::codec::{wrap_model, Model, Modeled, RemoteType};
use crate::config::{DirectoryConfig, FaultClass};
use crate::correlation::lock;
use crate::dispatcher::MethodTable;
use crate::envelope::{Argument, CallEnvelope, ResultEnvelope};
use crate::error::Result;
use crate::filter::{ServiceDescriptor, ServiceFilter};
use crate::proxy::RemoteProxy;
use crate::transport::{MessageHandler, Subscription, Transport};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

impl RemoteType for ServiceDescriptor {
    fn type_name() -> String {
        DirectoryConfig::DESCRIPTOR_TYPE.to_string()
    }
}

impl Model for ServiceDescriptor {
    const MODEL_TYPE: &'static str = DirectoryConfig::DESCRIPTOR_TYPE;
}

type Services = Arc<Mutex<Vec<ServiceDescriptor>>>;

/// The published services, in registration order.
struct Directory {
    services: Services,
}

impl Directory {
    fn register(&self, descriptor: ServiceDescriptor) {
        let mut services = lock(&self.services);
        match services
            .iter_mut()
            .find(|s| s.interface == descriptor.interface && s.id == descriptor.id)
        {
            Some(existing) => *existing = descriptor,
            None => services.push(descriptor),
        }
    }

    fn unregister(&self, interface: &str, id: &str) -> bool {
        let mut services = lock(&self.services);
        let before = services.len();
        services.retain(|s| !(s.interface == interface && s.id == id));
        services.len() != before
    }

    fn list(&self) -> Vec<ServiceDescriptor> {
        lock(&self.services).clone()
    }
}

/// Routes calls from the shared outbound address to published services.
///
/// Stops routing when dropped.
pub struct ServiceRouter {
    services: Services,
    _inbound: Subscription,
    _directory: Registration,
}

impl std::fmt::Debug for ServiceRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRouter")
            .field("services", &lock(&self.services).len())
            .finish()
    }
}

impl ServiceRouter {
    /// Consume `bridge`'s outbound address and serve the directory.
    pub async fn start(bridge: &Bridge) -> Result<Self> {
        let services: Services = Arc::new(Mutex::new(vec![ServiceDescriptor::new(
            DirectoryConfig::INTERFACE,
            DirectoryConfig::INSTANCE_ID,
            DirectoryConfig::ADDRESS,
        )]));

        let directory = MethodTable::builder(Directory {
            services: services.clone(),
        })
        .named(DirectoryConfig::INTERFACE)
        .method1("register", |d: &Directory, descriptor: Modeled<ServiceDescriptor>| {
            d.register(descriptor.into_inner());
            Ok(())
        })
        .method2("unregister", |d: &Directory, interface: String, id: String| {
            Ok(d.unregister(&interface, &id))
        })
        .method0("list", |d: &Directory| Ok(d.list()))
        .into_dispatcher()
        .with_default_history();
        let registration = bridge.register(DirectoryConfig::ADDRESS, directory).await?;

        let transport = bridge.transport().clone();
        let routes = services.clone();
        let runtime = tokio::runtime::Handle::current();
        let handler: MessageHandler = Arc::new(move |message: Bytes| {
            runtime.spawn(route(transport.clone(), routes.clone(), message));
        });
        let inbound = bridge
            .transport()
            .subscribe(bridge.outbound_address(), handler)
            .await?;

        info!("Routing calls from {}", bridge.outbound_address());

        Ok(Self {
            services,
            _inbound: inbound,
            _directory: registration,
        })
    }

    /// Currently published services.
    pub fn services(&self) -> Vec<ServiceDescriptor> {
        lock(&self.services).clone()
    }
}

async fn route(transport: Arc<dyn Transport>, services: Services, message: Bytes) {
    let call = match CallEnvelope::decode(&message) {
        Ok(call) => call,
        Err(e) => {
            warn!("Discarding undecodable call: {}", e);
            return;
        }
    };

    let destination = ServiceFilter::parse(&call.target_filter).map(|filter| {
        lock(&services)
            .iter()
            .find(|descriptor| filter.matches(descriptor))
            .map(|descriptor| descriptor.address.clone())
    });

    let detail = match destination {
        Ok(Some(address)) => {
            debug!("Routing call {} {} to {}", call.call_id, call.method_name, address);
            if let Err(e) = transport.send(&address, message).await {
                warn!("Failed to forward call {} to {}: {}", call.call_id, address, e);
            }
            return;
        }
        Ok(None) => format!("no service matches {}", call.target_filter),
        Err(e) => e.to_string(),
    };

    warn!("Cannot route call {}: {}", call.call_id, detail);
    let Some(reply_to) = call.reply_to.filter(|_| call.awaits_reply) else {
        return;
    };
    let fault = ResultEnvelope::fault(&call.call_id, FaultClass::NO_SUCH_SERVICE, detail);
    let sent = match fault.encode() {
        Ok(bytes) => transport.send(&reply_to, bytes).await,
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        warn!("Failed to report routing failure to {}: {}", reply_to, e);
    }
}

/// Stand-in for the remote service directory.
#[derive(Debug, Clone)]
pub struct DirectoryClient {
    proxy: RemoteProxy,
}

impl DirectoryClient {
    pub fn new(proxy: RemoteProxy) -> Self {
        Self { proxy }
    }

    pub async fn register(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        self.proxy.call_void("register", vec![wrap_model(descriptor)?]).await
    }

    /// Returns whether a matching entry was removed.
    pub async fn unregister(&self, interface: &str, id: &str) -> Result<bool> {
        self.proxy
            .call(
                "unregister",
                vec![Argument::of(&interface.to_string())?, Argument::of(&id.to_string())?],
            )
            .await
    }

    pub async fn list(&self) -> Result<Vec<ServiceDescriptor>> {
        self.proxy.call("list", vec![]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[test]
    fn test_directory_replaces_same_instance() {
        let directory = Directory {
            services: Arc::new(Mutex::new(Vec::new())),
        };
        directory.register(ServiceDescriptor::new("example.Echo", "svc-1", "a"));
        directory.register(ServiceDescriptor::new("example.Echo", "svc-2", "b"));
        directory.register(ServiceDescriptor::new("example.Echo", "svc-1", "c"));

        let list = directory.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].address, "c");

        assert!(directory.unregister("example.Echo", "svc-1"));
        assert!(!directory.unregister("example.Echo", "svc-1"));
    }

    #[test]
    fn test_descriptor_travels_as_model() {
        let descriptor =
            ServiceDescriptor::new("example.Echo", "svc-1", "a").with_property("tier", "gold");
        let arg = wrap_model(&descriptor).unwrap();
        assert_eq!(arg.type_name, Modeled::<ServiceDescriptor>::type_name());
    }

    #[tokio::test]
    async fn test_directory_is_listed_through_itself() {
        let transport = Arc::new(MemoryTransport::new());
        let bridge = Bridge::connect(transport).await.unwrap();
        let router = ServiceRouter::start(&bridge).await.unwrap();

        let listed = bridge.directory().list().await.unwrap();
        assert_eq!(listed, router.services());
        assert_eq!(listed[0].interface, DirectoryConfig::INTERFACE);
    }

    #[tokio::test]
    async fn test_unmatched_call_faults_with_no_such_service() {
        let transport = Arc::new(MemoryTransport::new());
        let bridge = Bridge::connect(transport).await.unwrap();
        let _router = ServiceRouter::start(&bridge).await.unwrap();

        let err = bridge
            .proxy(ServiceFilter::for_interface("example.Missing"))
            .call::<String>("anything", vec![])
            .await
            .unwrap_err();
        let fault = err.remote_fault().expect("routing failure is a remote fault");
        assert_eq!(fault.class_name, FaultClass::NO_SUCH_SERVICE);
        assert!(fault.is_dispatch_failure());
    }

    #[tokio::test]
    async fn test_malformed_filter_faults_with_no_such_service() {
        let transport = Arc::new(MemoryTransport::new());
        let bridge = Bridge::connect(transport).await.unwrap();
        let _router = ServiceRouter::start(&bridge).await.unwrap();

        let call = CallEnvelope::new("not a filter", "anything", vec![]);
        let call_id = bridge.send_call(call).await.unwrap();
        let result = bridge
            .await_reply(&call_id, &crate::CallOptions::default())
            .await
            .unwrap();
        assert_eq!(result.fault_class_name, FaultClass::NO_SUCH_SERVICE);
        assert!(result.fault_detail.contains("not a filter"));
    }
}
