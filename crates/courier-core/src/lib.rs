//! Courier Core - bidirectional RPC over a plain message channel.
//!
//! A process uses a [`Bridge`] to call remote services through [`RemoteProxy`]
//! stand-ins and to publish local objects, wrapped in a [`Dispatcher`], under
//! an address. The only thing the bridge needs from the channel is the
//! [`Transport`] trait: send bytes to an address and subscribe to an address.
//!
//! Many calls can be in flight over one reply address at once; the
//! [`CorrelationRegistry`] matches each reply to its caller by call id.
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_core::{Argument, Bridge, MemoryTransport, MethodTable, ServiceDescriptor,
//!     ServiceFilter, ServiceRouter};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[tokio::main]
//! async fn main() -> courier_core::Result<()> {
//!     let transport = Arc::new(MemoryTransport::new());
//!     let bridge = courier_core::Bridge::connect(transport).await?;
//!     let _router = ServiceRouter::start(&bridge).await?;
//!
//!     let echo = MethodTable::builder(Echo)
//!         .method1("echo", |_: &Echo, text: String| Ok(text))
//!         .into_dispatcher();
//!     let _service = bridge
//!         .publish(ServiceDescriptor::new("example.Echo", "svc-1", "svc-1"), echo)
//!         .await?;
//!
//!     let proxy = bridge.proxy(ServiceFilter::for_interface("example.Echo").with_id("svc-1"));
//!     let reply: String = proxy.call("echo", vec![Argument::of(&"hello".to_string())?]).await?;
//!     assert_eq!(reply, "hello");
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod broker;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod directory;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod filter;
pub mod proxy;
pub mod transport;

// Re-export commonly used types
pub use bridge::{Bridge, BridgeBuilder, PublishedService, Registration};
pub use broker::{BrokerHandle, BrokerServer, BrokerStats};
pub use cancel::{CancellationToken, CancelledError};
pub use codec::{
    decode_value, encode_value, unwrap_model, wrap_model, Model, ModelEntry, ModelRecord, Modeled,
    RemoteType,
};
pub use config::{BridgeConfig, BrokerConfig, DirectoryConfig, FaultClass, MetadataKey};
pub use correlation::CorrelationRegistry;
pub use directory::{DirectoryClient, ServiceRouter};
pub use dispatcher::{
    Dispatcher, Invocation, MethodResult, MethodTable, MethodTableBuilder, ServiceError,
};
pub use envelope::{peek_call_id, Argument, CallEnvelope, ResultEnvelope, ResultKind};
pub use error::{BridgeError, RemoteFault, Result};
pub use filter::{ServiceDescriptor, ServiceFilter};
pub use proxy::{CallOptions, CallTimeout, RemoteProxy, Reply};
pub use transport::{
    AddressStats, MemoryTransport, MessageHandler, Subscription, TcpTransport, Transport,
};
