//! Outbound invocation proxy.
//!
//! A [`RemoteProxy`] stands in for a remote service. Each method call becomes
//! a [`CallEnvelope`] sent through the bridge; the calling task suspends until
//! the correlated [`ResultEnvelope`] arrives, then unwraps it.
//!
//! Typed stand-ins for a concrete interface are thin wrappers forwarding to
//! [`RemoteProxy::call`]:
//!
//! ```ignore
//! struct EchoClient(RemoteProxy);
//!
//! impl EchoClient {
//!     async fn echo(&self, text: &str) -> courier_core::Result<String> {
//!         self.0.call("echo", vec![Argument::of(&text.to_string())?]).await
//!     }
//! }
//! ```

use crate::bridge::Bridge;
use crate::cancel::CancellationToken;
use crate::codec::{decode_value, RemoteType};
use crate::envelope::{Argument, CallEnvelope, ResultKind};
use crate::error::{BridgeError, RemoteFault, Result};
use crate::filter::ServiceFilter;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tracing::debug;

/// How long a call waits for its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallTimeout {
    /// Use the bridge's call timeout.
    #[default]
    Default,
    After(Duration),
    /// Wait without bound.
    Never,
}

impl CallTimeout {
    pub(crate) fn resolve(self, bridge_default: Option<Duration>) -> Option<Duration> {
        match self {
            CallTimeout::Default => bridge_default,
            CallTimeout::After(limit) => Some(limit),
            CallTimeout::Never => None,
        }
    }
}

/// Per-call settings.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: CallTimeout,
    pub cancel: Option<CancellationToken>,
    /// Extra metadata merged into the envelope.
    pub metadata: BTreeMap<String, String>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = CallTimeout::After(timeout);
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.timeout = CallTimeout::Never;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A successful call outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Value { payload: Value, type_name: String },
    Void,
}

impl Reply {
    pub fn is_void(&self) -> bool {
        matches!(self, Reply::Void)
    }

    /// Convert into the statically expected return type.
    pub fn into_value<R: RemoteType>(self) -> Result<R> {
        match self {
            Reply::Value { payload, type_name } => decode_value(payload, &type_name),
            Reply::Void if R::VOID => decode_value(Value::Null, ""),
            Reply::Void => Err(BridgeError::Codec {
                expected: R::type_name(),
                message: "remote method returned no value".to_string(),
            }),
        }
    }
}

const TO_STRING: &str = "to_string";
const HASH_CODE: &str = "hash_code";
const EQUALS: &str = "equals";

/// Stand-in for one remote service.
#[derive(Clone)]
pub struct RemoteProxy {
    bridge: Bridge,
    filter: ServiceFilter,
    target: String,
}

impl RemoteProxy {
    pub(crate) fn new(bridge: Bridge, filter: ServiceFilter) -> Self {
        let target = filter.to_filter_string();
        Self {
            bridge,
            filter,
            target,
        }
    }

    pub fn filter(&self) -> &ServiceFilter {
        &self.filter
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Invoke `method` remotely and wait for its outcome.
    ///
    /// `None` arguments are sent as an empty list. `to_string`, `hash_code`
    /// and `equals` are answered locally without a round trip. A remote
    /// failure comes back as [`BridgeError::Remote`].
    pub async fn invoke(
        &self,
        method: &str,
        args: Option<Vec<Argument>>,
        options: &CallOptions,
    ) -> Result<Reply> {
        let args = args.unwrap_or_default();
        if let Some(reply) = self.answer_locally(method, &args) {
            return Ok(reply);
        }

        let mut call = CallEnvelope::new(&self.target, method, args);
        call.metadata.extend(options.metadata.clone());
        if let Some(token) = &options.cancel {
            token.check().map_err(|_| BridgeError::Cancelled {
                call_id: call.call_id.clone(),
            })?;
        }

        let call_id = self.bridge.send_call(call).await?;
        let result = self.bridge.await_reply(&call_id, options).await?;

        match result.kind {
            ResultKind::Fault => {
                debug!("Call {} {} faulted: {}", call_id, method, result.fault_class_name);
                Err(RemoteFault::new(result.fault_class_name, result.fault_detail).into())
            }
            ResultKind::Void => Ok(Reply::Void),
            ResultKind::Value => Ok(Reply::Value {
                payload: result.payload,
                type_name: result.payload_type_name,
            }),
        }
    }

    /// Invoke with default options and convert the result to `R`.
    pub async fn call<R: RemoteType>(&self, method: &str, args: Vec<Argument>) -> Result<R> {
        self.call_with(method, args, &CallOptions::default()).await
    }

    pub async fn call_with<R: RemoteType>(
        &self,
        method: &str,
        args: Vec<Argument>,
        options: &CallOptions,
    ) -> Result<R> {
        self.invoke(method, Some(args), options).await?.into_value()
    }

    /// Invoke a method without a return value.
    pub async fn call_void(&self, method: &str, args: Vec<Argument>) -> Result<()> {
        self.invoke(method, Some(args), &CallOptions::default()).await.map(|_| ())
    }

    /// Send a call without waiting for, or receiving, a reply.
    pub async fn notify(&self, method: &str, args: Vec<Argument>) -> Result<()> {
        let call = CallEnvelope::new(&self.target, method, args).without_reply();
        self.bridge.send_call(call).await.map(|_| ())
    }

    fn answer_locally(&self, method: &str, args: &[Argument]) -> Option<Reply> {
        match (method, args) {
            (TO_STRING, []) => Some(Reply::Value {
                payload: Value::String(self.to_string()),
                type_name: String::type_name(),
            }),
            (HASH_CODE, []) => {
                let mut hasher = DefaultHasher::new();
                self.hash(&mut hasher);
                Some(Reply::Value {
                    payload: Value::from(hasher.finish()),
                    type_name: u64::type_name(),
                })
            }
            (EQUALS, [other]) => Some(Reply::Value {
                payload: Value::Bool(other.value.as_str() == Some(self.target.as_str())),
                type_name: bool::type_name(),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for RemoteProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RemoteProxy[{}]", self.target)
    }
}

impl std::fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("target", &self.target)
            .field("reply_address", &self.bridge.reply_address())
            .finish()
    }
}

impl PartialEq for RemoteProxy {
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target && self.bridge.same_bridge(&other.bridge)
    }
}

impl Eq for RemoteProxy {}

impl Hash for RemoteProxy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.target.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, Transport};
    use serde_json::json;
    use std::sync::Arc;

    async fn bridge() -> (Arc<MemoryTransport>, Bridge) {
        let transport = Arc::new(MemoryTransport::new());
        let bridge = Bridge::builder(transport.clone())
            .call_timeout(Some(Duration::from_millis(200)))
            .build()
            .await
            .unwrap();
        (transport, bridge)
    }

    fn echo_filter() -> ServiceFilter {
        ServiceFilter::for_interface("example.Echo").with_id("svc-1")
    }

    #[tokio::test]
    async fn test_base_object_methods_answer_without_sending() {
        let (transport, bridge) = bridge().await;
        let proxy = bridge.proxy(echo_filter());

        let text: String = proxy.call("to_string", vec![]).await.unwrap();
        assert_eq!(text, "RemoteProxy[(&(objectClass=example.Echo)(id=svc-1))]");

        let _: u64 = proxy.call("hash_code", vec![]).await.unwrap();

        let same = Argument::of(&echo_filter().to_filter_string()).unwrap();
        assert!(proxy.call::<bool>("equals", vec![same]).await.unwrap());

        // Nothing reached the outbound address.
        assert!(transport.stats().iter().all(|a| a.address != "receive"));
    }

    #[tokio::test]
    async fn test_proxy_equality_and_hash_follow_filter() {
        let (_, bridge) = bridge().await;
        let a = bridge.proxy(echo_filter());
        let b = bridge.proxy(echo_filter());
        let c = bridge.proxy(ServiceFilter::for_interface("example.Echo").with_id("svc-2"));

        assert_eq!(a, b);
        assert_ne!(a, c);

        let hash = |p: &RemoteProxy| {
            let mut h = DefaultHasher::new();
            p.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(&a), hash(&b));
    }

    #[tokio::test]
    async fn test_null_args_are_sent_as_empty_list() {
        let (transport, bridge) = bridge().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _tap = transport
            .subscribe(
                "receive",
                Arc::new(move |m: bytes::Bytes| {
                    let _ = tx.send(m);
                }),
            )
            .await
            .unwrap();

        let proxy = bridge.proxy(echo_filter());
        let options = CallOptions::default()
            .with_timeout(Duration::from_millis(20))
            .with_metadata("trace", "t-1");
        let err = proxy.invoke("ping", None, &options).await.unwrap_err();
        assert!(err.is_timeout());

        let sent = CallEnvelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert!(sent.args.is_empty());
        assert!(sent.awaits_reply);
        assert_eq!(sent.metadata.get("trace").map(String::as_str), Some("t-1"));
        assert_eq!(sent.target_filter, echo_filter().to_filter_string());
    }

    #[tokio::test]
    async fn test_already_cancelled_call_is_not_sent() {
        let (transport, bridge) = bridge().await;
        let token = CancellationToken::new();
        token.cancel();

        let options = CallOptions::default().with_cancel(token);
        let err = bridge
            .proxy(echo_filter())
            .invoke("ping", None, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled { .. }));
        assert!(transport.stats().iter().all(|a| a.address != "receive"));
    }

    #[test]
    fn test_reply_conversion() {
        let value = Reply::Value {
            payload: json!("hello"),
            type_name: "string".into(),
        };
        assert_eq!(value.into_value::<String>().unwrap(), "hello");

        assert!(Reply::Void.into_value::<()>().is_ok());
        assert!(matches!(
            Reply::Void.into_value::<String>(),
            Err(BridgeError::Codec { .. })
        ));
    }

    #[test]
    fn test_call_timeout_resolution() {
        let bridge_default = Some(Duration::from_secs(30));
        assert_eq!(CallTimeout::Default.resolve(bridge_default), bridge_default);
        assert_eq!(
            CallTimeout::After(Duration::from_secs(1)).resolve(bridge_default),
            Some(Duration::from_secs(1))
        );
        assert_eq!(CallTimeout::Never.resolve(bridge_default), None);
    }
}
