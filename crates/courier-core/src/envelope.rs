//! Call and result envelopes.
//!
//! The logical wire shape of a remote call and of its result. Both carry the
//! call id used as correlation key. Envelopes are encoded as JSON; unknown
//! fields are ignored when decoding so either side may add fields.

use crate::codec::{encode_value, RemoteType};
use crate::config::MetadataKey;
use crate::error::Result;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// One positional argument of a call, with its declared type name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Argument {
    pub value: Value,
    pub type_name: String,
}

impl Argument {
    pub fn new(value: Value, type_name: impl Into<String>) -> Self {
        Self {
            value,
            type_name: type_name.into(),
        }
    }

    /// Encode a typed value as an argument.
    pub fn of<T: RemoteType>(value: &T) -> Result<Self> {
        Ok(Self {
            value: encode_value(value)?,
            type_name: T::type_name(),
        })
    }
}

/// An outbound method call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnvelope {
    pub target_filter: String,
    pub method_name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub args: Vec<Argument>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub call_id: String,
    #[serde(default)]
    pub principal: String,
    /// Opaque credentials, carried but never validated here.
    #[serde(default)]
    pub credentials: Value,
    #[serde(default)]
    pub awaits_reply: bool,
    /// Address the result must be sent to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl CallEnvelope {
    /// Create a call expecting a reply, with a fresh call id.
    pub fn new(
        target_filter: impl Into<String>,
        method_name: impl Into<String>,
        args: Vec<Argument>,
    ) -> Self {
        let target_filter = target_filter.into();
        let mut metadata = BTreeMap::new();
        metadata.insert(MetadataKey::SERVICE_FILTER.to_string(), target_filter.clone());
        Self {
            target_filter,
            method_name: method_name.into(),
            args,
            metadata,
            call_id: Uuid::new_v4().to_string(),
            principal: String::new(),
            credentials: Value::Null,
            awaits_reply: true,
            reply_to: None,
        }
    }

    /// Attach the caller identity.
    pub fn with_identity(mut self, principal: impl Into<String>, credentials: Value) -> Self {
        self.principal = principal.into();
        self.credentials = credentials;
        self
    }

    /// Mark this call as fire-and-forget.
    pub fn without_reply(mut self) -> Self {
        self.awaits_reply = false;
        self.reply_to = None;
        self
    }

    /// Declared type names of the arguments, in order.
    pub fn signature(&self) -> Vec<&str> {
        self.args.iter().map(|arg| arg.type_name.as_str()).collect()
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Which of the three outcomes a result holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultKind {
    Value,
    Void,
    Fault,
}

/// The outcome of a call, sent back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope {
    pub call_id: String,
    pub kind: ResultKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub payload_type_name: String,
    #[serde(default)]
    pub fault_class_name: String,
    #[serde(default)]
    pub fault_detail: String,
}

impl ResultEnvelope {
    /// A successful result carrying a value.
    pub fn value(
        call_id: impl Into<String>,
        payload: Value,
        payload_type_name: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            kind: ResultKind::Value,
            payload,
            payload_type_name: payload_type_name.into(),
            fault_class_name: String::new(),
            fault_detail: String::new(),
        }
    }

    /// A successful result of a method without a return value.
    pub fn void(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            kind: ResultKind::Void,
            payload: Value::Null,
            payload_type_name: String::new(),
            fault_class_name: String::new(),
            fault_detail: String::new(),
        }
    }

    /// A failure reported as data.
    pub fn fault(
        call_id: impl Into<String>,
        class_name: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            kind: ResultKind::Fault,
            payload: Value::Null,
            payload_type_name: String::new(),
            fault_class_name: class_name.into(),
            fault_detail: detail.into(),
        }
    }

    pub fn is_fault(&self) -> bool {
        self.kind == ResultKind::Fault
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Read just the call id of an encoded envelope of either kind.
pub fn peek_call_id(bytes: &[u8]) -> Result<String> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct CallIdOnly {
        call_id: String,
    }
    let header: CallIdOnly = serde_json::from_slice(bytes)?;
    Ok(header.call_id)
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<Argument>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Argument>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_call() -> CallEnvelope {
        CallEnvelope::new(
            "(&(objectClass=example.Echo)(id=svc-1))",
            "echo",
            vec![Argument::of(&"hello".to_string()).unwrap()],
        )
        .with_identity("admin", json!({"password": "secret"}))
    }

    #[test]
    fn test_new_call_defaults() {
        let call = sample_call();
        assert!(call.awaits_reply);
        assert!(Uuid::parse_str(&call.call_id).is_ok());
        assert_eq!(
            call.metadata.get(MetadataKey::SERVICE_FILTER),
            Some(&call.target_filter)
        );
        assert_eq!(call.signature(), vec!["string"]);
    }

    #[test]
    fn test_call_ids_are_unique() {
        let a = CallEnvelope::new("f", "m", vec![]);
        let b = CallEnvelope::new("f", "m", vec![]);
        assert_ne!(a.call_id, b.call_id);
    }

    #[test]
    fn test_call_envelope_roundtrip_keeps_all_fields() {
        let mut call = sample_call();
        call.reply_to = Some("CLIENT-1".into());
        let decoded = CallEnvelope::decode(&call.encode().unwrap()).unwrap();
        assert_eq!(decoded, call);
    }

    #[test]
    fn test_empty_args_encode_as_list() {
        let call = CallEnvelope::new("f", "ping", vec![]);
        let json: Value = serde_json::from_slice(&call.encode().unwrap()).unwrap();
        assert_eq!(json["args"], json!([]));

        let decoded = CallEnvelope::decode(&call.encode().unwrap()).unwrap();
        assert!(decoded.args.is_empty());
    }

    #[test]
    fn test_null_args_decode_as_empty() {
        let raw = br#"{"targetFilter":"f","methodName":"m","args":null,"callId":"c1"}"#;
        let call = CallEnvelope::decode(raw).unwrap();
        assert!(call.args.is_empty());
        assert!(!call.awaits_reply);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let raw = br#"{"callId":"c1","kind":"Void","futureField":{"x":1}}"#;
        let result = ResultEnvelope::decode(raw).unwrap();
        assert_eq!(result.kind, ResultKind::Void);
    }

    #[test]
    fn test_without_reply_clears_reply_address() {
        let mut call = sample_call();
        call.reply_to = Some("CLIENT-1".into());
        let call = call.without_reply();
        assert!(!call.awaits_reply);
        assert!(call.reply_to.is_none());
    }

    #[test]
    fn test_result_constructors_set_exactly_one_kind() {
        let value = ResultEnvelope::value("c", json!(42), "i32");
        assert_eq!(value.kind, ResultKind::Value);
        assert!(value.fault_class_name.is_empty());

        let void = ResultEnvelope::void("c");
        assert_eq!(void.kind, ResultKind::Void);
        assert_eq!(void.payload, Value::Null);

        let fault = ResultEnvelope::fault("c", "Boom", "trace");
        assert!(fault.is_fault());
        assert_eq!(fault.payload, Value::Null);
    }

    #[test]
    fn test_peek_call_id_reads_both_kinds() {
        let call = sample_call();
        assert_eq!(peek_call_id(&call.encode().unwrap()).unwrap(), call.call_id);

        let result = ResultEnvelope::void("abc");
        assert_eq!(peek_call_id(&result.encode().unwrap()).unwrap(), "abc");

        assert!(peek_call_id(b"not json").is_err());
    }
}
