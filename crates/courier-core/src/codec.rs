//! Structured-value codec.
//!
//! Values cross the wire as JSON together with a declared type name. The type
//! name selects the handler on the receiving side and lets the caller convert
//! a reply back into its statically expected type.
//!
//! Structured "model" values can also travel as a [`ModelRecord`]: the
//! declared field set as key/value entries instead of the concrete type, so a
//! receiver that lacks the exact type can still rebuild an equivalent value.

use crate::envelope::Argument;
use crate::error::{BridgeError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// A type that can be passed to or returned from a remote method.
///
/// The type name is part of a method's wire signature, so both sides must
/// agree on it.
pub trait RemoteType: Serialize + DeserializeOwned + Send + 'static {
    /// `true` only for `()`, the return type of methods without a result.
    const VOID: bool = false;

    /// Wire name of this type.
    fn type_name() -> String;
}

macro_rules! remote_primitive {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl RemoteType for $ty {
                fn type_name() -> String {
                    $name.to_string()
                }
            }
        )*
    };
}

remote_primitive! {
    bool => "bool",
    i8 => "i8",
    i16 => "i16",
    i32 => "i32",
    i64 => "i64",
    u8 => "u8",
    u16 => "u16",
    u32 => "u32",
    u64 => "u64",
    f32 => "f32",
    f64 => "f64",
    char => "char",
    String => "string",
    Value => "any",
}

impl RemoteType for () {
    const VOID: bool = true;

    fn type_name() -> String {
        "void".to_string()
    }
}

impl<T: RemoteType> RemoteType for Vec<T> {
    fn type_name() -> String {
        format!("list<{}>", T::type_name())
    }
}

impl<T: RemoteType> RemoteType for Option<T> {
    fn type_name() -> String {
        format!("option<{}>", T::type_name())
    }
}

impl<T: RemoteType> RemoteType for BTreeMap<String, T> {
    fn type_name() -> String {
        format!("map<{}>", T::type_name())
    }
}

impl<T: RemoteType> RemoteType for HashMap<String, T> {
    fn type_name() -> String {
        format!("map<{}>", T::type_name())
    }
}

/// Encode a value for the wire.
pub fn encode_value<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Convert a wire value into the statically expected type.
///
/// The declared type name is advisory: a mismatch is logged, and conversion
/// still succeeds if the value has a compatible shape. Unknown fields in
/// structured values are ignored.
pub fn decode_value<T: RemoteType>(value: Value, declared_type: &str) -> Result<T> {
    let expected = T::type_name();
    if !declared_type.is_empty() && declared_type != expected {
        debug!(
            "Declared type {} differs from expected {}, converting by shape",
            declared_type, expected
        );
    }
    serde_json::from_value(value).map_err(|e| BridgeError::Codec {
        expected,
        message: e.to_string(),
    })
}

/// A structured value that can be captured as its declared field set.
///
/// Implementors only name their model type; the record conversion is derived
/// from the type's serde representation, which must be a JSON object.
pub trait Model: Serialize + DeserializeOwned + Send + 'static {
    /// Logical model type, shared by both sides of the wire.
    const MODEL_TYPE: &'static str;

    /// Capture this value as a field record.
    fn to_record(&self) -> Result<ModelRecord> {
        match serde_json::to_value(self)? {
            Value::Object(fields) => Ok(ModelRecord {
                model_type: Self::MODEL_TYPE.to_string(),
                entries: fields
                    .into_iter()
                    .map(|(key, value)| ModelEntry::new(key, value))
                    .collect(),
            }),
            other => Err(BridgeError::Codec {
                expected: Self::MODEL_TYPE.to_string(),
                message: format!("model must serialize to an object, got {}", kind_of(&other)),
            }),
        }
    }

    /// Rebuild a value from a field record.
    fn from_record(record: &ModelRecord) -> Result<Self> {
        if record.model_type != Self::MODEL_TYPE {
            return Err(BridgeError::Codec {
                expected: Self::MODEL_TYPE.to_string(),
                message: format!("record holds model type {}", record.model_type),
            });
        }
        serde_json::from_value(record.to_object()).map_err(|e| BridgeError::Codec {
            expected: Self::MODEL_TYPE.to_string(),
            message: e.to_string(),
        })
    }
}

/// One field of a captured model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEntry {
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub type_name: String,
}

impl ModelEntry {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        let type_name = kind_of(&value).to_string();
        Self {
            key: key.into(),
            value,
            type_name,
        }
    }
}

/// A model captured by its field entries rather than its concrete type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    pub model_type: String,
    #[serde(default)]
    pub entries: Vec<ModelEntry>,
}

impl ModelRecord {
    /// Look up a field by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| &entry.value)
    }

    /// The entries as a JSON object.
    pub fn to_object(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|entry| (entry.key.clone(), entry.value.clone()))
                .collect(),
        )
    }

    /// Rebuild a concrete model from this record.
    pub fn into_model<M: Model>(self) -> Result<M> {
        M::from_record(&self)
    }
}

impl RemoteType for ModelRecord {
    fn type_name() -> String {
        "model".to_string()
    }
}

/// Carries a [`Model`] over the wire in its captured record form.
#[derive(Debug, Clone, PartialEq)]
pub struct Modeled<M>(pub M);

impl<M> Modeled<M> {
    pub fn into_inner(self) -> M {
        self.0
    }
}

impl<M: Model> Serialize for Modeled<M> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let record = self.0.to_record().map_err(serde::ser::Error::custom)?;
        record.serialize(serializer)
    }
}

impl<'de, M: Model> Deserialize<'de> for Modeled<M> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let record = ModelRecord::deserialize(deserializer)?;
        M::from_record(&record)
            .map(Modeled)
            .map_err(serde::de::Error::custom)
    }
}

impl<M: Model> RemoteType for Modeled<M> {
    fn type_name() -> String {
        format!("model<{}>", M::MODEL_TYPE)
    }
}

/// Encode a model as an argument in record form.
pub fn wrap_model<M: Model>(model: &M) -> Result<Argument> {
    Ok(Argument::new(
        serde_json::to_value(model.to_record()?)?,
        Modeled::<M>::type_name(),
    ))
}

/// Rebuild a model from an argument, accepting both the record form and the
/// plain serialized form.
pub fn unwrap_model<M: Model>(arg: &Argument) -> Result<M> {
    if let Ok(record) = serde_json::from_value::<ModelRecord>(arg.value.clone()) {
        return M::from_record(&record);
    }
    serde_json::from_value(arg.value.clone()).map_err(|e| BridgeError::Codec {
        expected: M::MODEL_TYPE.to_string(),
        message: e.to_string(),
    })
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
