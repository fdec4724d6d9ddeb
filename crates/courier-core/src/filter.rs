//! Service addressing.
//!
//! A [`ServiceFilter`] names the target of a call: an interface plus either an
//! instance id or a set of property predicates. Its canonical string form
//! is an LDAP-style conjunction:
//!
//! ```text
//! (&(objectClass=example.Echo)(id=svc-1))
//! (&(objectClass=example.Echo)(location=eu)(tier=gold))
//! ```
//!
//! When an instance id is present the properties are not rendered; the id
//! alone selects the instance.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const OBJECT_CLASS: &str = "objectClass";
const INSTANCE_ID: &str = "id";

/// Routing expression identifying the service a call is meant for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceFilter {
    pub interface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl ServiceFilter {
    /// Match any instance of an interface.
    pub fn for_interface(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            instance_id: None,
            properties: BTreeMap::new(),
        }
    }

    /// Restrict to one instance id. Takes precedence over properties.
    pub fn with_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Add a property predicate.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Render the canonical filter string.
    pub fn to_filter_string(&self) -> String {
        let mut out = String::with_capacity(128);
        out.push_str("(&");
        push_clause(&mut out, OBJECT_CLASS, &self.interface);
        match &self.instance_id {
            Some(id) => push_clause(&mut out, INSTANCE_ID, id),
            None => {
                for (key, value) in &self.properties {
                    push_clause(&mut out, key, value);
                }
            }
        }
        out.push(')');
        out
    }

    /// Parse a filter string produced by [`ServiceFilter::to_filter_string`]
    /// or the bare single-clause form `(objectClass=I)`.
    pub fn parse(filter: &str) -> Result<Self> {
        let invalid = |message: &str| BridgeError::InvalidFilter {
            filter: filter.to_string(),
            message: message.to_string(),
        };

        let trimmed = filter.trim();
        let body = if let Some(rest) = trimmed.strip_prefix("(&") {
            rest.strip_suffix(')')
                .ok_or_else(|| invalid("unterminated conjunction"))?
        } else {
            trimmed
        };

        let mut interface = None;
        let mut instance_id = None;
        let mut properties = BTreeMap::new();

        let mut rest = body;
        while !rest.is_empty() {
            let clause = rest
                .strip_prefix('(')
                .ok_or_else(|| invalid("expected '('"))?;
            let end = clause.find(')').ok_or_else(|| invalid("expected ')'"))?;
            let (key, value) = clause[..end]
                .split_once('=')
                .ok_or_else(|| invalid("clause without '='"))?;
            if key.is_empty() {
                return Err(invalid("clause without attribute name"));
            }
            let key = unescape(key).ok_or_else(|| invalid("bad escape sequence"))?;
            let value = unescape(value).ok_or_else(|| invalid("bad escape sequence"))?;
            match key.as_str() {
                OBJECT_CLASS => interface = Some(value),
                INSTANCE_ID => instance_id = Some(value),
                _ => {
                    properties.insert(key, value);
                }
            }
            rest = &clause[end + 1..];
        }

        let interface = interface.ok_or_else(|| invalid("missing objectClass clause"))?;
        if instance_id.is_some() {
            properties.clear();
        }
        Ok(Self {
            interface,
            instance_id,
            properties,
        })
    }

    /// Whether a published service satisfies this filter.
    pub fn matches(&self, descriptor: &ServiceDescriptor) -> bool {
        if self.interface != descriptor.interface {
            return false;
        }
        match &self.instance_id {
            Some(id) => descriptor.id == *id,
            None => self
                .properties
                .iter()
                .all(|(key, value)| descriptor.properties.get(key) == Some(value)),
        }
    }
}

impl std::fmt::Display for ServiceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_filter_string())
    }
}

/// A service as published to the directory: what it is and where it listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub interface: String,
    pub id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    pub address: String,
}

impl ServiceDescriptor {
    pub fn new(
        interface: impl Into<String>,
        id: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            interface: interface.into(),
            id: id.into(),
            properties: BTreeMap::new(),
            address: address.into(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// The filter selecting exactly this instance.
    pub fn filter(&self) -> ServiceFilter {
        ServiceFilter::for_interface(&self.interface).with_id(&self.id)
    }
}

fn push_clause(out: &mut String, key: &str, value: &str) {
    out.push('(');
    push_escaped(out, key);
    out.push('=');
    push_escaped(out, value);
    out.push(')');
}

fn push_escaped(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '*' => out.push_str("\\2a"),
            '=' => out.push_str("\\3d"),
            '\\' => out.push_str("\\5c"),
            _ => out.push(c),
        }
    }
}

fn unescape(value: &str) -> Option<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let hi = chars.next()?.to_digit(16)?;
        let lo = chars.next()?.to_digit(16)?;
        out.push(char::from_u32(hi * 16 + lo)?);
    }
    Some(out)
}
