//! Error types for Courier.
//!
//! Everything that can go wrong on the caller side of a remote call is one of
//! these variants. Dispatcher-side failures never surface here directly; they
//! travel back over the wire as fault results and are rebuilt as
//! [`BridgeError::Remote`].

use std::time::Duration;
use thiserror::Error;

/// A failure reported by the remote side as data.
///
/// Carries the remote fault class name and its detail text. The remote
/// error type is never reconstructed locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFault {
    pub class_name: String,
    pub detail: String,
}

impl RemoteFault {
    pub fn new(class_name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            detail: detail.into(),
        }
    }

    /// Whether the fault came from the dispatch machinery rather than from
    /// the invoked method itself.
    pub fn is_dispatch_failure(&self) -> bool {
        self.class_name.starts_with(crate::config::FaultClass::PREFIX)
    }
}

impl std::fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First line of the detail is the message; the rest is the trace.
        let summary = self.detail.lines().next().unwrap_or_default();
        if summary.is_empty() {
            write!(f, "{}", self.class_name)
        } else {
            write!(f, "{}: {}", self.class_name, summary)
        }
    }
}

/// Main error type for the Courier library.
#[derive(Debug, Error)]
pub enum BridgeError {
    // Transport errors
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Remote call errors
    #[error("Remote fault: {0}")]
    Remote(RemoteFault),

    #[error("No reply for call {call_id} within {timeout:?}")]
    CorrelationTimeout { call_id: String, timeout: Duration },

    #[error("Call {call_id} was cancelled")]
    Cancelled { call_id: String },

    // Correlation registry errors
    #[error("Inbox for {key} is full ({depth} pending), dropping duplicate reply")]
    InboxFull { key: String, depth: usize },

    #[error("Reply for {key} arrived after the call finished")]
    LateReply { key: String },

    // Registration errors
    #[error("Address already registered: {address}")]
    AlreadyRegistered { address: String },

    // Serialization errors
    #[error("Invalid service filter {filter:?}: {message}")]
    InvalidFilter { filter: String, message: String },

    #[error("Cannot convert value to {expected}: {message}")]
    Codec { expected: String, message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for Courier operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<RemoteFault> for BridgeError {
    fn from(fault: RemoteFault) -> Self {
        BridgeError::Remote(fault)
    }
}

impl BridgeError {
    /// Create a transport error without an underlying IO cause.
    pub fn transport(message: impl Into<String>) -> Self {
        BridgeError::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// The remote fault, if this error describes one.
    pub fn remote_fault(&self) -> Option<&RemoteFault> {
        match self {
            BridgeError::Remote(fault) => Some(fault),
            _ => None,
        }
    }

    /// Check if the remote side ran and reported a fault.
    pub fn is_remote(&self) -> bool {
        matches!(self, BridgeError::Remote(_))
    }

    /// Check if the call was abandoned for lack of a reply.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::CorrelationTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FaultClass;

    #[test]
    fn test_error_display() {
        let err = BridgeError::CorrelationTimeout {
            call_id: "abc".into(),
            timeout: Duration::from_secs(2),
        };
        assert_eq!(err.to_string(), "No reply for call abc within 2s");
    }

    #[test]
    fn test_remote_fault_display_uses_first_detail_line() {
        let fault = RemoteFault::new("DivideByZero", "cannot divide 4 by 0\n  at divide");
        assert_eq!(fault.to_string(), "DivideByZero: cannot divide 4 by 0");

        let bare = RemoteFault::new("Boom", "");
        assert_eq!(bare.to_string(), "Boom");
    }

    #[test]
    fn test_dispatch_failures_are_recognised_by_class_name() {
        assert!(RemoteFault::new(FaultClass::NO_SUCH_METHOD, "").is_dispatch_failure());
        assert!(!RemoteFault::new("DivideByZero", "").is_dispatch_failure());
    }

    #[test]
    fn test_error_predicates() {
        let remote: BridgeError = RemoteFault::new("X", "y").into();
        assert!(remote.is_remote());
        assert!(!remote.is_timeout());
        assert_eq!(remote.remote_fault().map(|f| f.class_name.as_str()), Some("X"));
        assert!(BridgeError::transport("down").remote_fault().is_none());
    }
}
