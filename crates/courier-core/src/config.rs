//! Centralized configuration for Courier.
//!
//! Defaults for addressing, call timeouts, registry bounds and broker limits.
//! Runtime overrides go through [`crate::BridgeBuilder`].

use std::time::Duration;

/// Defaults for a [`crate::Bridge`].
pub struct BridgeConfig;

impl BridgeConfig {
    /// Well-known address every caller-originated call is sent to.
    pub const OUTBOUND_ADDRESS: &'static str = "receive";
    /// Prefix of the caller-specific reply address.
    pub const REPLY_ADDRESS_PREFIX: &'static str = "CLIENT-";
    /// How long a call waits for its reply before failing.
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);
    /// Maximum replies queued under one call id. One is the steady state;
    /// duplicate deliveries queue behind it up to this depth.
    pub const MAX_INBOX_DEPTH: usize = 8;
    /// How long an abandoned call id keeps rejecting late replies.
    pub const TOMBSTONE_TTL: Duration = Duration::from_secs(300);
    pub const MAX_TOMBSTONES: u64 = 100_000;
    /// Period of the orphaned-inbox sweep.
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
    /// Age after which an inbox nobody waits on is evicted.
    pub const STALE_INBOX_AGE: Duration = Duration::from_secs(300);
    /// Invocation history kept per dispatcher when enabled without a size.
    pub const DEFAULT_HISTORY_CAPACITY: usize = 64;
    pub const DEFAULT_PRINCIPAL: &'static str = "anonymous";
}

/// Defaults for the message broker and its transports.
pub struct BrokerConfig;

impl BrokerConfig {
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_CONNECTIONS: usize = 256;
    /// Messages buffered for an address that has no consumer yet.
    pub const MAX_PENDING_PER_ADDRESS: usize = 1024;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
}

/// Well-known names used by the service directory.
pub struct DirectoryConfig;

impl DirectoryConfig {
    pub const INTERFACE: &'static str = "courier.ServiceDirectory";
    pub const ADDRESS: &'static str = "courier.directory";
    pub const INSTANCE_ID: &'static str = "directory";
    /// Wire and model type name of a published service descriptor.
    pub const DESCRIPTOR_TYPE: &'static str = "courier.ServiceDescriptor";
}

/// Fault class names produced by the dispatch machinery itself.
///
/// Target-method failures carry the class name of the error the method
/// returned; these identify failures of the bridge around it.
pub struct FaultClass;

impl FaultClass {
    pub const PREFIX: &'static str = "courier.";
    pub const NO_SUCH_METHOD: &'static str = "courier.NoSuchMethod";
    pub const NO_SUCH_SERVICE: &'static str = "courier.NoSuchService";
    pub const ILLEGAL_ARGUMENT: &'static str = "courier.IllegalArgument";
    pub const INTERNAL: &'static str = "courier.InternalError";
    /// A target method panicked.
    pub const PANIC: &'static str = "panic";
}

/// Envelope metadata keys.
pub struct MetadataKey;

impl MetadataKey {
    pub const SERVICE_FILTER: &'static str = "serviceFilter";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(BridgeConfig::CALL_TIMEOUT > Duration::ZERO);
        assert!(BridgeConfig::STALE_INBOX_AGE >= BridgeConfig::CALL_TIMEOUT);
        assert!(BrokerConfig::CONNECT_TIMEOUT > Duration::ZERO);
    }

    #[test]
    fn test_internal_fault_classes_share_prefix() {
        for class in [
            FaultClass::NO_SUCH_METHOD,
            FaultClass::NO_SUCH_SERVICE,
            FaultClass::ILLEGAL_ARGUMENT,
            FaultClass::INTERNAL,
        ] {
            assert!(class.starts_with(FaultClass::PREFIX));
        }
        assert!(!FaultClass::PANIC.starts_with(FaultClass::PREFIX));
    }
}
