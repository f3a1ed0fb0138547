//! Bridge configuration: ABI names and resource limits.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default guest memory cap (16MB)
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 16 * 1024 * 1024;

/// Default maximum module binary size (10MB)
pub const DEFAULT_MAX_MODULE_BYTES: usize = 10 * 1024 * 1024;

/// Names the guest module is linked against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbiNames {
    /// Exported linear memory
    pub memory: String,
    /// Exported allocation function: `(size) -> ptr`
    pub allocate: String,
    /// Exported release function: `(ptr)` or `(ptr, len)`
    pub release: String,
    /// Exported permission check: `(subject, resource, perm_ptr) -> i32`
    pub check_permission: String,
    /// Namespace of the host lookup import
    pub import_module: String,
    /// Name of the host lookup import: `(key_ptr) -> value_ptr`
    pub import_lookup: String,
}

impl AbiNames {
    /// Create the default ABI names
    #[must_use]
    pub fn new() -> Self {
        Self {
            memory: "memory".to_string(),
            allocate: "malloc".to_string(),
            release: "free".to_string(),
            check_permission: "hasPerm".to_string(),
            import_module: "app".to_string(),
            import_lookup: "getData".to_string(),
        }
    }

    /// Set the permission export name
    #[must_use]
    pub fn with_check_permission(mut self, name: impl Into<String>) -> Self {
        self.check_permission = name.into();
        self
    }

    /// Set the allocator export names
    #[must_use]
    pub fn with_allocator(mut self, allocate: impl Into<String>, release: impl Into<String>) -> Self {
        self.allocate = allocate.into();
        self.release = release.into();
        self
    }

    /// Set the lookup import namespace and name
    #[must_use]
    pub fn with_lookup_import(mut self, module: impl Into<String>, name: impl Into<String>) -> Self {
        self.import_module = module.into();
        self.import_lookup = name.into();
        self
    }
}

impl Default for AbiNames {
    fn default() -> Self {
        Self::new()
    }
}

/// How the lookup import reads the key the guest passes in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFraming {
    /// The key pointer addresses a NUL-terminated byte run
    #[default]
    NullTerminated,
    /// The key pointer addresses a `(data offset, byte length)` word pair
    LengthPrefixed,
}

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Guest ABI names
    pub abi: AbiNames,
    /// Key framing used by the lookup import
    pub key_framing: KeyFraming,
    /// Maximum guest linear memory in bytes
    pub max_memory_bytes: u64,
    /// Fuel budget per export call (unmetered when `None`)
    pub max_fuel: Option<u64>,
    /// Maximum module binary size in bytes
    pub max_module_bytes: usize,
    /// Maximum bytes scanned when reading a NUL-terminated string
    pub max_string_bytes: Option<u32>,
    /// Timeout for fetching the module and dataset, in milliseconds
    pub fetch_timeout_ms: Option<u64>,
}

impl BridgeConfig {
    /// Create a new bridge config
    #[must_use]
    pub fn new() -> Self {
        Self {
            abi: AbiNames::new(),
            key_framing: KeyFraming::default(),
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            max_fuel: None,
            max_module_bytes: DEFAULT_MAX_MODULE_BYTES,
            max_string_bytes: None,
            fetch_timeout_ms: None,
        }
    }

    /// Set the ABI names
    #[must_use]
    pub fn with_abi(mut self, abi: AbiNames) -> Self {
        self.abi = abi;
        self
    }

    /// Set the key framing for the lookup import
    #[must_use]
    pub fn with_key_framing(mut self, framing: KeyFraming) -> Self {
        self.key_framing = framing;
        self
    }

    /// Set the guest memory cap
    #[must_use]
    pub fn with_max_memory_bytes(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    /// Set the per-call fuel budget
    #[must_use]
    pub fn with_max_fuel(mut self, fuel: u64) -> Self {
        self.max_fuel = Some(fuel);
        self
    }

    /// Set the maximum module size
    #[must_use]
    pub fn with_max_module_bytes(mut self, bytes: usize) -> Self {
        self.max_module_bytes = bytes;
        self
    }

    /// Cap NUL-terminated string scans
    #[must_use]
    pub fn with_max_string_bytes(mut self, bytes: u32) -> Self {
        self.max_string_bytes = Some(bytes);
        self
    }

    /// Set the fetch timeout
    #[must_use]
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Get the fetch timeout
    #[must_use]
    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_names_default() {
        let abi = AbiNames::default();
        assert_eq!(abi.memory, "memory");
        assert_eq!(abi.allocate, "malloc");
        assert_eq!(abi.release, "free");
        assert_eq!(abi.check_permission, "hasPerm");
        assert_eq!(abi.import_module, "app");
        assert_eq!(abi.import_lookup, "getData");
    }

    #[test]
    fn test_abi_names_builders() {
        let abi = AbiNames::new()
            .with_check_permission("checkPermission")
            .with_allocator("allocate", "release")
            .with_lookup_import("host", "getValue");
        assert_eq!(abi.check_permission, "checkPermission");
        assert_eq!(abi.allocate, "allocate");
        assert_eq!(abi.release, "release");
        assert_eq!(abi.import_module, "host");
        assert_eq!(abi.import_lookup, "getValue");
    }

    #[test]
    fn test_bridge_config_new() {
        let config = BridgeConfig::new();
        assert_eq!(config.max_memory_bytes, 16 * 1024 * 1024);
        assert_eq!(config.max_module_bytes, 10 * 1024 * 1024);
        assert_eq!(config.key_framing, KeyFraming::NullTerminated);
        assert!(config.max_fuel.is_none());
        assert!(config.fetch_timeout().is_none());
    }

    #[test]
    fn test_bridge_config_with_fetch_timeout() {
        let config = BridgeConfig::new().with_fetch_timeout(Duration::from_secs(3));
        assert_eq!(config.fetch_timeout(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_bridge_config_partial_json() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{"key_framing":"length_prefixed","max_fuel":5000}"#).unwrap();
        assert_eq!(config.key_framing, KeyFraming::LengthPrefixed);
        assert_eq!(config.max_fuel, Some(5000));
        assert_eq!(config.abi, AbiNames::default());
    }
}
