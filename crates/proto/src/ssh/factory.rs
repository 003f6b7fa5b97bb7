//! Factory manager: named algorithm factories and configuration.
//!
//! One [`FactoryManager`] is shared by every session of a client or server
//! instance. It carries the preference-ordered algorithm lists the local
//! KEXINIT proposal is built from, creates cipher/MAC/compression/KEX
//! instances by negotiated name, and holds the string-keyed configuration
//! properties with their transport defaults.

use crate::ssh::crypto::{
    Cipher, CipherAlgorithm, Compression, CompressionAlgorithm, Mac, MacAlgorithm, Random,
    RandomFactory, SystemRandomFactory,
};
use crate::ssh::kex::KexFactory;
use crate::ssh::service::ServiceFactory;
use crate::ssh::version::Version;
use skiff_platform::{SkiffError, SkiffResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Property key: milliseconds until an unauthenticated session disconnects.
pub const AUTH_TIMEOUT: &str = "auth-timeout";
/// Property key: milliseconds of inactivity before disconnect.
pub const IDLE_TIMEOUT: &str = "idle-timeout";
/// Property key: grace milliseconds for the DISCONNECT write.
pub const DISCONNECT_TIMEOUT: &str = "disconnect-timeout";
/// Property key: rekey after this many bytes in either direction.
pub const REKEY_BYTES_LIMIT: &str = "rekey-bytes-limit";
/// Property key: rekey after this many milliseconds since key install.
pub const REKEY_TIME_LIMIT: &str = "rekey-time-limit";
/// Property key: server-side cap on failed authentication attempts.
pub const MAX_AUTH_REQUESTS: &str = "max-auth-requests";
/// Property key: optional pre-authentication banner text.
pub const WELCOME_BANNER: &str = "welcome-banner";
/// Property key: language tag for the welcome banner.
pub const WELCOME_BANNER_LANGUAGE: &str = "welcome-banner-language";

/// Default authentication timeout: 2 minutes.
pub const DEFAULT_AUTH_TIMEOUT_MS: u64 = 120_000;
/// Default idle timeout: 10 minutes.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 600_000;
/// Default disconnect grace: 10 seconds.
pub const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 10_000;
/// Default rekey byte trigger: 1 GiB.
pub const DEFAULT_REKEY_BYTES_LIMIT: u64 = 1024 * 1024 * 1024;
/// Default rekey time trigger: 1 hour.
pub const DEFAULT_REKEY_TIME_LIMIT_MS: u64 = 3_600_000;
/// Default cap on failed authentication attempts.
pub const DEFAULT_MAX_AUTH_REQUESTS: u64 = 20;
/// Default welcome banner language tag.
pub const DEFAULT_WELCOME_BANNER_LANGUAGE: &str = "en";

/// Named factories and configuration shared across sessions.
pub struct FactoryManager {
    version: Version,
    ciphers: Vec<CipherAlgorithm>,
    macs: Vec<MacAlgorithm>,
    compressions: Vec<CompressionAlgorithm>,
    kex_factories: Vec<Arc<dyn KexFactory>>,
    service_factories: Vec<Arc<dyn ServiceFactory>>,
    host_key_algorithms: Vec<String>,
    random_factory: Arc<dyn RandomFactory>,
    properties: HashMap<String, String>,
}

impl FactoryManager {
    /// Creates a manager with the default algorithm set and no KEX,
    /// service, or host-key entries (those depend on external
    /// collaborators and must be registered by the embedder).
    pub fn new() -> Self {
        Self {
            version: Version::default_skiff(),
            ciphers: vec![CipherAlgorithm::Aes128Ctr, CipherAlgorithm::Aes256Ctr],
            macs: vec![
                MacAlgorithm::HmacSha256,
                MacAlgorithm::HmacSha512,
                MacAlgorithm::HmacSha1,
            ],
            compressions: vec![CompressionAlgorithm::None],
            kex_factories: Vec::new(),
            service_factories: Vec::new(),
            host_key_algorithms: Vec::new(),
            random_factory: Arc::new(SystemRandomFactory),
            properties: HashMap::new(),
        }
    }

    /// Replaces the identification version sent in the banner.
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Returns the local identification version.
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Replaces the cipher preference list.
    pub fn set_ciphers(&mut self, ciphers: Vec<CipherAlgorithm>) {
        self.ciphers = ciphers;
    }

    /// Replaces the MAC preference list.
    pub fn set_macs(&mut self, macs: Vec<MacAlgorithm>) {
        self.macs = macs;
    }

    /// Replaces the compression preference list.
    pub fn set_compressions(&mut self, compressions: Vec<CompressionAlgorithm>) {
        self.compressions = compressions;
    }

    /// Registers a key exchange factory (appended in preference order).
    pub fn add_kex_factory(&mut self, factory: Arc<dyn KexFactory>) {
        self.kex_factories.push(factory);
    }

    /// Registers a service factory.
    pub fn add_service_factory(&mut self, factory: Arc<dyn ServiceFactory>) {
        self.service_factories.push(factory);
    }

    /// Replaces the host key algorithm list offered in the proposal.
    pub fn set_host_key_algorithms(&mut self, algorithms: Vec<String>) {
        self.host_key_algorithms = algorithms;
    }

    /// Replaces the PRNG factory.
    pub fn set_random_factory(&mut self, factory: Arc<dyn RandomFactory>) {
        self.random_factory = factory;
    }

    /// Sets a configuration property.
    pub fn set_property(&mut self, key: &str, value: impl Into<String>) {
        self.properties.insert(key.to_string(), value.into());
    }

    // --- name lists for the local proposal ---

    /// Comma-joined cipher names, preference order preserved.
    pub fn cipher_names(&self) -> String {
        join_names(self.ciphers.iter().map(|c| c.name()))
    }

    /// Comma-joined MAC names.
    pub fn mac_names(&self) -> String {
        join_names(self.macs.iter().map(|m| m.name()))
    }

    /// Comma-joined compression names.
    pub fn compression_names(&self) -> String {
        join_names(self.compressions.iter().map(|c| c.name()))
    }

    /// Comma-joined key exchange names.
    pub fn kex_names(&self) -> String {
        join_names(self.kex_factories.iter().map(|f| f.name().to_string()))
    }

    /// Comma-joined host key algorithm names.
    pub fn host_key_names(&self) -> String {
        join_names(self.host_key_algorithms.iter().cloned())
    }

    // --- named lookups ---

    /// Creates a cipher by negotiated name.
    pub fn create_cipher(&self, name: &str) -> SkiffResult<Box<dyn Cipher>> {
        self.ciphers
            .iter()
            .find(|c| c.name() == name)
            .map(|c| c.create())
            .ok_or_else(|| SkiffError::KeyExchange(format!("Unknown cipher: {}", name)))
    }

    /// Creates a MAC by negotiated name.
    pub fn create_mac(&self, name: &str) -> SkiffResult<Box<dyn Mac>> {
        self.macs
            .iter()
            .find(|m| m.name() == name)
            .map(|m| m.create())
            .ok_or_else(|| SkiffError::KeyExchange(format!("Unknown mac: {}", name)))
    }

    /// Creates a compression stream by negotiated name.
    ///
    /// `Ok(None)` means the `none` algorithm.
    pub fn create_compression(&self, name: &str) -> SkiffResult<Option<Box<dyn Compression>>> {
        self.compressions
            .iter()
            .find(|c| c.name() == name)
            .map(|c| c.create())
            .ok_or_else(|| SkiffError::KeyExchange(format!("Unknown compression: {}", name)))
    }

    /// Returns the registered key exchange factories.
    pub fn kex_factories(&self) -> &[Arc<dyn KexFactory>] {
        &self.kex_factories
    }

    /// Finds a service factory by requested name.
    pub fn find_service_factory(&self, name: &str) -> Option<&Arc<dyn ServiceFactory>> {
        self.service_factories.iter().find(|f| f.name() == name)
    }

    /// Creates a session PRNG.
    pub fn create_random(&self) -> Box<dyn Random> {
        self.random_factory.create()
    }

    // --- typed property access ---

    /// Returns a property as a string.
    pub fn string_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Returns a property parsed as `u64`, or the default when absent or
    /// unparsable.
    pub fn long_property(&self, key: &str, default: u64) -> u64 {
        match self.properties.get(key).map(|v| v.parse::<u64>()) {
            Some(Ok(value)) => value,
            Some(Err(_)) => {
                tracing::debug!(key, "Ignoring unparsable property value");
                default
            }
            None => default,
        }
    }

    /// Authentication timeout in milliseconds.
    pub fn auth_timeout_ms(&self) -> u64 {
        self.long_property(AUTH_TIMEOUT, DEFAULT_AUTH_TIMEOUT_MS)
    }

    /// Idle timeout in milliseconds.
    pub fn idle_timeout_ms(&self) -> u64 {
        self.long_property(IDLE_TIMEOUT, DEFAULT_IDLE_TIMEOUT_MS)
    }

    /// Disconnect write grace in milliseconds.
    pub fn disconnect_timeout_ms(&self) -> u64 {
        self.long_property(DISCONNECT_TIMEOUT, DEFAULT_DISCONNECT_TIMEOUT_MS)
    }

    /// Rekey byte-count trigger.
    pub fn rekey_bytes_limit(&self) -> u64 {
        self.long_property(REKEY_BYTES_LIMIT, DEFAULT_REKEY_BYTES_LIMIT)
    }

    /// Rekey time trigger in milliseconds.
    pub fn rekey_time_limit_ms(&self) -> u64 {
        self.long_property(REKEY_TIME_LIMIT, DEFAULT_REKEY_TIME_LIMIT_MS)
    }

    /// Server-side cap on failed authentication attempts.
    pub fn max_auth_requests(&self) -> u64 {
        self.long_property(MAX_AUTH_REQUESTS, DEFAULT_MAX_AUTH_REQUESTS)
    }

    /// Optional pre-authentication banner and its language tag.
    pub fn welcome_banner(&self) -> Option<(&str, &str)> {
        self.string_property(WELCOME_BANNER).map(|text| {
            (
                text,
                self.string_property(WELCOME_BANNER_LANGUAGE)
                    .unwrap_or(DEFAULT_WELCOME_BANNER_LANGUAGE),
            )
        })
    }
}

impl Default for FactoryManager {
    fn default() -> Self {
        Self::new()
    }
}

fn join_names<I, S>(names: I) -> String
where
    I: Iterator<Item = S>,
    S: AsRef<str>,
{
    names
        .map(|n| n.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_name_lists() {
        let manager = FactoryManager::new();
        assert_eq!(manager.cipher_names(), "aes128-ctr,aes256-ctr");
        assert_eq!(
            manager.mac_names(),
            "hmac-sha2-256,hmac-sha2-512,hmac-sha1"
        );
        assert_eq!(manager.compression_names(), "none");
        assert_eq!(manager.kex_names(), "");
    }

    #[test]
    fn test_named_lookup() {
        let manager = FactoryManager::new();
        assert!(manager.create_cipher("aes128-ctr").is_ok());
        assert!(manager.create_mac("hmac-sha2-256").is_ok());
        assert!(manager.create_compression("none").unwrap().is_none());

        assert!(matches!(
            manager.create_cipher("3des-cbc"),
            Err(SkiffError::KeyExchange(_))
        ));
    }

    #[test]
    fn test_property_defaults() {
        let manager = FactoryManager::new();
        assert_eq!(manager.auth_timeout_ms(), 120_000);
        assert_eq!(manager.idle_timeout_ms(), 600_000);
        assert_eq!(manager.disconnect_timeout_ms(), 10_000);
        assert_eq!(manager.rekey_bytes_limit(), 1 << 30);
        assert_eq!(manager.rekey_time_limit_ms(), 3_600_000);
        assert_eq!(manager.max_auth_requests(), 20);
        assert!(manager.welcome_banner().is_none());
    }

    #[test]
    fn test_property_overrides() {
        let mut manager = FactoryManager::new();
        manager.set_property(AUTH_TIMEOUT, "5000");
        manager.set_property(WELCOME_BANNER, "Authorized use only");

        assert_eq!(manager.auth_timeout_ms(), 5000);
        assert_eq!(
            manager.welcome_banner(),
            Some(("Authorized use only", "en"))
        );
    }

    #[test]
    fn test_unparsable_property_falls_back() {
        let mut manager = FactoryManager::new();
        manager.set_property(IDLE_TIMEOUT, "soon");
        assert_eq!(manager.idle_timeout_ms(), DEFAULT_IDLE_TIMEOUT_MS);
    }
}
