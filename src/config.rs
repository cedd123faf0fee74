//! Configuration types for the WS-Security message engine.
//!
//! All knobs are explicit and passed down through constructors; the engine
//! keeps no process-wide defaults.

use serde::{Deserialize, Serialize};

/// Main configuration for the security engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Config version
    pub version: String,

    /// Clock skew tolerance in seconds, applied to token validity windows
    /// and security timestamps.
    pub clock_skew_secs: u64,

    /// Order in which signing and encryption are applied to the body.
    pub protection_order: ProtectionOrder,

    /// Header binding-mode inference engine.
    pub inference_mode: InferenceMode,

    /// Require a wsu:Timestamp in every incoming security header.
    pub require_timestamp: bool,

    /// Maximum age of an incoming timestamp's Created value, in seconds.
    pub max_timestamp_age_secs: u64,

    /// Require a validating primary signature on incoming messages.
    pub require_primary_signature: bool,

    /// Lifetime of outgoing security timestamps, in seconds.
    pub timestamp_ttl_secs: u64,

    /// Replay nonce cache settings.
    pub replay: ReplayCacheConfig,

    /// Session token cache settings.
    pub session_cache: SessionCacheConfig,

    /// Number of slots in the derived-key ring cache.
    pub derived_key_ring_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            clock_skew_secs: 300,
            protection_order: ProtectionOrder::SignThenEncrypt,
            inference_mode: InferenceMode::Lax,
            require_timestamp: true,
            max_timestamp_age_secs: 300,
            require_primary_signature: true,
            timestamp_ttl_secs: 300,
            replay: ReplayCacheConfig::default(),
            session_cache: SessionCacheConfig::default(),
            derived_key_ring_size: 2,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

/// Order in which body protection is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionOrder {
    /// Sign the plaintext body, then encrypt it.
    #[default]
    SignThenEncrypt,
    /// Encrypt the body, then sign the ciphertext element.
    EncryptThenSign,
}

/// Binding-mode inference engine selection. Fixed per factory, never
/// per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InferenceMode {
    /// Infer signature roles heuristically from reference targets.
    #[default]
    Lax,
    /// Require the wire format to declare signature roles explicitly.
    Strict,
}

/// Replay nonce cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayCacheConfig {
    /// How long a claimed nonce stays in the cache, in seconds.
    pub window_secs: u64,

    /// Maximum number of cached nonces.
    pub capacity: usize,

    /// Entry count below which access-based purging is skipped.
    pub low_water_mark: usize,

    /// Minimum interval between access-based purge sweeps, in seconds.
    pub purge_interval_secs: u64,
}

impl Default for ReplayCacheConfig {
    fn default() -> Self {
        Self {
            window_secs: 300,
            capacity: 500_000,
            low_water_mark: 50_000,
            purge_interval_secs: 30,
        }
    }
}

/// Session token cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionCacheConfig {
    /// Maximum number of cached session tokens.
    pub capacity: usize,

    /// Purge sweep interval, in seconds, for the background timer.
    pub purge_interval_secs: u64,
}

impl Default for SessionCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            purge_interval_secs: 60,
        }
    }
}
