//! Replay detection for one-time nonces.
//!
//! Presence in the cache means "already seen"; the atomic claim operation is
//! the only sound way to reject replays. A check-then-add sequence would let
//! two concurrent copies of the same replayed message both pass.

use crate::cache::{ExpiringCache, PurgeStrategy};
use crate::config::ReplayCacheConfig;
use crate::crypto;
use crate::error::{Result, WsSecurityError};
use chrono::{Duration as ChronoDuration, Utc};
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tracing::warn;

/// Minimum nonce length. The first four bytes double as the hash-table key.
pub const MIN_NONCE_LEN: usize = 4;

/// A nonce used as a cache key: hashed by its 4-byte prefix, compared over
/// the full byte sequence. Prefix collisions fall through to the full
/// comparison rather than occupying distinct slots.
#[derive(Debug, Clone, Eq)]
pub struct NonceKey(Vec<u8>);

impl NonceKey {
    fn new(nonce: &[u8]) -> Result<Self> {
        if nonce.len() < MIN_NONCE_LEN {
            return Err(WsSecurityError::Usage(format!(
                "replay nonce must be at least {MIN_NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        Ok(Self(nonce.to_vec()))
    }
}

impl PartialEq for NonceKey {
    fn eq(&self, other: &Self) -> bool {
        crypto::constant_time_eq(&self.0, &other.0)
    }
}

impl Hash for NonceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let prefix = u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        state.write_u32(prefix);
    }
}

/// Detects replayed one-time tokens by byte-string key.
pub struct ReplayNonceCache {
    cache: ExpiringCache<NonceKey, ()>,
    window: ChronoDuration,
}

impl ReplayNonceCache {
    pub fn new(config: &ReplayCacheConfig) -> Self {
        Self {
            cache: ExpiringCache::new(
                config.capacity,
                PurgeStrategy::AccessBased {
                    interval: Duration::from_secs(config.purge_interval_secs),
                    low_water_mark: config.low_water_mark,
                },
            ),
            window: ChronoDuration::seconds(config.window_secs as i64),
        }
    }

    /// Atomically claim a nonce. Returns `true` on first sighting, `false`
    /// when the nonce is already present and unexpired (a replay). The
    /// check-and-insert runs in a single critical section.
    pub fn claim(&self, nonce: &[u8]) -> Result<bool> {
        let key = NonceKey::new(nonce)?;
        let fresh = self
            .cache
            .try_add(key, (), Utc::now() + self.window, false)?;
        if !fresh {
            warn!("replayed nonce rejected");
        }
        Ok(fresh)
    }

    /// Non-mutating membership check, for diagnostics only. Production
    /// replay rejection must use [`claim`](Self::claim).
    pub fn has_seen(&self, nonce: &[u8]) -> Result<bool> {
        let key = NonceKey::new(nonce)?;
        Ok(self.cache.get(&key).is_some())
    }
}
