//! Security context token storage for secure conversations.
//!
//! Tokens are deep-cloned on insert and on read so cache mutation can never
//! alias an external holder. Quota overflow prunes the oldest sessions
//! rather than rejecting new ones.

use crate::cache::{ExpiringCache, PruneOldest, PurgeStrategy};
use crate::config::SessionCacheConfig;
use crate::error::{Result, WsSecurityError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// A session-scoped security token identified by context id and key
/// generation. `key_generation = None` denotes the initial generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContextToken {
    pub context_id: Uuid,
    pub key_generation: Option<Uuid>,
    /// Symmetric key material for this generation.
    pub key: Vec<u8>,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub key_effective: DateTime<Utc>,
    pub key_expiration: DateTime<Utc>,
}

impl SecurityContextToken {
    /// Cache identity: `(context_id, key_generation)`.
    pub fn identity(&self) -> (Uuid, Option<Uuid>) {
        (self.context_id, self.key_generation)
    }

    /// Whether `now` falls inside both the overall validity window and the
    /// key's effective window, with `skew` tolerance on each edge.
    pub fn is_time_effective(&self, now: DateTime<Utc>, skew: ChronoDuration) -> bool {
        now >= self.valid_from - skew
            && now <= self.valid_to + skew
            && now >= self.key_effective - skew
            && now <= self.key_expiration + skew
    }
}

/// Stores cloned session tokens keyed by `(context_id, key_generation)`.
pub struct SessionTokenCache {
    cache: ExpiringCache<(Uuid, Option<Uuid>), SecurityContextToken>,
    skew: ChronoDuration,
}

impl SessionTokenCache {
    pub fn new(config: &SessionCacheConfig, clock_skew_secs: u64) -> Self {
        let policy: PruneOldest<SecurityContextToken> = PruneOldest::new(|t| t.key_effective);
        Self {
            cache: ExpiringCache::with_policy(
                config.capacity,
                PurgeStrategy::Timer {
                    interval: Duration::from_secs(config.purge_interval_secs),
                },
                Box::new(policy),
            ),
            skew: ChronoDuration::seconds(clock_skew_secs as i64),
        }
    }

    /// Insert or replace a token. The token must currently be
    /// time-effective; a clone is stored, expiring when the token's
    /// validity (plus skew) runs out.
    pub fn add_or_replace(&self, token: &SecurityContextToken) -> Result<()> {
        if !token.is_time_effective(Utc::now(), self.skew) {
            return Err(WsSecurityError::Validation(
                "security context token is not currently valid",
            ));
        }
        let expiration = token.valid_to + self.skew;
        self.cache
            .try_add(token.identity(), token.clone(), expiration, true)?;
        debug!(context_id = %token.context_id, "cached security context token");
        Ok(())
    }

    /// Fetch a fresh clone of the token for one generation.
    pub fn get(
        &self,
        context_id: Uuid,
        key_generation: Option<Uuid>,
    ) -> Option<SecurityContextToken> {
        self.cache.get(&(context_id, key_generation))
    }

    /// Remove one generation. With `must_exist`, a missing entry is a
    /// validation error.
    pub fn remove(
        &self,
        context_id: Uuid,
        key_generation: Option<Uuid>,
        must_exist: bool,
    ) -> Result<()> {
        let removed = self.cache.try_remove(&(context_id, key_generation));
        if !removed && must_exist {
            return Err(WsSecurityError::Validation("no session token present"));
        }
        Ok(())
    }

    /// All live generations sharing a context id. Linear scan under a
    /// shared-lock snapshot; the cache is small relative to a session's
    /// key-rollover count.
    pub fn get_all_for_context(&self, context_id: Uuid) -> Vec<SecurityContextToken> {
        self.cache
            .snapshot()
            .into_iter()
            .filter(|(key, _)| key.0 == context_id)
            .map(|(_, token)| token)
            .collect()
    }

    /// Number of cached tokens, expired included.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache holds no tokens.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn token_valid_for(context_id: Uuid, secs: i64) -> SecurityContextToken {
        let now = Utc::now();
        SecurityContextToken {
            context_id,
            key_generation: None,
            key: vec![0x42; 32],
            valid_from: now - ChronoDuration::seconds(1),
            valid_to: now + ChronoDuration::seconds(secs),
            key_effective: now - ChronoDuration::seconds(1),
            key_expiration: now + ChronoDuration::seconds(secs),
        }
    }

    fn cache(capacity: usize) -> SessionTokenCache {
        SessionTokenCache::new(
            &SessionCacheConfig {
                capacity,
                purge_interval_secs: 3600,
            },
            0,
        )
    }

    #[test]
    fn test_round_trip_returns_clone() {
        let cache = cache(10);
        let token = token_valid_for(Uuid::new_v4(), 600);
        cache.add_or_replace(&token).unwrap();

        let mut fetched = cache.get(token.context_id, None).unwrap();
        assert_eq!(fetched, token);

        // Clone isolation: mutating the returned token must not affect the
        // cached one.
        fetched.key[0] ^= 0xFF;
        let again = cache.get(token.context_id, None).unwrap();
        assert_eq!(again.key, token.key);
    }

    #[test]
    fn test_expired_token_rejected_on_insert() {
        let cache = cache(10);
        let mut token = token_valid_for(Uuid::new_v4(), 600);
        token.valid_to = Utc::now() - ChronoDuration::seconds(10);
        let err = cache.add_or_replace(&token).unwrap_err();
        assert!(matches!(err, WsSecurityError::Validation(_)));
    }

    #[test]
    fn test_key_window_checked_separately() {
        let cache = cache(10);
        let mut token = token_valid_for(Uuid::new_v4(), 600);
        token.key_expiration = Utc::now() - ChronoDuration::seconds(10);
        assert!(cache.add_or_replace(&token).is_err());
    }

    #[test]
    fn test_generations_are_distinct_entries() {
        let cache = cache(10);
        let ctx = Uuid::new_v4();
        let initial = token_valid_for(ctx, 600);
        let mut rollover = token_valid_for(ctx, 600);
        rollover.key_generation = Some(Uuid::new_v4());
        rollover.key = vec![0x43; 32];

        cache.add_or_replace(&initial).unwrap();
        cache.add_or_replace(&rollover).unwrap();

        assert_eq!(cache.get(ctx, None).unwrap().key, initial.key);
        assert_eq!(
            cache.get(ctx, rollover.key_generation).unwrap().key,
            rollover.key
        );
        assert_eq!(cache.get_all_for_context(ctx).len(), 2);
    }

    #[test]
    fn test_remove_must_exist() {
        let cache = cache(10);
        let ctx = Uuid::new_v4();
        assert!(cache.remove(ctx, None, false).is_ok());
        assert!(cache.remove(ctx, None, true).is_err());

        cache.add_or_replace(&token_valid_for(ctx, 600)).unwrap();
        assert!(cache.remove(ctx, None, true).is_ok());
        assert!(cache.get(ctx, None).is_none());
    }

    #[test]
    fn test_quota_evicts_two_oldest_of_ten() {
        let cache = cache(10);
        let mut ids = Vec::new();
        for i in 0..10 {
            let mut token = token_valid_for(Uuid::new_v4(), 600);
            // Strictly increasing effective times.
            token.key_effective = Utc::now() - ChronoDuration::seconds(100 - i);
            ids.push(token.context_id);
            cache.add_or_replace(&token).unwrap();
        }

        let eleventh = token_valid_for(Uuid::new_v4(), 600);
        cache.add_or_replace(&eleventh).unwrap();

        // 20% of 10 = 2 oldest evicted, newcomer present.
        assert_eq!(cache.len(), 9);
        assert!(cache.get(ids[0], None).is_none());
        assert!(cache.get(ids[1], None).is_none());
        assert!(cache.get(ids[2], None).is_some());
        assert!(cache.get(eleventh.context_id, None).is_some());
    }
}
