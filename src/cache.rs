//! Generic concurrency-safe expiring cache.
//!
//! Backs replay detection, session token storage, and negotiation state.
//! Entries carry an absolute UTC expiration and are lazily expired: an entry
//! whose expiration has passed is invisible to readers even while still
//! physically present. Purging happens either on a background timer or
//! lazily on mutating calls (access-based), and quota overflow is delegated
//! to a pluggable eviction policy.

use crate::error::{Result, WsSecurityError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

/// A cached item with its absolute expiration.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The cached item.
    pub item: V,
    /// Absolute expiration, always UTC. An entry with
    /// `expiration_utc <= now` is logically absent.
    pub expiration_utc: DateTime<Utc>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_utc <= now
    }
}

/// How expired entries get swept out.
#[derive(Debug, Clone)]
pub enum PurgeStrategy {
    /// Check lazily on each mutating call: sweep when `interval` has elapsed
    /// since the last sweep and the entry count exceeds `low_water_mark`.
    AccessBased {
        interval: Duration,
        low_water_mark: usize,
    },
    /// A background thread sweeps every `interval`. Lazily started on first
    /// insert, exits once the cache drains empty, restarted by the next
    /// insert.
    Timer { interval: Duration },
}

/// Selects victims when an insert would exceed capacity.
///
/// Returning an empty set means the insert fails with a capacity error.
pub trait EvictionPolicy<K, V>: Send + Sync {
    fn select_victims(&self, entries: &HashMap<K, CacheEntry<V>>, capacity: usize) -> Vec<K>;
}

/// Default policy: never evict, fail the insert.
pub struct RejectNew;

impl<K, V> EvictionPolicy<K, V> for RejectNew {
    fn select_victims(&self, _entries: &HashMap<K, CacheEntry<V>>, _capacity: usize) -> Vec<K> {
        Vec::new()
    }
}

/// Evicts the oldest 20% of live entries, ordered by a caller-supplied
/// timestamp key. Losing old entries is preferable to rejecting new ones
/// for session-style caches.
pub struct PruneOldest<V> {
    order_key: fn(&V) -> DateTime<Utc>,
}

impl<V> PruneOldest<V> {
    pub fn new(order_key: fn(&V) -> DateTime<Utc>) -> Self {
        Self { order_key }
    }
}

impl<K: Clone, V> EvictionPolicy<K, V> for PruneOldest<V> {
    fn select_victims(&self, entries: &HashMap<K, CacheEntry<V>>, capacity: usize) -> Vec<K> {
        let now = Utc::now();
        let mut live: Vec<(&K, DateTime<Utc>)> = entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, e)| (k, (self.order_key)(&e.item)))
            .collect();
        live.sort_by_key(|(_, t)| *t);

        let mut count = capacity / 5;
        if count == 0 {
            count = capacity;
        }
        live.into_iter().take(count).map(|(k, _)| k.clone()).collect()
    }
}

/// Callback invoked for entries removed by purge sweeps or quota eviction.
pub type RemovalListener<K, V> = Arc<dyn Fn(&K, &V) + Send + Sync>;

struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    last_purge: Instant,
    timer_active: bool,
}

struct Shared<K, V> {
    state: RwLock<CacheState<K, V>>,
    capacity: usize,
    purge: PurgeStrategy,
    policy: Box<dyn EvictionPolicy<K, V>>,
    on_removal: Option<RemovalListener<K, V>>,
}

/// Generic key/item store with per-item absolute expiration and quota
/// enforcement. Safe for concurrent use: one reader/writer lock per cache,
/// shared for reads, exclusive for writes, released on every exit path by
/// the guard.
pub struct ExpiringCache<K, V> {
    inner: Arc<Shared<K, V>>,
}

impl<K, V> Clone for ExpiringCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache with the default fail-fast eviction policy.
    pub fn new(capacity: usize, purge: PurgeStrategy) -> Self {
        Self::with_policy(capacity, purge, Box::new(RejectNew))
    }

    /// Create a cache with a custom eviction policy.
    pub fn with_policy(
        capacity: usize,
        purge: PurgeStrategy,
        policy: Box<dyn EvictionPolicy<K, V>>,
    ) -> Self {
        Self::with_policy_and_listener(capacity, purge, policy, None)
    }

    /// Create a cache with a custom eviction policy and removal listener.
    pub fn with_policy_and_listener(
        capacity: usize,
        purge: PurgeStrategy,
        policy: Box<dyn EvictionPolicy<K, V>>,
        on_removal: Option<RemovalListener<K, V>>,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                state: RwLock::new(CacheState {
                    entries: HashMap::new(),
                    last_purge: Instant::now(),
                    timer_active: false,
                }),
                capacity,
                purge,
                policy,
                on_removal,
            }),
        }
    }

    /// Insert `item` under `key`, expiring at `expiration`.
    ///
    /// Returns `Ok(false)` when the key is already present and unexpired and
    /// `allow_replace` is off. Capacity overflow that the eviction policy
    /// cannot resolve is a capacity error.
    pub fn try_add(
        &self,
        key: K,
        item: V,
        expiration: DateTime<Utc>,
        allow_replace: bool,
    ) -> Result<bool> {
        let mut state = write_lock(&self.inner.state);
        self.inner.purge_if_due(&mut state);

        let now = Utc::now();
        let occupied = match state.entries.get(&key) {
            Some(existing) if !existing.is_expired(now) => true,
            _ => false,
        };
        if occupied && !allow_replace {
            return Ok(false);
        }

        if !state.entries.contains_key(&key) && state.entries.len() >= self.inner.capacity {
            self.inner.enforce_quota(&mut state)?;
        }

        state.entries.insert(
            key,
            CacheEntry {
                item,
                expiration_utc: expiration,
            },
        );
        self.start_timer_if_needed(&mut state);
        Ok(true)
    }

    /// Look up a live entry. Expired-but-present entries return `None`
    /// without being removed (lazy expiry; the read path never mutates).
    pub fn get(&self, key: &K) -> Option<V> {
        let state = read_lock(&self.inner.state);
        let entry = state.entries.get(key)?;
        if entry.is_expired(Utc::now()) {
            return None;
        }
        Some(entry.item.clone())
    }

    /// Remove an entry. Returns whether a live entry was removed.
    pub fn try_remove(&self, key: &K) -> bool {
        let mut state = write_lock(&self.inner.state);
        self.inner.purge_if_due(&mut state);
        match state.entries.remove(key) {
            Some(entry) => !entry.is_expired(Utc::now()),
            None => false,
        }
    }

    /// Replace the item under `key`, extending its expiration. Fails when
    /// the key is absent or already expired. The expiration is never
    /// shortened: the later of the current and new instant wins.
    pub fn try_replace(&self, key: &K, item: V, new_expiration: DateTime<Utc>) -> Result<bool> {
        let mut state = write_lock(&self.inner.state);
        self.inner.purge_if_due(&mut state);

        let now = Utc::now();
        match state.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.item = item;
                if new_expiration > entry.expiration_utc {
                    entry.expiration_utc = new_expiration;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Number of physically present entries, expired included.
    pub fn len(&self) -> usize {
        read_lock(&self.inner.state).entries.len()
    }

    /// Whether the cache holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all live entries under a shared lock.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        let state = read_lock(&self.inner.state);
        let now = Utc::now();
        state
            .entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, e)| (k.clone(), e.item.clone()))
            .collect()
    }

    fn start_timer_if_needed(&self, state: &mut CacheState<K, V>) {
        let interval = match self.inner.purge {
            PurgeStrategy::Timer { interval } => interval,
            PurgeStrategy::AccessBased { .. } => return,
        };
        if state.timer_active || state.entries.is_empty() {
            return;
        }
        state.timer_active = true;

        let weak: Weak<Shared<K, V>> = Arc::downgrade(&self.inner);
        let spawned = std::thread::Builder::new()
            .name("wss-cache-purge".to_string())
            .spawn(move || loop {
                std::thread::sleep(interval);
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let mut state = write_lock(&shared.state);
                shared.purge_expired(&mut state);
                if state.entries.is_empty() {
                    // Self-cancel; the next insert restarts the timer.
                    state.timer_active = false;
                    return;
                }
            });
        if spawned.is_err() {
            // Degrade to lazy purging on the mutating path.
            state.timer_active = false;
        }
    }
}

impl<K, V> Shared<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn should_purge(&self, state: &CacheState<K, V>) -> bool {
        if state.entries.len() >= self.capacity {
            return true;
        }
        match self.purge {
            PurgeStrategy::AccessBased {
                interval,
                low_water_mark,
            } => state.last_purge.elapsed() >= interval && state.entries.len() > low_water_mark,
            PurgeStrategy::Timer { .. } => false,
        }
    }

    fn purge_if_due(&self, state: &mut CacheState<K, V>) {
        if self.should_purge(state) {
            self.purge_expired(state);
        }
    }

    fn purge_expired(&self, state: &mut CacheState<K, V>) {
        let now = Utc::now();
        let expired: Vec<K> = state
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        let removed = expired.len();
        for key in expired {
            if let Some(entry) = state.entries.remove(&key) {
                if let Some(listener) = &self.on_removal {
                    listener(&key, &entry.item);
                }
            }
        }
        state.last_purge = Instant::now();
        if removed > 0 {
            debug!(removed, remaining = state.entries.len(), "purged expired cache entries");
        }
    }

    fn enforce_quota(&self, state: &mut CacheState<K, V>) -> Result<()> {
        let victims = self.policy.select_victims(&state.entries, self.capacity);
        for key in &victims {
            if let Some(entry) = state.entries.remove(key) {
                if let Some(listener) = &self.on_removal {
                    listener(key, &entry.item);
                }
            }
        }
        if state.entries.len() >= self.capacity {
            return Err(WsSecurityError::Capacity(format!(
                "cache full at {} entries",
                self.capacity
            )));
        }
        if !victims.is_empty() {
            debug!(evicted = victims.len(), "evicted cache entries to make room");
        }
        Ok(())
    }
}

fn write_lock<K, V>(lock: &RwLock<CacheState<K, V>>) -> RwLockWriteGuard<'_, CacheState<K, V>> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_lock<K, V>(
    lock: &RwLock<CacheState<K, V>>,
) -> std::sync::RwLockReadGuard<'_, CacheState<K, V>> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}
