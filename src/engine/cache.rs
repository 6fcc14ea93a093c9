//! Per-tenant decision cache with generation-counter invalidation
//!
//! Cache keys embed the tenant's generation counter; any role, assignment, or
//! policy write bumps the counter, stranding every previously cached key for
//! that tenant in O(1) with no enumeration. Each tenant gets its own bounded
//! LRU shard so one large tenant cannot starve the others.

use crate::types::{AuthzRequest, Decision, TenantId};
use blake3::Hasher;
use dashmap::DashMap;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entries per tenant shard
    pub per_tenant_capacity: usize,

    /// Time-to-live for cached decisions
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            per_tenant_capacity: 10_000,
            ttl: Duration::from_secs(60),
        }
    }
}

/// Cache key (BLAKE3 hash of tenant, generation, subject, resource, action,
/// context fingerprint)
pub type CacheKey = [u8; 32];

#[derive(Clone)]
struct CachedEntry {
    decision: Decision,
    cached_at: Instant,
}

impl CachedEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() > ttl
    }
}

/// Decision cache sharded by tenant
pub struct DecisionCache {
    generations: DashMap<TenantId, Arc<AtomicU64>>,
    shards: DashMap<TenantId, Mutex<LruCache<CacheKey, CachedEntry>>>,
    config: CacheConfig,

    hits: AtomicUsize,
    misses: AtomicUsize,
    expirations: AtomicUsize,
}

impl DecisionCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            generations: DashMap::new(),
            shards: DashMap::new(),
            config,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            expirations: AtomicUsize::new(0),
        }
    }

    /// Current generation for a tenant (0 until first bump)
    pub fn generation(&self, tenant_id: &str) -> u64 {
        self.generations
            .get(tenant_id)
            .map(|g| g.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Invalidate all cached decisions for a tenant. Atomic increment of the
    /// tenant's counter; no other tenant is touched.
    pub fn invalidate_tenant(&self, tenant_id: &str) {
        self.generations
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::AcqRel);
    }

    /// Compute a cache key. The generation value makes keys from before any
    /// tenant write unreachable; attribute maps are fingerprinted in sorted
    /// key order so equal requests always hash identically.
    pub fn compute_key(request: &AuthzRequest, generation: u64) -> CacheKey {
        let mut hasher = Hasher::new();
        hasher.update(request.tenant_id.as_bytes());
        hasher.update(&generation.to_le_bytes());
        hasher.update(request.subject_id.as_bytes());
        hasher.update(request.resource.as_bytes());
        hasher.update(request.action.as_bytes());

        for attrs in [&request.subject_attrs, &request.resource_attrs, &request.context] {
            hash_attrs(&mut hasher, attrs);
        }

        *hasher.finalize().as_bytes()
    }

    /// Look up a cached decision. Every non-hit counts as a miss, including
    /// a tenant whose shard does not exist yet.
    pub fn get(&self, tenant_id: &str, key: &CacheKey) -> Option<Decision> {
        let Some(shard) = self.shards.get(tenant_id) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let Ok(mut cache) = shard.lock() else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match cache.get(key) {
            Some(entry) if entry.is_expired(self.config.ttl) => {
                cache.pop(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.decision.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a decision. Last writer wins; concurrent puts for the same key
    /// carry the same decision by construction.
    pub fn put(&self, tenant_id: &str, key: CacheKey, decision: Decision) {
        let capacity =
            NonZeroUsize::new(self.config.per_tenant_capacity.max(1)).expect("nonzero capacity");
        let shard = self
            .shards
            .entry(tenant_id.to_string())
            .or_insert_with(|| Mutex::new(LruCache::new(capacity)));

        let Ok(mut cache) = shard.lock() else { return };
        cache.put(
            key,
            CachedEntry {
                decision,
                cached_at: Instant::now(),
            },
        );
    }

    /// Cached entry count for a tenant
    pub fn tenant_len(&self, tenant_id: &str) -> usize {
        self.shards
            .get(tenant_id)
            .and_then(|shard| shard.lock().ok().map(|c| c.len()))
            .unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

fn hash_attrs(hasher: &mut Hasher, attrs: &HashMap<String, serde_json::Value>) {
    let mut keys: Vec<_> = attrs.keys().collect();
    keys.sort();
    for key in keys {
        hasher.update(key.as_bytes());
        if let Some(value) = attrs.get(key) {
            hasher.update(value.to_string().as_bytes());
        }
    }
    // Map separator so {a} + {} hashes differently from {} + {a}
    hasher.update(&[0xfe]);
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub expirations: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
