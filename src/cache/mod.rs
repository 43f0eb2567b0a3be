//! Response cache.
//!
//! A sharded TTL map bounded by entry count and total value size. Keys are
//! opaque strings whose first `:`-separated segment is the owning tenant
//! id; prefix invalidation and per-tenant lookups both lean on that.
//! Writes are serialised per shard; a key lives in exactly one shard, so
//! a reader observes an invalidation either entirely or not at all.

use crate::{constants, Result};
use serde_json::Value;
use std::{
    collections::{
        hash_map::{DefaultHasher, Entry as MapEntry},
        HashMap,
    },
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
    last_access: Instant,
    size: usize,
}

#[derive(Default)]
struct Shard {
    entries: HashMap<String, CacheEntry>,
    bytes: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

pub struct ResponseCache {
    shards: Vec<Mutex<Shard>>,
    max_entries: usize,
    max_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    /// Entry counts keyed by the tenant segment of each key, backing the
    /// per-tenant cache quota.
    tenant_counts: Mutex<HashMap<String, u64>>,
    // Per-key gates so concurrent cold lookups compute once.
    in_flight: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

fn tenant_segment(key: &str) -> &str {
    key.split(':').next().unwrap_or(key)
}

impl ResponseCache {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        let shards = (0..constants::CACHE_SHARDS)
            .map(|_| Mutex::new(Shard::default()))
            .collect();
        Self {
            shards,
            max_entries,
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            tenant_counts: Mutex::new(HashMap::new()),
            in_flight: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn count_insert(&self, key: &str) {
        let mut counts = self
            .tenant_counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *counts.entry(tenant_segment(key).to_string()).or_insert(0) += 1;
    }

    fn count_remove(&self, key: &str) {
        let mut counts = self
            .tenant_counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(count) = counts.get_mut(tenant_segment(key)) {
            *count = count.saturating_sub(1);
        }
    }

    /// Live entry count for one tenant's key segment.
    pub fn entries_for(&self, tenant: &str) -> u64 {
        self.tenant_counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(tenant)
            .copied()
            .unwrap_or(0)
    }

    fn shard_for(&self, key: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn lock_shard<'a>(&self, shard: &'a Mutex<Shard>) -> std::sync::MutexGuard<'a, Shard> {
        shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lookup(&self, key: &str, now: Instant) -> Option<Value> {
        let mut guard = self.lock_shard(self.shard_for(key));
        let shard = &mut *guard;
        match shard.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().expires_at <= now {
                    // Lazy expiry on read.
                    let removed = occupied.remove();
                    shard.bytes = shard.bytes.saturating_sub(removed.size);
                    self.count_remove(key);
                    None
                } else {
                    occupied.get_mut().last_access = now;
                    Some(occupied.get().value.clone())
                }
            }
            MapEntry::Vacant(_) => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let found = self.lookup(key, Instant::now());
        match &found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn put(&self, key: &str, value: Value, ttl: Duration) {
        let now = Instant::now();
        let size = value.to_string().len();
        let entry = CacheEntry {
            value,
            expires_at: now + ttl,
            last_access: now,
            size,
        };

        let mut shard = self.lock_shard(self.shard_for(key));
        match shard.entries.insert(key.to_string(), entry) {
            Some(old) => shard.bytes = shard.bytes.saturating_sub(old.size),
            None => self.count_insert(key),
        }
        shard.bytes += size;
        self.evict_over_capacity(
            &mut shard,
            self.max_entries / self.shards.len().max(1),
            self.max_bytes / self.shards.len().max(1),
            now,
        );
    }

    /// Evict until the shard fits its share of the bounds: expired entries
    /// first, then least-recently-used.
    fn evict_over_capacity(
        &self,
        shard: &mut Shard,
        max_entries: usize,
        max_bytes: usize,
        now: Instant,
    ) {
        while shard.entries.len() > max_entries.max(1) || shard.bytes > max_bytes.max(1) {
            let victim = shard
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.expires_at > now, e.last_access))
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else { break };
            if let Some(removed) = shard.entries.remove(&victim) {
                shard.bytes = shard.bytes.saturating_sub(removed.size);
                self.count_remove(&victim);
                debug!(key = %victim, "cache entry evicted");
            }
        }
    }

    /// Remove every entry whose key starts with `prefix`. Atomic per
    /// shard with respect to concurrent readers.
    pub fn invalidate(&self, prefix: &str) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = self.lock_shard(shard);
            let before = shard.entries.len();
            let mut freed = 0;
            shard.entries.retain(|key, entry| {
                let keep = !key.starts_with(prefix);
                if !keep {
                    freed += entry.size;
                    self.count_remove(key);
                }
                keep
            });
            removed += before - shard.entries.len();
            shard.bytes = shard.bytes.saturating_sub(freed);
        }
        if removed > 0 {
            info!(prefix = %prefix, removed, "cache invalidated by prefix");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let size = self
            .shards
            .iter()
            .map(|s| self.lock_shard(s).entries.len())
            .sum();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            size,
            max_size: self.max_entries,
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// Drop expired entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = self.lock_shard(shard);
            let before = shard.entries.len();
            let mut freed = 0;
            shard.entries.retain(|key, entry| {
                let keep = entry.expires_at > now;
                if !keep {
                    freed += entry.size;
                    self.count_remove(key);
                }
                keep
            });
            removed += before - shard.entries.len();
            shard.bytes = shard.bytes.saturating_sub(freed);
        }
        removed
    }

    /// Fetch `key`, or compute and store it. Concurrent callers for the
    /// same cold key serialise on a per-key gate so the computation runs
    /// exactly once; every call counts exactly one hit or miss.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Value>>,
    {
        if let Some(value) = self.lookup(key, Instant::now()) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        let gate = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = gate.lock().await;

        // A peer may have filled the entry while we waited on the gate;
        // the peer that computed it also cleared the gate entry.
        if let Some(value) = self.lookup(key, Instant::now()) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        // Drop the gate entry whether the computation succeeds or fails;
        // a failed key must not pin its gate in the map.
        let result = compute().await;
        if let Ok(value) = &result {
            self.put(key, value.clone(), ttl);
        }
        self.in_flight.lock().await.remove(key);
        result
    }

    /// Background sweeper; runs until the token is cancelled.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        info!("cache sweeper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let removed = self.sweep();
                    if removed > 0 {
                        debug!(removed, "cache sweep removed expired entries");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        info!("cache sweeper stopped");
    }
}
