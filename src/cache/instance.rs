//! Keyed, TTL-bounded instance cache with single-flight construction.

use crate::{Error, ErrorContext, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

type Construction<V> = Shared<BoxFuture<'static, std::result::Result<V, Arc<Error>>>>;

enum Slot<V: Clone> {
    Ready {
        value: V,
        expires_at: Instant,
    },
    /// A construction is in flight; every caller awaits the same shared future.
    Pending {
        generation: u64,
        construction: Construction<V>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub constructions: u64,
    pub failures: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    constructions: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
}

impl AtomicStats {
    fn to_stats(&self) -> InstanceCacheStats {
        InstanceCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            constructions: self.constructions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Shared store of expensive handles (model clients), created lazily and dropped after a TTL.
///
/// - At most one factory runs per key at a time; concurrent callers share its outcome
/// - A failed construction leaves the key empty so the next call retries
/// - Expiry is checked on lookup only; an entry is never returned at or after its deadline
/// - Keys live in a sharded map, so lookups for unrelated keys do not contend
pub struct InstanceCache<K, V: Clone> {
    entries: DashMap<K, Slot<V>>,
    generation: AtomicU64,
    stats: AtomicStats,
}

impl<K, V> InstanceCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            generation: AtomicU64::new(0),
            stats: AtomicStats::default(),
        }
    }

    /// Return the live entry for `key`, or build one with `factory` and keep it for `ttl`.
    ///
    /// The factory is not invoked while any internal lock is held. If several callers miss on
    /// the same key concurrently, only the first one's factory runs and all of them observe its
    /// result; a factory error reaches every waiter as the same [`Error::CacheConstruction`].
    /// A `ttl` whose deadline cannot be represented is rejected before the factory runs.
    pub async fn get_or_create<F, Fut>(&self, key: K, ttl: Duration, factory: F) -> Result<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if Instant::now().checked_add(ttl).is_none() {
            return Err(Error::configuration_with_context(
                format!("ttl {:?} is out of range", ttl),
                ErrorContext::new()
                    .with_source("instance_cache")
                    .with_details(format!("key {:?}", key)),
            ));
        }

        let (generation, construction) = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get() {
                Slot::Ready { value, expires_at } if Instant::now() < *expires_at => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(value.clone());
                }
                Slot::Pending {
                    generation,
                    construction,
                } => {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    (*generation, construction.clone())
                }
                Slot::Ready { .. } => {
                    debug!(key = ?key, "instance cache entry expired");
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    let (generation, construction) = self.start(factory);
                    occupied.insert(Slot::Pending {
                        generation,
                        construction: construction.clone(),
                    });
                    (generation, construction)
                }
            },
            Entry::Vacant(vacant) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                let (generation, construction) = self.start(factory);
                vacant.insert(Slot::Pending {
                    generation,
                    construction: construction.clone(),
                });
                (generation, construction)
            }
        };

        let outcome = construction.await;
        self.settle(&key, generation, &outcome, ttl);
        outcome.map_err(|source| Error::CacheConstruction {
            key: format!("{:?}", key),
            source,
        })
    }

    fn start<F, Fut>(&self, factory: F) -> (u64, Construction<V>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.stats.constructions.fetch_add(1, Ordering::Relaxed);
        // Deferred so the factory body never runs under the shard lock.
        let construction = async move { factory().await.map_err(Arc::new) }
            .boxed()
            .shared();
        (generation, construction)
    }

    // Every waiter calls this; only the first one to see its own pending generation transitions
    // the slot.
    fn settle(
        &self,
        key: &K,
        generation: u64,
        outcome: &std::result::Result<V, Arc<Error>>,
        ttl: Duration,
    ) {
        if let Entry::Occupied(mut occupied) = self.entries.entry(key.clone()) {
            let ours = matches!(
                occupied.get(),
                Slot::Pending { generation: g, .. } if *g == generation
            );
            if !ours {
                return;
            }
            match outcome {
                Ok(value) => match Instant::now().checked_add(ttl) {
                    Some(expires_at) => {
                        occupied.insert(Slot::Ready {
                            value: value.clone(),
                            expires_at,
                        });
                    }
                    None => {
                        debug!(key = ?key, ttl = ?ttl, "expiry out of range, entry not stored");
                        occupied.remove();
                    }
                },
                Err(e) => {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    debug!(key = ?key, error = %e, "instance construction failed");
                    occupied.remove();
                }
            }
        }
    }

    /// Return the live entry without constructing anything.
    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;
        match entry.value() {
            Slot::Ready { value, expires_at } if Instant::now() < *expires_at => {
                Some(value.clone())
            }
            _ => None,
        }
    }

    /// Drop the entry for `key`. An in-flight construction is detached: current waiters still
    /// receive its result, but it will not be stored.
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every expired entry. Lookups already ignore them; this only reclaims memory.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| match slot {
            Slot::Ready { expires_at, .. } => now < *expires_at,
            Slot::Pending { .. } => true,
        });
        let purged = before.saturating_sub(self.entries.len());
        self.stats
            .evictions
            .fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    /// Number of live (non-expired, constructed) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| matches!(e.value(), Slot::Ready { expires_at, .. } if now < *expires_at))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> InstanceCacheStats {
        self.stats.to_stats()
    }
}

impl<K, V> Default for InstanceCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
