//! Fragment caching with single-flight fetches.
//!
//! Tasks of the same country overlap at their borders, so the same boundary
//! shard is requested by several loaders at once. [`CachingFetcher`] keeps
//! recently fetched fragments in an LRU and coalesces concurrent requests
//! for the same key into one call to the wrapped fetcher.
//!
//! ## Semantics
//!
//! - A hit returns the cached `Arc<GraphFragment>` (or cached absence).
//! - Concurrent misses for one key share a single in-flight fetch.
//! - Errors are never cached: the slot is dropped and the next request retries.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::{AtlasFetcher, FetchError};
use crate::types::{GraphFragment, ShardId};

/// Configuration for the fragment cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of fragments kept.
    pub max_entries: usize,
    /// Whether to enable the cache.
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            enabled: true,
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Current number of entries.
    pub len: usize,
    /// Maximum capacity.
    pub cap: usize,
    /// Requests answered from a resident slot.
    pub hits: u64,
    /// Requests that created a new slot.
    pub misses: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FragmentKey {
    country: String,
    shard: ShardId,
}

type Slot = Arc<OnceCell<Option<Arc<GraphFragment>>>>;

/// LRU + single-flight wrapper around another fetcher.
pub struct CachingFetcher<F> {
    inner: Arc<F>,
    slots: Option<Mutex<LruCache<FragmentKey, Slot>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<F: AtlasFetcher> CachingFetcher<F> {
    /// Wrap `inner` with the default configuration.
    pub fn new(inner: F) -> Self {
        Self::with_config(inner, CacheConfig::default())
    }

    /// Wrap `inner` with an explicit configuration.
    pub fn with_config(inner: F, config: CacheConfig) -> Self {
        Self::from_arc(Arc::new(inner), config)
    }

    /// Wrap a shared fetcher.
    pub fn from_arc(inner: Arc<F>, config: CacheConfig) -> Self {
        let slots = if config.enabled {
            let size = NonZeroUsize::new(config.max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
            Some(Mutex::new(LruCache::new(size)))
        } else {
            None
        };
        Self {
            inner,
            slots,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// The wrapped fetcher.
    pub fn inner(&self) -> &F {
        &self.inner
    }

    /// Statistics, or `None` when caching is disabled.
    pub fn stats(&self) -> Option<CacheStats> {
        self.slots.as_ref().map(|slots| {
            let slots = slots.lock();
            CacheStats {
                len: slots.len(),
                cap: slots.cap().get(),
                hits: self.hits.load(Ordering::Relaxed),
                misses: self.misses.load(Ordering::Relaxed),
            }
        })
    }

    /// Drop every cached fragment.
    pub fn clear(&self) {
        if let Some(slots) = &self.slots {
            slots.lock().clear();
        }
    }

    fn slot(slots: &Mutex<LruCache<FragmentKey, Slot>>, key: &FragmentKey) -> (Slot, bool) {
        let mut slots = slots.lock();
        if let Some(slot) = slots.get(key) {
            return (Arc::clone(slot), true);
        }
        let slot: Slot = Arc::new(OnceCell::new());
        slots.put(key.clone(), Arc::clone(&slot));
        (slot, false)
    }
}

#[async_trait]
impl<F: AtlasFetcher> AtlasFetcher for CachingFetcher<F> {
    async fn fetch(
        &self,
        country: &str,
        shard: &ShardId,
    ) -> Result<Option<Arc<GraphFragment>>, FetchError> {
        let Some(slots) = &self.slots else {
            return self.inner.fetch(country, shard).await;
        };

        let key = FragmentKey {
            country: country.to_string(),
            shard: *shard,
        };
        let (slot, resident) = Self::slot(slots, &key);
        if resident {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }

        let result = slot
            .get_or_try_init(|| self.inner.fetch(country, shard))
            .await
            .cloned();

        if let Err(error) = &result {
            tracing::debug!(country, shard = %shard, error = %error, "Evicting failed fetch");
            let mut slots = slots.lock();
            if slots.peek(&key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                slots.pop(&key);
            }
        }
        result
    }
}
