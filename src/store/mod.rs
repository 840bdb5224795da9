//! Fragment fetchers: where graph fragments come from.

pub mod memory;
pub mod cache;
pub mod directory;

use async_trait::async_trait;
use std::sync::Arc;

use crate::types::{GraphFragment, ShardId};

/// Error fetching a fragment.
///
/// Cloneable so a single in-flight fetch can report to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// Reading the backing resource failed.
    #[error("I/O error reading {path}: {message}")]
    Io {
        /// Resource path.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// The resource exists but could not be decoded.
    #[error("Could not decode fragment {path}: {message}")]
    Decode {
        /// Resource path.
        path: String,
        /// Decoder message.
        message: String,
    },
    /// Backend-specific failure.
    #[error("Fetch failed for {country}/{shard}: {message}")]
    Backend {
        /// Country.
        country: String,
        /// Shard.
        shard: ShardId,
        /// Message.
        message: String,
    },
}

/// Source of per-shard graph fragments.
///
/// `Ok(None)` means the shard has no data for the country. Loaders treat
/// both `Ok(None)` and `Err(_)` as holes in the assembled graph.
#[async_trait]
pub trait AtlasFetcher: Send + Sync {
    /// Fetch the fragment of `shard` for `country`.
    async fn fetch(
        &self,
        country: &str,
        shard: &ShardId,
    ) -> Result<Option<Arc<GraphFragment>>, FetchError>;
}

#[async_trait]
impl<F: AtlasFetcher + ?Sized> AtlasFetcher for Arc<F> {
    async fn fetch(
        &self,
        country: &str,
        shard: &ShardId,
    ) -> Result<Option<Arc<GraphFragment>>, FetchError> {
        (**self).fetch(country, shard).await
    }
}

pub use memory::InMemoryAtlasFetcher;
pub use cache::{CacheConfig, CacheStats, CachingFetcher};
pub use directory::DirectoryAtlasFetcher;
