//! Fragments stored as JSON files on disk.
//!
//! Layout: `<root>/<COUNTRY>/<COUNTRY>_<zoom>-<x>-<y>.json`, one file per
//! (country, shard). A missing file means the shard has no data.

use async_trait::async_trait;
use regex_lite::Regex;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{AtlasFetcher, FetchError};
use crate::types::{GraphFragment, Shard, ShardId};

const FRAGMENT_FILE_PATTERN: &str = r"^([A-Z]{3})_(\d+)-(\d+)-(\d+)\.json$";

/// Fetcher reading fragments from a directory tree.
#[derive(Debug, Clone)]
pub struct DirectoryAtlasFetcher {
    root: PathBuf,
}

impl DirectoryAtlasFetcher {
    /// Create a fetcher rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the fragment file for `(country, shard)`.
    pub fn fragment_path(&self, country: &str, shard: &ShardId) -> PathBuf {
        self.root
            .join(country)
            .join(format!("{}_{}.json", country, shard.name()))
    }

    /// Scan the root and list the shards with a fragment file, per country.
    ///
    /// Files not matching the naming scheme are ignored. A missing root yields
    /// an empty catalog.
    pub fn catalog(&self) -> Result<BTreeMap<String, Vec<Shard>>, FetchError> {
        let pattern = Regex::new(FRAGMENT_FILE_PATTERN).map_err(|e| FetchError::Decode {
            path: FRAGMENT_FILE_PATTERN.to_string(),
            message: e.to_string(),
        })?;
        let mut catalog: BTreeMap<String, Vec<Shard>> = BTreeMap::new();

        let countries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(catalog),
            Err(e) => return Err(io_error(&self.root, e)),
        };

        for country_dir in countries {
            let country_dir = country_dir.map_err(|e| io_error(&self.root, e))?;
            if !country_dir.path().is_dir() {
                continue;
            }
            let files =
                std::fs::read_dir(country_dir.path()).map_err(|e| io_error(&country_dir.path(), e))?;
            for file in files {
                let file = file.map_err(|e| io_error(&country_dir.path(), e))?;
                let name = file.file_name();
                let Some(caps) = name.to_str().and_then(|n| pattern.captures(n)) else {
                    continue;
                };
                let parsed = (caps[2].parse(), caps[3].parse(), caps[4].parse());
                let (Ok(zoom), Ok(x), Ok(y)) = parsed else {
                    tracing::warn!(file = ?file.path(), "Skipping fragment with out-of-range shard name");
                    continue;
                };
                catalog
                    .entry(caps[1].to_string())
                    .or_default()
                    .push(Shard::from_id(ShardId::new(zoom, x, y)));
            }
        }

        for shards in catalog.values_mut() {
            shards.sort_by_key(|s| s.id);
            shards.dedup_by_key(|s| s.id);
        }
        Ok(catalog)
    }

    /// Write a fragment to its canonical path, creating directories as needed.
    pub fn write_fragment(&self, fragment: &GraphFragment) -> Result<PathBuf, FetchError> {
        let path = self.fragment_path(&fragment.country, &fragment.shard);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        let bytes = serde_json::to_vec(fragment).map_err(|e| FetchError::Decode {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        std::fs::write(&path, bytes).map_err(|e| io_error(&path, e))?;
        Ok(path)
    }
}

fn io_error(path: &Path, error: std::io::Error) -> FetchError {
    FetchError::Io {
        path: path.display().to_string(),
        message: error.to_string(),
    }
}

#[async_trait]
impl AtlasFetcher for DirectoryAtlasFetcher {
    async fn fetch(
        &self,
        country: &str,
        shard: &ShardId,
    ) -> Result<Option<Arc<GraphFragment>>, FetchError> {
        let path = self.fragment_path(country, shard);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };
        let fragment: GraphFragment =
            serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        Ok(Some(Arc::new(fragment)))
    }
}
