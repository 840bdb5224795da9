//! Job configuration.
//!
//! A [`JobConfig`] is read from a JSON file; every field has a default so a
//! minimal file only names countries and paths. The CLI overrides individual
//! fields after loading.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::checks::CheckSettings;
use crate::policy::LoaderPolicy;
use crate::runner::CandidateFilter;
use crate::scheduler::GroupingMode;
use crate::store::CacheConfig;
use crate::types::ShardId;

/// Default maximum number of shards one task may load.
pub const DEFAULT_MAX_SHARD_LOAD: usize = 60;

/// Default pool kill threshold in minutes.
pub const DEFAULT_POOL_KILL_MINUTES: u64 = 300;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Could not read {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid configuration JSON.
    #[error("Could not parse {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// A value is out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Output formats a job can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// One JSON `flag_produced` event per line.
    Flags,
    /// CSV of per-check elapsed time.
    Metrics,
}

impl OutputFormat {
    /// Directory name under the output root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Flags => "flags",
            Self::Metrics => "metrics",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flags" => Ok(Self::Flags),
            "metrics" => Ok(Self::Metrics),
            other => Err(ConfigError::Invalid(format!("unknown output format {}", other))),
        }
    }
}

/// Which checks load and how they are configured.
///
/// Settings for a country start from `checks`, then the country's entry in
/// `overrides`, then the entry of each group containing the country in
/// group name order. Later layers win field by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksConfig {
    /// When non-empty, only these checks load.
    pub permitlist: Vec<String>,
    /// Checks that never load.
    pub denylist: Vec<String>,
    /// Per-check settings, keyed by check name.
    pub checks: BTreeMap<String, CheckSettings>,
    /// Country groups: group name to member countries.
    pub groups: BTreeMap<String, Vec<String>>,
    /// Overrides keyed by country or group name, then by check name.
    pub overrides: BTreeMap<String, BTreeMap<String, CheckSettingsOverride>>,
}

impl ChecksConfig {
    /// Whether `check` passes the permit-list and deny-list.
    pub fn is_listed(&self, check: &str) -> bool {
        (self.permitlist.is_empty() || self.permitlist.iter().any(|p| p == check))
            && !self.denylist.iter().any(|d| d == check)
    }

    /// Groups containing `country`, in name order.
    pub fn groups_of<'a>(&'a self, country: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.groups
            .iter()
            .filter(move |(_, members)| members.iter().any(|c| c == country))
            .map(|(group, _)| group.as_str())
    }

    /// Effective settings of `check` in `country`.
    pub fn settings_for(&self, check: &str, country: &str) -> CheckSettings {
        let mut settings = self.checks.get(check).cloned().unwrap_or_default();
        for keyword in std::iter::once(country).chain(self.groups_of(country)) {
            if let Some(layer) = self.overrides.get(keyword).and_then(|by_check| by_check.get(check)) {
                layer.apply(&mut settings);
            }
        }
        settings
    }
}

/// Partial settings layered over a check's base settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckSettingsOverride {
    /// Replaces `enabled`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Replaces `countries`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countries: Option<Vec<String>>,
    /// Replaces `except_countries`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub except_countries: Option<Vec<String>>,
    /// Merged key by key into `options`.
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl CheckSettingsOverride {
    fn apply(&self, settings: &mut CheckSettings) {
        if let Some(enabled) = self.enabled {
            settings.enabled = enabled;
        }
        if let Some(countries) = &self.countries {
            settings.countries = countries.clone();
        }
        if let Some(except) = &self.except_countries {
            settings.except_countries = except.clone();
        }
        for (key, value) in &self.options {
            settings.options.insert(key.clone(), value.clone());
        }
    }
}

/// Full configuration of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Countries (ISO3) to check.
    pub countries: Vec<String>,
    /// Countries scheduled before the rest.
    pub priority_countries: Vec<String>,
    /// Fragment root directory.
    pub input: PathBuf,
    /// Output root directory.
    pub output: PathBuf,
    /// Alternate sharding: JSON array of shard names used as the loader's
    /// index instead of the shards found under `input`.
    pub sharding: Option<PathBuf>,
    /// Formats to write.
    pub output_formats: Vec<OutputFormat>,
    /// Loader strategy and boundary expansion.
    pub loader: LoaderPolicy,
    /// How shards are grouped into tasks.
    pub grouping: GroupingMode,
    /// Maximum shards a task may load (bounded grouping).
    pub max_shard_load: usize,
    /// Pool kill threshold in minutes.
    pub pool_kill_minutes: u64,
    /// Tasks running at once.
    pub max_concurrent_tasks: usize,
    /// Which plain entities checks evaluate.
    pub candidate_filter: CandidateFilter,
    /// Fragment cache.
    pub cache: CacheConfig,
    /// Check selection and settings.
    pub checks: ChecksConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            countries: Vec::new(),
            priority_countries: Vec::new(),
            input: PathBuf::from("input"),
            output: PathBuf::from("output"),
            sharding: None,
            output_formats: vec![OutputFormat::Flags, OutputFormat::Metrics],
            loader: LoaderPolicy::default(),
            grouping: GroupingMode::default(),
            max_shard_load: DEFAULT_MAX_SHARD_LOAD,
            pool_kill_minutes: DEFAULT_POOL_KILL_MINUTES,
            max_concurrent_tasks: default_parallelism(),
            candidate_filter: CandidateFilter::default(),
            cache: CacheConfig::default(),
            checks: ChecksConfig::default(),
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl JobConfig {
    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_shard_load == 0 {
            return Err(ConfigError::Invalid("max_shard_load must be at least 1".into()));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid("max_concurrent_tasks must be at least 1".into()));
        }
        if self.pool_kill_minutes == 0 {
            return Err(ConfigError::Invalid("pool_kill_minutes must be at least 1".into()));
        }
        if let Some(bad) = self
            .countries
            .iter()
            .chain(self.priority_countries.iter())
            .find(|c| c.len() != 3 || !c.chars().all(|ch| ch.is_ascii_uppercase()))
        {
            return Err(ConfigError::Invalid(format!("country code {} is not ISO3", bad)));
        }
        Ok(())
    }

    /// Read the alternate sharding file, if configured.
    pub fn load_sharding(&self) -> Result<Option<Vec<ShardId>>, ConfigError> {
        let Some(path) = &self.sharding else {
            return Ok(None);
        };
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let names: Vec<String> = serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        names
            .iter()
            .map(|name| ShardId::parse(name).map_err(|e| ConfigError::Invalid(e.to_string())))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// Pool kill threshold.
    pub fn pool_kill(&self) -> Duration {
        Duration::from_secs(self.pool_kill_minutes.saturating_mul(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::LoadingStrategy;
    use crate::types::Distance;

    #[test]
    fn test_defaults() {
        let config = JobConfig::default();
        assert_eq!(config.max_shard_load, 60);
        assert_eq!(config.pool_kill(), Duration::from_secs(300 * 60));
        assert_eq!(config.loader.buffer_distance, Distance::kilometers(10.0));
        assert!(config.max_concurrent_tasks >= 1);
    }

    #[test]
    fn test_minimal_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(
            &path,
            r#"{
                "countries": ["XYZ"],
                "input": "/data/fragments",
                "loader": {"strategy": {"kind": "deferred", "relation_aware": true}},
                "checks": {"permitlist": ["OrphanEdge"]}
            }"#,
        )
        .unwrap();

        let config = JobConfig::from_file(&path).unwrap();
        assert_eq!(config.countries, vec!["XYZ"]);
        assert_eq!(config.input, PathBuf::from("/data/fragments"));
        assert_eq!(
            config.loader.strategy,
            LoadingStrategy::Deferred { relation_aware: true }
        );
        assert_eq!(config.loader.buffer_distance, Distance::kilometers(10.0));
        assert_eq!(config.checks.permitlist, vec!["OrphanEdge"]);
        assert_eq!(config.output_formats.len(), 2);
    }

    #[test]
    fn test_invalid_values() {
        let mut config = JobConfig::default();
        config.countries = vec!["xyz".into()];
        assert!(config.validate().is_err());

        let mut config = JobConfig::default();
        config.max_shard_load = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{").unwrap();
        let err = JobConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.json"));
    }

    #[test]
    fn test_load_sharding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sharding.json");
        std::fs::write(&path, r#"["10-512-511", "10-513-511"]"#).unwrap();

        let mut config = JobConfig::default();
        assert_eq!(config.load_sharding().unwrap(), None);

        config.sharding = Some(path.clone());
        assert_eq!(
            config.load_sharding().unwrap(),
            Some(vec![ShardId::new(10, 512, 511), ShardId::new(10, 513, 511)])
        );

        std::fs::write(&path, r#"["10-512"]"#).unwrap();
        assert!(matches!(config.load_sharding(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_country_and_group_overrides() {
        let checks: ChecksConfig = serde_json::from_str(
            r#"{
                "denylist": ["DuplicatePointLocation"],
                "checks": {"OrphanEdge": {"options": {"a": 1, "b": 1}}},
                "groups": {"EUR": ["FRA", "DEU"], "WEU": ["FRA"]},
                "overrides": {
                    "FRA": {"OrphanEdge": {"options": {"a": 2}}},
                    "EUR": {"OrphanEdge": {"enabled": false, "options": {"b": 3}}},
                    "WEU": {"OrphanEdge": {"enabled": true}}
                }
            }"#,
        )
        .unwrap();

        assert!(checks.is_listed("OrphanEdge"));
        assert!(!checks.is_listed("DuplicatePointLocation"));
        assert_eq!(checks.groups_of("FRA").collect::<Vec<_>>(), vec!["EUR", "WEU"]);

        let fra = checks.settings_for("OrphanEdge", "FRA");
        assert!(fra.enabled);
        assert_eq!(fra.options["a"], 2);
        assert_eq!(fra.options["b"], 3);

        let deu = checks.settings_for("OrphanEdge", "DEU");
        assert!(!deu.enabled);
        assert_eq!(deu.options["a"], 1);

        let xyz = checks.settings_for("OrphanEdge", "XYZ");
        assert_eq!(xyz, checks.checks["OrphanEdge"]);
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("FLAGS".parse::<OutputFormat>().unwrap(), OutputFormat::Flags);
        assert!("geojson".parse::<OutputFormat>().is_err());
    }
}
