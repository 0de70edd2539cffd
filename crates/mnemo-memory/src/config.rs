//! Memory configuration – TOML file with `MNEMO_*` environment overrides.
//!
//! Every field has a serde default, so a partial (or empty) TOML file is a
//! valid configuration:
//!
//! ```toml
//! [cache]
//! capacity = 9
//!
//! [associations]
//! decay_rate = 0.02
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise while loading or saving a [`MemoryConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to access config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// Short-term cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of items held at once (the "7 ± 2" span).
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

/// Episodic store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicConfig {
    /// SQLite database file backing the store.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_max_episodes")]
    pub max_episodes: usize,
    /// Extra rows removed once the limit is exceeded, so pruning does not run
    /// on every subsequent store.
    #[serde(default = "default_prune_slack")]
    pub prune_slack: usize,
}

/// Association graph settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationConfig {
    /// JSON snapshot file for the graph.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    /// Minimum effective strength for an edge to be reported or propagated.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_max_associations")]
    pub max_associations: usize,
    #[serde(default = "default_prune_slack")]
    pub prune_slack: usize,
    /// Exponential decay rate λ per hour since last reinforcement.
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
    /// Edges that decayed below this strength are dropped by an explicit
    /// prune pass.
    #[serde(default = "default_prune_floor")]
    pub prune_floor: f64,
}

/// Consolidation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    /// A consolidation becomes due after this many `record` calls.
    #[serde(default = "default_every_n_records")]
    pub every_n_records: u64,
    /// Number of most recent episodes mined per run.
    #[serde(default = "default_window")]
    pub window: usize,
    /// Minimum number of episodes sharing a tag for it to count as a pattern.
    #[serde(default = "default_min_pattern_size")]
    pub min_pattern_size: usize,
    /// Scheduler polling interval.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Run due consolidations synchronously at the end of `record` instead of
    /// waiting for the background scheduler.
    #[serde(default)]
    pub inline: bool,
}

/// Recall fusion settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallConfig {
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

/// Full configuration of the memory engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub episodic: EpisodicConfig,
    #[serde(default)]
    pub associations: AssociationConfig,
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    #[serde(default)]
    pub recall: RecallConfig,
}

// ─────────────────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────────────────

fn default_cache_capacity() -> usize {
    7
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data").join("episodic_memory.db")
}
fn default_max_episodes() -> usize {
    1000
}
fn default_prune_slack() -> usize {
    100
}
fn default_snapshot_path() -> PathBuf {
    PathBuf::from("data").join("associations.json")
}
fn default_threshold() -> f64 {
    0.5
}
fn default_max_associations() -> usize {
    1000
}
fn default_decay_rate() -> f64 {
    0.01
}
fn default_prune_floor() -> f64 {
    0.01
}
fn default_every_n_records() -> u64 {
    100
}
fn default_window() -> usize {
    50
}
fn default_min_pattern_size() -> usize {
    3
}
fn default_interval_secs() -> u64 {
    60
}
fn default_max_results() -> usize {
    10
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
        }
    }
}

impl Default for EpisodicConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_episodes: default_max_episodes(),
            prune_slack: default_prune_slack(),
        }
    }
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            threshold: default_threshold(),
            max_associations: default_max_associations(),
            prune_slack: default_prune_slack(),
            decay_rate: default_decay_rate(),
            prune_floor: default_prune_floor(),
        }
    }
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            every_n_records: default_every_n_records(),
            window: default_window(),
            min_pattern_size: default_min_pattern_size(),
            interval_secs: default_interval_secs(),
            inline: false,
        }
    }
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Construction / validation
// ─────────────────────────────────────────────────────────────────────────────

impl MemoryConfig {
    /// Default configuration with both durable files placed under `data_dir`.
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let mut cfg = Self::default();
        cfg.set_data_dir(data_dir);
        cfg
    }

    /// Move both durable files under `data_dir`, keeping their file names.
    pub fn set_data_dir(&mut self, data_dir: impl AsRef<Path>) {
        let dir = data_dir.as_ref();
        self.episodic.db_path = dir.join("episodic_memory.db");
        self.associations.snapshot_path = dir.join("associations.json");
    }

    /// Return a copy with every value forced into its usable range.
    ///
    /// Capacities are at least 1, slack never exceeds the limit it applies
    /// to, thresholds and floors lie in `[0, 1]`, and the decay rate is
    /// non-negative.
    pub fn validated(mut self) -> Self {
        self.cache.capacity = self.cache.capacity.max(1);

        self.episodic.max_episodes = self.episodic.max_episodes.max(1);
        self.episodic.prune_slack = self.episodic.prune_slack.min(self.episodic.max_episodes - 1);

        let assoc = &mut self.associations;
        assoc.max_associations = assoc.max_associations.max(1);
        assoc.prune_slack = assoc.prune_slack.min(assoc.max_associations - 1);
        assoc.threshold = mnemo_types::clamp_unit(assoc.threshold);
        assoc.prune_floor = mnemo_types::clamp_unit(assoc.prune_floor);
        assoc.decay_rate = if assoc.decay_rate.is_finite() {
            assoc.decay_rate.max(0.0)
        } else {
            0.0
        };

        self.consolidation.every_n_records = self.consolidation.every_n_records.max(1);
        self.consolidation.window = self.consolidation.window.max(1);
        self.consolidation.min_pattern_size = self.consolidation.min_pattern_size.max(1);
        self.consolidation.interval_secs = self.consolidation.interval_secs.max(1);

        self.recall.max_results = self.recall.max_results.max(1);
        self
    }

    /// Load a config from `path`.  Returns `Ok(None)` if the file does not
    /// exist.  Environment overrides are applied to a loaded config.
    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg: MemoryConfig = toml::from_str(&raw)?;
        cfg.apply_env_overrides();
        Ok(Some(cfg))
    }

    /// Write the config to `path` as pretty TOML, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let raw = toml::to_string_pretty(self)?;
        fs::write(path, raw).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `MNEMO_*` environment variable overrides.
    ///
    /// | Variable | Config field |
    /// |---|---|
    /// | `MNEMO_DATA_DIR` | both durable paths (see [`set_data_dir`][Self::set_data_dir]) |
    /// | `MNEMO_CACHE_CAPACITY` | `cache.capacity` |
    /// | `MNEMO_MAX_EPISODES` | `episodic.max_episodes` |
    /// | `MNEMO_MAX_ASSOCIATIONS` | `associations.max_associations` |
    /// | `MNEMO_DECAY_RATE` | `associations.decay_rate` |
    ///
    /// Unparsable numeric values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("MNEMO_DATA_DIR") {
            self.set_data_dir(dir);
        }
        if let Some(v) = env_parse::<usize>("MNEMO_CACHE_CAPACITY") {
            self.cache.capacity = v;
        }
        if let Some(v) = env_parse::<usize>("MNEMO_MAX_EPISODES") {
            self.episodic.max_episodes = v;
        }
        if let Some(v) = env_parse::<usize>("MNEMO_MAX_ASSOCIATIONS") {
            self.associations.max_associations = v;
        }
        if let Some(v) = env_parse::<f64>("MNEMO_DECAY_RATE") {
            self.associations.decay_rate = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}
