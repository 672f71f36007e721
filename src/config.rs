//! Configuration module for index builds and searches.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file (`.pqgraph/settings.toml`)
//! - Environment variable overrides
//! - CLI argument overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `PQG_` and use double underscores
//! to separate nested levels:
//! - `PQG_BUILD__PARALLEL_THREADS=8` sets `build.parallel_threads`
//! - `PQG_SEARCH__CACHE_BYTES=1048576` sets `search.cache_bytes`
//! - `PQG_DISTANCE=cosine` sets `distance`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::index::{BuildParams, ReaderParams};
use crate::vector::Distance;

/// Directory holding the settings file, searched upwards from the cwd.
pub const CONFIG_DIR: &str = ".pqgraph";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory holding `<name>.vectors`, `<name>.graph` and `<name>.data`
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,

    /// Global debug mode
    #[serde(default)]
    pub debug: bool,

    /// Metric used for building and searching
    #[serde(default)]
    pub distance: Distance,

    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BuildConfig {
    /// Out-degree bound of every vertex
    #[serde(default = "default_max_connections")]
    pub max_connections_per_vertex: usize,

    /// Candidate queue capacity of the pruning search
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    /// Upper bound of the robust-prune alpha factor
    #[serde(default = "default_distance_multiplication")]
    pub distance_multiplication: f32,

    /// Vector bytes per PQ code byte
    #[serde(default = "default_compression_ratio")]
    pub compression_ratio: usize,

    /// Memory budget of one in-memory partition graph
    #[serde(default = "default_memory_budget")]
    pub memory_budget_bytes: u64,

    /// Number of worker threads (defaults to CPU count)
    #[serde(default = "default_parallel_threads")]
    pub parallel_threads: usize,

    /// Seed for every random choice of the build
    #[serde(default = "default_seed")]
    pub seed: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SearchConfig {
    /// Candidate queue capacity of `nearest`
    #[serde(default = "default_search_candidates")]
    pub max_candidates: usize,

    /// Byte budget of the graph page cache
    #[serde(default = "default_cache_bytes")]
    pub cache_bytes: u64,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_index_path() -> PathBuf {
    PathBuf::from(".pqgraph/index")
}
fn default_max_connections() -> usize {
    64
}
fn default_max_candidates() -> usize {
    128
}
fn default_distance_multiplication() -> f32 {
    1.2
}
fn default_compression_ratio() -> usize {
    16
}
fn default_memory_budget() -> u64 {
    1 << 30
}
fn default_parallel_threads() -> usize {
    num_cpus::get()
}
fn default_seed() -> u64 {
    42
}
fn default_search_candidates() -> usize {
    64
}
fn default_cache_bytes() -> u64 {
    64 << 20
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            index_path: default_index_path(),
            debug: false,
            distance: Distance::default(),
            build: BuildConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_connections_per_vertex: default_max_connections(),
            max_candidates: default_max_candidates(),
            distance_multiplication: default_distance_multiplication(),
            compression_ratio: default_compression_ratio(),
            memory_budget_bytes: default_memory_budget(),
            parallel_threads: default_parallel_threads(),
            seed: default_seed(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_candidates: default_search_candidates(),
            cache_bytes: default_cache_bytes(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join("settings.toml"));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honoring `PQG_` variables
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nested levels; single underscores stay
            .merge(Env::prefixed("PQG_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Find the settings file by looking for the config directory
    /// from the current directory up to the root
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        current
            .ancestors()
            .map(|ancestor| ancestor.join(CONFIG_DIR))
            .find(|dir| dir.is_dir())
            .map(|dir| dir.join("settings.toml"))
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file with helpful comments
    pub fn init_config_file(
        dir: impl AsRef<Path>,
        force: bool,
    ) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = dir.as_ref().join(CONFIG_DIR).join("settings.toml");

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let defaults = Settings::default();
        let template = format!(
            r#"# pqgraph configuration file

# Version of the configuration schema
version = 1

# Directory holding <name>.vectors, <name>.graph and <name>.data
index_path = "{}"

# Global debug mode
debug = false

# Metric: "l2", "dot" or "cosine"
distance = "{}"

[build]
# Out-degree bound of every graph vertex
max_connections_per_vertex = {}

# Candidate queue capacity used while pruning
max_candidates = {}

# Upper bound of the robust-prune alpha factor
distance_multiplication = {:.1}

# Vector bytes per PQ code byte; must divide dimension * 4
compression_ratio = {}

# Memory budget of one in-memory partition graph, in bytes
memory_budget_bytes = {}

# Number of worker threads (defaults to CPU count)
# parallel_threads = {}

# Seed for every random choice of the build
seed = {}

[search]
# Candidate queue capacity of nearest-neighbor queries
max_candidates = {}

# Byte budget of the graph page cache
cache_bytes = {}
"#,
            defaults.index_path.display(),
            defaults.distance,
            defaults.build.max_connections_per_vertex,
            defaults.build.max_candidates,
            defaults.build.distance_multiplication,
            defaults.build.compression_ratio,
            defaults.build.memory_budget_bytes,
            defaults.build.parallel_threads,
            defaults.build.seed,
            defaults.search.max_candidates,
            defaults.search.cache_bytes,
        );

        std::fs::write(&config_path, template)?;
        Ok(config_path)
    }

    /// Builder parameters for index `name` of vectors of `dimension`.
    pub fn build_params(&self, name: &str, dimension: usize) -> BuildParams {
        BuildParams {
            name: name.to_string(),
            dimension,
            index_dir: self.index_path.clone(),
            scratch_dir: None,
            memory_budget_bytes: self.build.memory_budget_bytes,
            max_connections_per_vertex: self.build.max_connections_per_vertex,
            max_candidates: self.build.max_candidates,
            distance_multiplication: self.build.distance_multiplication,
            compression_ratio: self.build.compression_ratio,
            distance: self.distance,
            parallel_threads: self.build.parallel_threads,
            seed: self.build.seed,
        }
    }

    /// Reader parameters for index `name` of vectors of `dimension`.
    pub fn reader_params(&self, name: &str, dimension: usize) -> ReaderParams {
        ReaderParams {
            name: name.to_string(),
            dimension,
            index_dir: self.index_path.clone(),
            max_connections_per_vertex: self.build.max_connections_per_vertex,
            max_candidates: self.search.max_candidates,
            compression_ratio: self.build.compression_ratio,
            cache_bytes: self.search.cache_bytes as usize,
            distance: self.distance,
        }
    }
}
