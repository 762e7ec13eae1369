//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - plancache.toml (default configuration)
//! - plancache.local.toml (git-ignored local overrides)
//! - Environment variables (PLANCACHE_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # plancache.toml
//! [cache]
//! capacity = 2048
//! clone_pool_max = 8
//!
//! [eviction]
//! cleanup_interval_secs = 900
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! PLANCACHE_CACHE__CAPACITY=4096
//! PLANCACHE_EVICTION__CLEANUP_INTERVAL_SECS=600
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub eviction: EvictionConfig,
    #[serde(default)]
    pub recompile: RecompileConfig,
}

/// Core cache sizing knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Soft capacity in entries. Exceeding it triggers a full cleanup;
    /// it is never a hard limit on inserts.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Maximum ready-to-run clones pooled per entry
    #[serde(default = "default_clone_pool_max")]
    pub clone_pool_max: usize,
}

/// Eviction / cleanup knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Wall-clock interval between timeout cleanups, in seconds.
    /// Entries idle longer than this are eligible for removal.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Fraction of the capacity overage removed by a full cleanup
    #[serde(default = "default_overage_ratio")]
    pub overage_ratio: f64,

    /// Extra fraction of capacity removed on top of the overage,
    /// so a full cleanup buys headroom instead of running back-to-back
    #[serde(default = "default_extra_ratio")]
    pub extra_ratio: f64,
}

/// Cardinality-drift recompilation knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecompileConfig {
    /// Minimum seconds between drift checks on a single entry
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Multiplicative growth/shrink factor beyond which a related
    /// object's page count is considered drifted
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,

    /// Page counts at or above this are treated as stable: drift on
    /// already-huge objects is noise, not a plan-shape change
    #[serde(default = "default_noise_ceiling")]
    pub noise_ceiling: i64,
}

// Default value functions
fn default_capacity() -> usize {
    2048
}
fn default_clone_pool_max() -> usize {
    8
}
fn default_cleanup_interval_secs() -> u64 {
    900 // 15 minutes
}
fn default_overage_ratio() -> f64 {
    1.0
}
fn default_extra_ratio() -> f64 {
    0.1
}
fn default_check_interval_secs() -> u64 {
    600 // 10 minutes
}
fn default_growth_factor() -> f64 {
    8.0
}
fn default_noise_ceiling() -> i64 {
    100_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity: default_capacity(),
            clone_pool_max: default_clone_pool_max(),
        }
    }
}

impl Default for EvictionConfig {
    fn default() -> Self {
        EvictionConfig {
            cleanup_interval_secs: default_cleanup_interval_secs(),
            overage_ratio: default_overage_ratio(),
            extra_ratio: default_extra_ratio(),
        }
    }
}

impl Default for RecompileConfig {
    fn default() -> Self {
        RecompileConfig {
            check_interval_secs: default_check_interval_secs(),
            growth_factor: default_growth_factor(),
            noise_ceiling: default_noise_ceiling(),
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. plancache.toml (base configuration)
    /// 2. plancache.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (PLANCACHE_* prefix)
    pub fn load() -> CacheResult<Self> {
        let config: Config = Figment::new()
            .merge(Toml::file("plancache.toml"))
            .merge(Toml::file("plancache.local.toml"))
            .merge(Env::prefixed("PLANCACHE_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn from_file(path: &str) -> CacheResult<Self> {
        let config: Config = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PLANCACHE_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants the serde layer cannot express
    pub fn validate(&self) -> CacheResult<()> {
        if self.cache.capacity == 0 {
            return Err(CacheError::Config(
                "cache.capacity must be at least 1".to_string(),
            ));
        }
        if self.eviction.overage_ratio <= 0.0 || self.eviction.overage_ratio > 1.0 {
            return Err(CacheError::Config(format!(
                "eviction.overage_ratio must be in (0, 1], got {}",
                self.eviction.overage_ratio
            )));
        }
        if self.eviction.extra_ratio < 0.0 || self.eviction.extra_ratio > 1.0 {
            return Err(CacheError::Config(format!(
                "eviction.extra_ratio must be in [0, 1], got {}",
                self.eviction.extra_ratio
            )));
        }
        if self.recompile.growth_factor <= 1.0 {
            return Err(CacheError::Config(format!(
                "recompile.growth_factor must exceed 1.0, got {}",
                self.recompile.growth_factor
            )));
        }
        if self.recompile.noise_ceiling <= 0 {
            return Err(CacheError::Config(format!(
                "recompile.noise_ceiling must be positive, got {}",
                self.recompile.noise_ceiling
            )));
        }
        Ok(())
    }
}
