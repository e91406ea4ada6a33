//! Engine configuration
//!
//! Loaded from JSON or built in code:
//!
//! ```json
//! {
//!   "cache": { "max_entries": 256 },
//!   "max_pull_depth": 64,
//!   "fuzzy_delta": 0.0005
//! }
//! ```
//!
//! Every field has a default, so `{}` is a valid configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::error::{CMMError, Result};
use crate::rank::{RankEvaluator, DEFAULT_FUZZY_DELTA};

/// Default bound on the depth of an upstream pull
pub const DEFAULT_MAX_PULL_DEPTH: usize = 256;

/// Default number of graph events kept for inspection
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 256;

/// Configuration shared by the registry, cache and graph engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Context cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Maximum number of nodes on one upstream path
    #[serde(default = "default_max_pull_depth")]
    pub max_pull_depth: usize,

    /// Relative delta for numeric property values; `null` for exact ranking
    #[serde(default = "default_fuzzy_delta")]
    pub fuzzy_delta: Option<f64>,

    /// Providers declaring this API version earn a rank bonus
    #[serde(default = "default_core_version")]
    pub core_version: String,

    /// Number of graph events retained by `Graph::events`
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,
}

fn default_max_pull_depth() -> usize {
    DEFAULT_MAX_PULL_DEPTH
}

fn default_fuzzy_delta() -> Option<f64> {
    Some(DEFAULT_FUZZY_DELTA)
}

fn default_core_version() -> String {
    crate::CORE_API_VERSION.to_string()
}

fn default_event_log_capacity() -> usize {
    DEFAULT_EVENT_LOG_CAPACITY
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            max_pull_depth: default_max_pull_depth(),
            fuzzy_delta: default_fuzzy_delta(),
            core_version: default_core_version(),
            event_log_capacity: default_event_log_capacity(),
        }
    }
}

impl EngineConfig {
    /// Parse configuration JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json).map_err(|e| CMMError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| CMMError::ConfigLoadError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json(&content)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.cache.max_entries == 0 {
            return Err(CMMError::InvalidConfig {
                reason: "cache.max_entries must be at least 1".to_string(),
            });
        }
        if self.max_pull_depth == 0 {
            return Err(CMMError::InvalidConfig {
                reason: "max_pull_depth must be at least 1".to_string(),
            });
        }
        if let Some(delta) = self.fuzzy_delta {
            if !(delta.is_finite() && delta >= 0.0) {
                return Err(CMMError::InvalidConfig {
                    reason: format!("fuzzy_delta must be a non-negative number, got {}", delta),
                });
            }
        }
        Ok(())
    }

    /// Set cache configuration
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set pull depth bound
    pub fn with_max_pull_depth(mut self, depth: usize) -> Self {
        self.max_pull_depth = depth;
        self
    }

    /// Set fuzzy delta (`None` for exact ranking)
    pub fn with_fuzzy_delta(mut self, delta: Option<f64>) -> Self {
        self.fuzzy_delta = delta;
        self
    }

    /// Set the core API version used for the compatibility bonus
    pub fn with_core_version(mut self, version: impl Into<String>) -> Self {
        self.core_version = version.into();
        self
    }

    /// Set event log capacity
    pub fn with_event_log_capacity(mut self, capacity: usize) -> Self {
        self.event_log_capacity = capacity;
        self
    }

    /// Rank evaluator matching `fuzzy_delta`
    pub fn rank_evaluator(&self) -> RankEvaluator {
        RankEvaluator {
            fuzzy: self.fuzzy_delta,
        }
    }
}
