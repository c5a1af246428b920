//! Balancer configuration
//!
//! Configuration loaded from a TOML file and/or environment variables.
//! Every option can be changed at runtime through
//! `BalanceCoordinator::reconfigure`; values are validated before they are
//! swapped in, never in the middle of a search.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::partitioner::IndexGroupPartitioner;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid grouping pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

const MIB: u64 = 1024 * 1024;

/// Upper bound for the search time limit (one hour)
pub const MAX_SEARCH_TIME_LIMIT_SECS: u64 = 3600;

/// Upper bound for the size-estimate staleness window (one year)
pub const MAX_MODEL_AGE_MINUTES: u64 = 365 * 24 * 60;

/// One ordered grouping rule.
///
/// In TOML a rule is either a bare regex (`"logs-\\d+"`) or a table
/// `{ pattern = "...", name = "...", primaries = true, replicas = false }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "GroupRuleRepr")]
pub struct GroupRule {
    /// Regex matched against the whole index name
    pub pattern: String,
    /// Group name; defaults to the pattern text
    pub name: Option<String>,
    /// Primaries are in balancing scope
    pub primaries: bool,
    /// Replicas are in balancing scope
    pub replicas: bool,
}

impl GroupRule {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            name: None,
            primaries: true,
            replicas: true,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn primaries_only(mut self) -> Self {
        self.primaries = true;
        self.replicas = false;
        self
    }

    pub fn group_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.pattern)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GroupRuleRepr {
    Pattern(String),
    Table {
        pattern: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default = "default_true")]
        primaries: bool,
        #[serde(default = "default_true")]
        replicas: bool,
    },
}

fn default_true() -> bool {
    true
}

impl From<GroupRuleRepr> for GroupRule {
    fn from(repr: GroupRuleRepr) -> Self {
        match repr {
            GroupRuleRepr::Pattern(pattern) => GroupRule::new(pattern),
            GroupRuleRepr::Table {
                pattern,
                name,
                primaries,
                replicas,
            } => GroupRule {
                pattern,
                name,
                primaries,
                replicas,
            },
        }
    }
}

/// Balancer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Ordered grouping rules; first match wins
    pub grouping_patterns: Vec<GroupRule>,

    /// Maximum number of relocations in one batch
    pub concurrent_rebalance: usize,

    /// Groups that are never scored or rebalanced
    pub excluded_groups: Vec<String>,

    /// Candidates popped per expansion round
    pub search_depth: usize,

    /// Fraction of eligible destinations evaluated per shard (0.0 - 1.0]
    pub search_scale_factor: f64,

    /// Top candidates retained per round
    pub best_candidate_queue_size: usize,

    /// Shards at or below this many bytes are never moved
    pub minimum_shard_movement_overhead: u64,

    /// Upper bound on the risk rate of one batch
    pub maximum_allowed_risk_rate: f64,

    /// Minimum score improvement, relative to the current score, for a move to count
    pub minimum_node_size_change_rate: f64,

    /// Never choose blacklisted nodes as destinations
    pub expunge_blacklisted_nodes: bool,

    /// Wall-clock budget for one search in seconds
    pub search_time_limit_secs: u64,

    /// Size estimates older than this many minutes are stale
    pub model_age_minutes: u64,

    /// Size assumed for shards without a fresh estimate
    pub default_shard_size: u64,

    /// Weight each group's score by its share of cluster bytes
    pub weight_by_group_size: bool,

    /// Seed for tie-breaking; random when unset
    pub random_seed: Option<u64>,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            grouping_patterns: Vec::new(),
            concurrent_rebalance: 2,
            excluded_groups: Vec::new(),
            search_depth: 5,
            search_scale_factor: 1.0,
            best_candidate_queue_size: 1000,
            minimum_shard_movement_overhead: MIB,
            maximum_allowed_risk_rate: 1.25,
            minimum_node_size_change_rate: 0.0,
            expunge_blacklisted_nodes: false,
            search_time_limit_secs: 5,
            model_age_minutes: 60,
            default_shard_size: 128 * MIB,
            weight_by_group_size: false,
            random_seed: None,
        }
    }
}

impl BalancerConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Create configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Overlay `TEMPEST_*` environment variables, then validate
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(patterns) = std::env::var("TEMPEST_GROUPING_PATTERNS") {
            self.grouping_patterns = patterns
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(GroupRule::new)
                .collect();
        }

        if let Ok(groups) = std::env::var("TEMPEST_EXCLUDED_GROUPS") {
            self.excluded_groups = groups
                .split(',')
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(v) = env_value("TEMPEST_CONCURRENT_REBALANCE")? {
            self.concurrent_rebalance = v;
        }
        if let Some(v) = env_value("TEMPEST_SEARCH_DEPTH")? {
            self.search_depth = v;
        }
        if let Some(v) = env_value("TEMPEST_SEARCH_SCALE_FACTOR")? {
            self.search_scale_factor = v;
        }
        if let Some(v) = env_value("TEMPEST_BEST_CANDIDATE_QUEUE_SIZE")? {
            self.best_candidate_queue_size = v;
        }
        if let Some(v) = env_value("TEMPEST_MINIMUM_SHARD_MOVEMENT_OVERHEAD")? {
            self.minimum_shard_movement_overhead = v;
        }
        if let Some(v) = env_value("TEMPEST_MAXIMUM_ALLOWED_RISK_RATE")? {
            self.maximum_allowed_risk_rate = v;
        }
        if let Some(v) = env_value("TEMPEST_MINIMUM_NODE_SIZE_CHANGE_RATE")? {
            self.minimum_node_size_change_rate = v;
        }
        if let Some(v) = env_value("TEMPEST_EXPUNGE_BLACKLISTED_NODES")? {
            self.expunge_blacklisted_nodes = v;
        }
        if let Some(v) = env_value("TEMPEST_SEARCH_TIME_LIMIT_SECONDS")? {
            self.search_time_limit_secs = v;
        }
        if let Some(v) = env_value("TEMPEST_MODEL_AGE_MINUTES")? {
            self.model_age_minutes = v;
        }
        if let Some(v) = env_value("TEMPEST_DEFAULT_SHARD_SIZE")? {
            self.default_shard_size = v;
        }
        if let Some(v) = env_value("TEMPEST_WEIGHT_BY_GROUP_SIZE")? {
            self.weight_by_group_size = v;
        }
        if let Some(v) = env_value("TEMPEST_RANDOM_SEED")? {
            self.random_seed = Some(v);
        }

        self.validate()?;
        Ok(self)
    }

    /// Check ranges and compile the grouping patterns
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrent_rebalance == 0 {
            return Err(invalid("concurrent_rebalance", "must be at least 1"));
        }
        if self.search_depth == 0 {
            return Err(invalid("search_depth", "must be at least 1"));
        }
        if !(self.search_scale_factor > 0.0 && self.search_scale_factor <= 1.0) {
            return Err(invalid(
                "search_scale_factor",
                format!("{} is outside (0, 1]", self.search_scale_factor),
            ));
        }
        if self.best_candidate_queue_size == 0 {
            return Err(invalid("best_candidate_queue_size", "must be at least 1"));
        }
        if !(self.maximum_allowed_risk_rate > 0.0) {
            return Err(invalid(
                "maximum_allowed_risk_rate",
                format!("{} must be positive", self.maximum_allowed_risk_rate),
            ));
        }
        if !(0.0..1.0).contains(&self.minimum_node_size_change_rate) {
            return Err(invalid(
                "minimum_node_size_change_rate",
                format!("{} is outside [0, 1)", self.minimum_node_size_change_rate),
            ));
        }
        if !(1..=MAX_SEARCH_TIME_LIMIT_SECS).contains(&self.search_time_limit_secs) {
            return Err(invalid(
                "search_time_limit_secs",
                format!(
                    "{} is outside [1, {}]",
                    self.search_time_limit_secs, MAX_SEARCH_TIME_LIMIT_SECS
                ),
            ));
        }
        if !(1..=MAX_MODEL_AGE_MINUTES).contains(&self.model_age_minutes) {
            return Err(invalid(
                "model_age_minutes",
                format!(
                    "{} is outside [1, {}]",
                    self.model_age_minutes, MAX_MODEL_AGE_MINUTES
                ),
            ));
        }
        if self.default_shard_size == 0 {
            return Err(invalid("default_shard_size", "must be at least 1"));
        }

        IndexGroupPartitioner::new(&self.grouping_patterns)?;
        Ok(())
    }

    /// Get search time limit as Duration
    pub fn search_time_limit(&self) -> Duration {
        Duration::from_secs(self.search_time_limit_secs)
    }

    /// Get the size-estimate staleness window
    pub fn model_age(&self) -> chrono::Duration {
        i64::try_from(self.model_age_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn is_group_excluded(&self, group: &str) -> bool {
        self.excluded_groups.iter().any(|g| g == group)
    }
}

fn invalid(name: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue(name.to_string(), reason.into())
}

fn env_value<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw)),
        Err(_) => Ok(None),
    }
}
