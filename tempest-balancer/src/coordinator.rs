//! Balance coordinator
//!
//! The engine's entry point, invoked by the host once per scheduling cycle.
//! It builds the model, runs the balancer, classifies the outcome and
//! publishes a new `EngineState`. State is never mutated in place: each cycle
//! replaces the shared `Arc` so concurrent readers always see a complete
//! prior value.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use tempest_core::{ClusterSnapshot, IndexMetadata, ShardKey};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::balancer::{BalanceStep, HeuristicBalancer, HoldReason};
use crate::config::{BalancerConfig, ConfigError};
use crate::deciders::ConstraintChain;
use crate::estimator::ShardSizeEstimator;
use crate::model::{ModelBuilder, ModelCluster};
use crate::moves::{MoveDescription, ShardAssignment};
use crate::partitioner::{GroupId, IndexGroupPartitioner};
use crate::scorer::NEGLIGIBLE_SCORE;

/// Coordinator errors
#[derive(Error, Debug)]
pub enum BalancerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, BalancerError>;

/// Outcome class of one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalanceDecision {
    /// At least one placement or relocation was produced
    Balancing,
    /// Nothing left to improve
    Balanced,
    /// Work exists but cannot proceed this cycle
    OnHold,
    /// The cycle was skipped
    NoOp,
}

impl fmt::Display for BalanceDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BalanceDecision::Balancing => "BALANCING",
            BalanceDecision::Balanced => "BALANCED",
            BalanceDecision::OnHold => "ON_HOLD",
            BalanceDecision::NoOp => "NO_OP",
        };
        f.write_str(name)
    }
}

/// State carried across cycles
#[derive(Debug, Clone, Serialize)]
pub struct EngineState {
    pub last_rebalance_attempt: DateTime<Utc>,
    pub last_balance_change: DateTime<Utc>,
    pub last_optimal_found: DateTime<Utc>,
    pub last_score: f64,
    /// Node host name to group label to that node's score contribution
    pub node_group_scores: BTreeMap<String, BTreeMap<String, f64>>,
    /// Pre-approved batches, in application order
    pub future_batches: Vec<Vec<MoveDescription>>,
    pub status: String,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            last_rebalance_attempt: DateTime::<Utc>::UNIX_EPOCH,
            last_balance_change: DateTime::<Utc>::UNIX_EPOCH,
            last_optimal_found: DateTime::<Utc>::UNIX_EPOCH,
            last_score: 0.0,
            node_group_scores: BTreeMap::new(),
            future_batches: Vec::new(),
            status: "unknown".to_string(),
        }
    }
}

/// What the host should do after a cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleOutcome {
    pub decision: BalanceDecision,
    /// Unassigned copies to place
    pub assignments: Vec<ShardAssignment>,
    /// Relocations to start, in order
    pub moves: Vec<MoveDescription>,
    /// Score of the snapshot the cycle saw
    pub score: f64,
}

impl CycleOutcome {
    fn no_op() -> Self {
        Self {
            decision: BalanceDecision::NoOp,
            assignments: Vec::new(),
            moves: Vec::new(),
            score: 0.0,
        }
    }
}

/// Operator-facing status
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub group_mapping: BTreeMap<GroupId, Vec<String>>,
    /// Indices without fresh size estimates
    pub young_indexes: BTreeSet<String>,
    pub last_rebalance_attempt: DateTime<Utc>,
    pub last_balance_change: DateTime<Utc>,
    pub last_optimal_found: DateTime<Utc>,
    pub status: String,
    pub balance_score: f64,
    pub retained_batches: usize,
    pub node_group_scores: BTreeMap<String, BTreeMap<String, f64>>,
}

/// Configuration and everything derived from it
struct Settings {
    config: BalancerConfig,
    partitioner: IndexGroupPartitioner,
}

impl Settings {
    fn new(config: BalancerConfig) -> Result<Self> {
        config.validate()?;
        let partitioner = IndexGroupPartitioner::new(&config.grouping_patterns)?;
        Ok(Self {
            config,
            partitioner,
        })
    }
}

/// The engine
pub struct BalanceCoordinator {
    settings: RwLock<Arc<Settings>>,
    chain: ConstraintChain,
    state: RwLock<Arc<EngineState>>,
    estimator: Mutex<ShardSizeEstimator>,
    rng: Mutex<StdRng>,
}

impl BalanceCoordinator {
    /// Create a coordinator; the configuration is validated first
    pub fn new(config: BalancerConfig, chain: ConstraintChain) -> Result<Self> {
        let settings = Settings::new(config)?;
        let estimator = ShardSizeEstimator::new(
            settings.config.model_age(),
            settings.config.default_shard_size,
        );
        let rng = seeded_rng(settings.config.random_seed);

        info!(
            groups = settings.config.grouping_patterns.len(),
            deciders = chain.len(),
            concurrent_rebalance = settings.config.concurrent_rebalance,
            "Balance coordinator created"
        );

        Ok(Self {
            settings: RwLock::new(Arc::new(settings)),
            chain,
            state: RwLock::new(Arc::new(EngineState::default())),
            estimator: Mutex::new(estimator),
            rng: Mutex::new(rng),
        })
    }

    /// Current configuration
    pub fn config(&self) -> BalancerConfig {
        self.settings.read().config.clone()
    }

    /// Latest published state
    pub fn state(&self) -> Arc<EngineState> {
        self.state.read().clone()
    }

    /// Swap in a new configuration. An invalid one leaves the current
    /// configuration in place.
    pub fn reconfigure(&self, config: BalancerConfig) -> Result<()> {
        let settings = match Settings::new(config) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "Configuration rejected");
                return Err(e);
            }
        };

        self.estimator.lock().reconfigure(
            settings.config.model_age(),
            settings.config.default_shard_size,
        );

        let previous_seed = self.settings.read().config.random_seed;
        if settings.config.random_seed.is_some() && settings.config.random_seed != previous_seed {
            *self.rng.lock() = seeded_rng(settings.config.random_seed);
        }

        *self.settings.write() = Arc::new(settings);
        info!("Configuration updated");
        Ok(())
    }

    /// Run one cycle against `snapshot`
    pub fn allocate(&self, snapshot: &ClusterSnapshot) -> CycleOutcome {
        self.allocate_at(snapshot, Utc::now())
    }

    /// Run one cycle with an explicit clock
    #[instrument(skip_all, fields(nodes = snapshot.nodes.len(), shards = snapshot.shards.len()))]
    pub fn allocate_at(&self, snapshot: &ClusterSnapshot, now: DateTime<Utc>) -> CycleOutcome {
        if snapshot.nodes.is_empty() {
            debug!("No live nodes, skipping cycle");
            return CycleOutcome::no_op();
        }

        let settings = self.settings.read().clone();
        let model = {
            let mut estimator = self.estimator.lock();
            ModelBuilder::new(&settings.partitioner, &mut estimator, &settings.config)
                .build(snapshot, now)
        };

        let previous = self.state();
        let step = {
            let mut rng = self.rng.lock();
            HeuristicBalancer::new(&settings.config, &self.chain).balance(
                &model,
                &previous.future_batches,
                &mut *rng,
            )
        };

        let mut next = EngineState::clone(&previous);
        next.last_rebalance_attempt = now;
        next.last_score = model.balance_score();
        next.node_group_scores = node_group_scores(&model);

        let mut outcome = CycleOutcome {
            decision: BalanceDecision::Balancing,
            assignments: Vec::new(),
            moves: Vec::new(),
            score: model.balance_score(),
        };

        match step {
            BalanceStep::Allocated(assignments) => {
                outcome.assignments = assignments;
            }
            BalanceStep::Evacuated(moves) => {
                outcome.moves = moves;
            }
            BalanceStep::Rebalanced {
                batch, remaining, ..
            } => {
                outcome.moves = batch;
                next.future_batches = remaining;
            }
            BalanceStep::Balanced => {
                outcome.decision = BalanceDecision::Balanced;
            }
            BalanceStep::OnHold(reason) => {
                outcome.decision = BalanceDecision::OnHold;
                next.status = match reason {
                    HoldReason::ShardsInFlight => "on hold: shards in flight",
                    HoldReason::Blocked => "on hold: moves blocked by constraints",
                }
                .to_string();
            }
        }

        match outcome.decision {
            BalanceDecision::Balancing => {
                next.last_balance_change = now;
                next.status = "balancing".to_string();
            }
            BalanceDecision::Balanced => {
                next.last_optimal_found = now;
                next.status = "balanced".to_string();
                next.future_batches.clear();
            }
            BalanceDecision::OnHold | BalanceDecision::NoOp => {}
        }

        info!(
            decision = %outcome.decision,
            assignments = outcome.assignments.len(),
            moves = outcome.moves.len(),
            retained = next.future_batches.len(),
            score = outcome.score,
            "Cycle complete"
        );

        *self.state.write() = Arc::new(next);
        outcome
    }

    /// Per-shard explanations are not offered: the engine reasons about
    /// batches, not single-shard what-ifs.
    pub fn explain_allocation(&self, shard: &ShardKey, node: &str) -> Result<Infallible> {
        debug!(shard = %shard, node, "Explanation requested");
        Err(BalancerError::Unsupported(
            "per-shard allocation explanation",
        ))
    }

    /// Status snapshot for operators
    pub fn report(&self, indices: &[IndexMetadata]) -> StatusReport {
        self.report_at(indices, Utc::now())
    }

    pub fn report_at(&self, indices: &[IndexMetadata], now: DateTime<Utc>) -> StatusReport {
        let settings = self.settings.read().clone();
        let state = self.state();
        let young_indexes = self.estimator.lock().young_indexes(indices, now);

        StatusReport {
            group_mapping: settings
                .partitioner
                .group_mapping(indices.iter().map(|i| i.name.as_str())),
            young_indexes,
            last_rebalance_attempt: state.last_rebalance_attempt,
            last_balance_change: state.last_balance_change,
            last_optimal_found: state.last_optimal_found,
            status: state.status.clone(),
            balance_score: state.last_score,
            retained_batches: state.future_batches.len(),
            node_group_scores: state.node_group_scores.clone(),
        }
    }
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Non-trivial per-node group contributions keyed by host name and group label
fn node_group_scores(model: &ModelCluster) -> BTreeMap<String, BTreeMap<String, f64>> {
    let mut scores = BTreeMap::new();
    for node in model.nodes() {
        let entries: BTreeMap<String, f64> = node
            .shard_manager
            .group_details()
            .iter()
            .filter_map(|(group_id, details)| {
                let group = model.group(group_id)?;
                let trivial = details.balance_score <= NEGLIGIBLE_SCORE && details.shard_count == 0;
                (!trivial).then(|| (group.group.label(), details.balance_score))
            })
            .collect();

        if !entries.is_empty() {
            scores.insert(node.backing_node.host_name.clone(), entries);
        }
    }
    scores
}
