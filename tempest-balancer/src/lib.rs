//! Tempest Balancer Library
//!
//! Heuristic shard placement and balancing engine.
//!
//! Once per scheduling cycle the host hands the engine a cluster snapshot and
//! gets back one of:
//! - Placements for unassigned shard copies
//! - Relocations off nodes that no longer accept their copies
//! - A bounded batch of relocations that lowers the balance score
//! - BALANCED, ON_HOLD or NO_OP when there is nothing to do

pub mod balancer;
pub mod config;
pub mod coordinator;
pub mod deciders;
pub mod estimator;
pub mod model;
pub mod moves;
pub mod partitioner;
pub mod scorer;
pub mod search;

// Re-export main types
pub use balancer::{BalanceStep, HeuristicBalancer, HoldReason};
pub use config::{BalancerConfig, ConfigError, GroupRule};
pub use coordinator::{
    BalanceCoordinator, BalanceDecision, BalancerError, CycleOutcome, EngineState, StatusReport,
};
pub use deciders::{
    AllocationDecider, AwarenessDecider, ConstraintChain, DiskThresholdDecider, FilterDecider,
    SameShardDecider, ThrottleDecider,
};
pub use estimator::{EstimateSource, ShardSizeEstimator, SizeEstimate};
pub use model::{ModelBuilder, ModelCluster, ModelNode, ModelShard, ShardManager};
pub use moves::{BatchRisk, MoveDescription, RiskLevel, ShardAssignment};
pub use partitioner::{Group, GroupId, IndexGroupPartitioner, DEFAULT_GROUP};
pub use scorer::{BalanceScorer, LoadStats, NEGLIGIBLE_SCORE};
pub use search::{MoveSearch, SearchResult};
