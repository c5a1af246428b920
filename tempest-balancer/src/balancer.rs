//! Heuristic balancer
//!
//! Decides the single winning action class of one cycle, in priority order:
//!
//! 1. place unassigned copies
//! 2. move copies off nodes that no longer accept them
//! 3. rebalance, either by replaying a retained batch or by searching
//!
//! The balancer only reads the model; the caller publishes the result.

use rand::Rng;
use std::collections::HashMap;
use tempest_core::NodeId;
use tracing::{debug, info, instrument, warn};

use crate::config::BalancerConfig;
use crate::deciders::{AllocationDecider, ConstraintChain};
use crate::model::{ModelCluster, ModelNode, ModelShard};
use crate::moves::{BatchRisk, MoveDescription, RiskLevel, ShardAssignment};
use crate::partitioner::GroupId;
use crate::scorer::NEGLIGIBLE_SCORE;
use crate::search::MoveSearch;

/// Why rebalancing could not proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    /// Copies are still initializing or relocating
    ShardsInFlight,
    /// Improving moves exist but deciders or the risk limit reject them
    Blocked,
}

/// Result of one pass
#[derive(Debug, Clone, PartialEq)]
pub enum BalanceStep {
    /// Unassigned copies placed
    Allocated(Vec<ShardAssignment>),
    /// Copies moved off nodes that no longer accept them
    Evacuated(Vec<MoveDescription>),
    /// A rebalancing batch and the batches retained for later cycles
    Rebalanced {
        batch: Vec<MoveDescription>,
        remaining: Vec<Vec<MoveDescription>>,
        replayed: bool,
    },
    Balanced,
    OnHold(HoldReason),
}

pub struct HeuristicBalancer<'a> {
    config: &'a BalancerConfig,
    chain: &'a ConstraintChain,
}

impl<'a> HeuristicBalancer<'a> {
    pub fn new(config: &'a BalancerConfig, chain: &'a ConstraintChain) -> Self {
        Self { config, chain }
    }

    /// Run the priority chain against `model`
    #[instrument(
        skip_all,
        fields(nodes = model.nodes().len(), unassigned = model.unassigned().len())
    )]
    pub fn balance<R: Rng>(
        &self,
        model: &ModelCluster,
        future: &[Vec<MoveDescription>],
        rng: &mut R,
    ) -> BalanceStep {
        let assignments = self.allocate_unassigned(model, rng);
        if !assignments.is_empty() {
            info!(count = assignments.len(), "Placing unassigned copies");
            return BalanceStep::Allocated(assignments);
        }

        let forced = self.forced_moves(model, rng);
        if !forced.is_empty() {
            info!(count = forced.len(), "Moving copies off nodes that no longer accept them");
            return BalanceStep::Evacuated(forced);
        }

        if model.in_flight() > 0 {
            debug!(in_flight = model.in_flight(), "Recoveries in progress, holding");
            return BalanceStep::OnHold(HoldReason::ShardsInFlight);
        }

        if let Some((first, rest)) = future.split_first() {
            if let Some(batch) = self.revalidate(model, first) {
                info!(moves = batch.len(), retained = rest.len(), "Replaying retained batch");
                return BalanceStep::Rebalanced {
                    batch,
                    remaining: rest.to_vec(),
                    replayed: true,
                };
            }
            warn!(retained = future.len(), "Retained batches are stale, searching again");
        }

        let mut result = MoveSearch::new(self.config, self.chain).run(model, rng);
        if result.batches.is_empty() {
            return if result.blocked {
                BalanceStep::OnHold(HoldReason::Blocked)
            } else {
                BalanceStep::Balanced
            };
        }

        let batch = result.batches.remove(0);
        BalanceStep::Rebalanced {
            batch,
            remaining: result.batches,
            replayed: false,
        }
    }

    /// Place every placeable unassigned copy. Replicas wait for a started
    /// primary.
    fn allocate_unassigned<R: Rng>(
        &self,
        model: &ModelCluster,
        rng: &mut R,
    ) -> Vec<ShardAssignment> {
        if model.unassigned().is_empty() {
            return Vec::new();
        }

        let ranks = node_ranks(model, rng);
        let mut scratch = model.clone();
        let mut assignments = Vec::new();

        for pending in model.unassigned() {
            if !pending.primary && !model.primary_active(&pending.shard_id) {
                debug!(shard = %pending.shard_id, "Replica waits for its primary");
                continue;
            }

            let candidate = pending.candidate();
            let allowed = |node: &ModelNode, cluster: &ModelCluster| {
                self.chain.can_allocate(&candidate, node, cluster)
            };
            let Some(node) = self.least_loaded(&scratch, &candidate, &pending.group, &ranks, allowed)
            else {
                debug!(shard = %pending.shard_id, primary = pending.primary, "No node accepts copy");
                continue;
            };

            let assignment = ShardAssignment {
                shard_id: pending.shard_id.clone(),
                primary: pending.primary,
                node,
                size: pending.size,
            };
            if scratch.apply_assignment(&assignment) {
                assignments.push(assignment);
            }
        }

        assignments
    }

    /// Moves for started copies whose node fails the constraint chain
    fn forced_moves<R: Rng>(&self, model: &ModelCluster, rng: &mut R) -> Vec<MoveDescription> {
        let stuck: Vec<ModelShard> = model
            .nodes()
            .iter()
            .flat_map(|node| {
                node.shards()
                    .iter()
                    .filter(|shard| shard.movable && !self.chain.can_allocate(shard, node, model))
                    .cloned()
            })
            .collect();
        if stuck.is_empty() {
            return Vec::new();
        }

        let ranks = node_ranks(model, rng);
        let mut scratch = model.clone();
        let mut risk = BatchRisk::new(model);
        let mut moves: Vec<MoveDescription> = Vec::new();

        for shard in stuck {
            if moves.len() >= self.config.concurrent_rebalance {
                break;
            }

            let allowed = |node: &ModelNode, cluster: &ModelCluster| {
                self.chain.allows_move(&shard, node, cluster, &moves)
            };
            let Some(to) = self.least_loaded(&scratch, &shard, &shard.group, &ranks, allowed) else {
                warn!(shard = %shard.key(), node = %shard.node, "Copy cannot stay and has nowhere to go");
                continue;
            };

            let rate = risk.rate_with(&shard.node, &to, shard.size);
            let mv = MoveDescription {
                shard_id: shard.shard_id.clone(),
                primary: shard.primary,
                from: shard.node.clone(),
                to: to.clone(),
                size: shard.size,
                score_delta: scratch
                    .node_position(&to)
                    .map(|i| scratch.move_delta(&shard, i))
                    .unwrap_or(0.0),
                risk: RiskLevel::classify(rate, self.config.maximum_allowed_risk_rate),
            };
            if scratch.apply_move(&mv).is_some() {
                risk.add(&mv.from, &mv.to, mv.size);
                moves.push(mv);
            }
        }

        moves
    }

    /// Re-check a retained batch against the current model. Returns it with
    /// refreshed deltas when every move still applies, passes the deciders
    /// and the risk limit, and the batch still lowers the score.
    fn revalidate(
        &self,
        model: &ModelCluster,
        batch: &[MoveDescription],
    ) -> Option<Vec<MoveDescription>> {
        let mut scratch = model.clone();
        let mut risk = BatchRisk::new(model);
        let mut refreshed: Vec<MoveDescription> = Vec::with_capacity(batch.len());

        for mv in batch {
            let node = scratch.node(&mv.from)?;
            let shard = node
                .shards()
                .iter()
                .find(|s| s.shard_id == mv.shard_id && s.primary == mv.primary && s.movable)?
                .clone();
            let to = scratch.node_position(&mv.to)?;
            let destination = &scratch.nodes()[to];

            if !self.destination_open(destination)
                || !self.chain.allows_move(&shard, destination, &scratch, &refreshed)
            {
                debug!(mv = %mv, "Retained move no longer allowed");
                return None;
            }

            let rate = risk.rate_with(&mv.from, &mv.to, shard.size);
            if rate > self.config.maximum_allowed_risk_rate {
                debug!(mv = %mv, rate, "Retained move exceeds risk limit");
                return None;
            }

            let updated = MoveDescription {
                size: shard.size,
                score_delta: scratch.move_delta(&shard, to),
                risk: RiskLevel::classify(rate, self.config.maximum_allowed_risk_rate),
                ..mv.clone()
            };
            scratch.apply_move(&updated)?;
            risk.add(&updated.from, &updated.to, updated.size);
            refreshed.push(updated);
        }

        if model.balance_score() - scratch.balance_score() > NEGLIGIBLE_SCORE {
            Some(refreshed)
        } else {
            None
        }
    }

    fn destination_open(&self, node: &ModelNode) -> bool {
        !(self.config.expunge_blacklisted_nodes && node.backing_node.blacklisted)
    }

    /// Node with the lowest group load, then lowest total load, then rank,
    /// among nodes other than the shard's own that pass `allowed`
    fn least_loaded<F>(
        &self,
        cluster: &ModelCluster,
        shard: &ModelShard,
        group: &GroupId,
        ranks: &HashMap<NodeId, u32>,
        allowed: F,
    ) -> Option<NodeId>
    where
        F: Fn(&ModelNode, &ModelCluster) -> bool,
    {
        cluster
            .nodes()
            .iter()
            .filter(|node| node.id() != &shard.node && self.destination_open(node))
            .filter(|node| allowed(node, cluster))
            .min_by_key(|node| {
                (
                    node.group_load(group),
                    node.total_size(),
                    ranks.get(node.id()).copied().unwrap_or(u32::MAX),
                )
            })
            .map(|node| node.id().clone())
    }
}

fn node_ranks<R: Rng>(model: &ModelCluster, rng: &mut R) -> HashMap<NodeId, u32> {
    model
        .nodes()
        .iter()
        .map(|node| (node.id().clone(), rng.gen()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deciders::FilterDecider;
    use crate::estimator::ShardSizeEstimator;
    use crate::model::ModelBuilder;
    use crate::partitioner::IndexGroupPartitioner;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempest_core::{ClusterSnapshot, DiscoveryNode, ShardId, ShardRouting};

    const SIZE: u64 = 10 * 1024 * 1024;

    fn config() -> BalancerConfig {
        BalancerConfig {
            default_shard_size: SIZE,
            ..Default::default()
        }
    }

    fn build(snapshot: &ClusterSnapshot, config: &BalancerConfig) -> ModelCluster {
        let partitioner = IndexGroupPartitioner::new(&config.grouping_patterns).unwrap();
        let mut estimator = ShardSizeEstimator::new(config.model_age(), config.default_shard_size);
        ModelBuilder::new(&partitioner, &mut estimator, config).build(snapshot, chrono::Utc::now())
    }

    fn run(config: &BalancerConfig, chain: &ConstraintChain, model: &ModelCluster) -> BalanceStep {
        HeuristicBalancer::new(config, chain).balance(model, &[], &mut StdRng::seed_from_u64(1))
    }

    fn snapshot(nodes: &[&str], started: &[(u32, bool, &str)]) -> ClusterSnapshot {
        ClusterSnapshot {
            nodes: nodes.iter().map(|n| DiscoveryNode::new(*n)).collect(),
            shards: started
                .iter()
                .map(|(shard, primary, node)| {
                    ShardRouting::started(ShardId::new("idx", *shard), *primary, *node)
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_primaries_placed_before_replicas() {
        let config = config();
        let mut snap = snapshot(&["n1", "n2"], &[]);
        snap.shards
            .push(ShardRouting::unassigned(ShardId::new("idx", 0), true));
        snap.shards
            .push(ShardRouting::unassigned(ShardId::new("idx", 0), false));
        let model = build(&snap, &config);

        let chain = ConstraintChain::with_defaults();
        let step = run(&config, &chain, &model);

        // the replica has no started primary yet
        match step {
            BalanceStep::Allocated(assignments) => {
                assert_eq!(assignments.len(), 1);
                assert!(assignments[0].primary);
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_replica_avoids_primary_node() {
        let config = config();
        let mut snap = snapshot(&["n1", "n2"], &[(0, true, "n2"), (1, true, "n1")]);
        snap.shards
            .push(ShardRouting::unassigned(ShardId::new("idx", 0), false));
        let model = build(&snap, &config);

        let chain = ConstraintChain::with_defaults();
        let step = run(&config, &chain, &model);

        assert_eq!(
            step,
            BalanceStep::Allocated(vec![ShardAssignment {
                shard_id: ShardId::new("idx", 0),
                primary: false,
                node: "n1".to_string(),
                size: SIZE,
            }])
        );
    }

    #[test]
    fn test_excluded_node_is_evacuated() {
        let config = config();
        let snap = snapshot(&["n1", "n2", "n3"], &[(0, true, "n1"), (1, true, "n2")]);
        let model = build(&snap, &config);

        let chain = ConstraintChain::with_defaults()
            .with(FilterDecider::new().exclude("_id", &["n1"]).unwrap());
        let step = run(&config, &chain, &model);

        match step {
            BalanceStep::Evacuated(moves) => {
                assert_eq!(moves.len(), 1);
                assert_eq!(moves[0].from, "n1");
                assert_eq!(moves[0].to, "n3");
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_in_flight_holds_rebalancing() {
        let config = config();
        let mut snap = snapshot(
            &["n1", "n2"],
            &[(0, true, "n1"), (1, true, "n1"), (2, true, "n1")],
        );
        snap.relocate_shard(&ShardId::new("idx", 0), true, "n1", "n2")
            .unwrap();
        let model = build(&snap, &config);

        let chain = ConstraintChain::with_defaults();
        let step = run(&config, &chain, &model);
        assert_eq!(step, BalanceStep::OnHold(HoldReason::ShardsInFlight));
    }

    #[test]
    fn test_search_then_replay() {
        let config = config();
        let started: Vec<(u32, bool, &str)> = (0..8).map(|i| (i, true, "n1")).collect();
        let mut snap = snapshot(&["n1", "n2"], &started);
        let chain = ConstraintChain::with_defaults();
        let balancer = HeuristicBalancer::new(&config, &chain);
        let mut rng = StdRng::seed_from_u64(5);

        let step = balancer.balance(&build(&snap, &config), &[], &mut rng);
        let BalanceStep::Rebalanced { batch, remaining, replayed } = step else {
            panic!("expected a rebalance");
        };
        assert!(!replayed);
        assert_eq!(batch.len(), 2);
        assert_eq!(remaining.len(), 1);

        for mv in &batch {
            snap.relocate_shard(&mv.shard_id, mv.primary, &mv.from, &mv.to)
                .unwrap();
        }
        snap.settle();

        let step = balancer.balance(&build(&snap, &config), &remaining, &mut rng);
        let BalanceStep::Rebalanced { batch, remaining, replayed } = step else {
            panic!("expected a replay");
        };
        assert!(replayed);
        assert_eq!(batch.len(), 2);
        assert!(remaining.is_empty());
    }

    #[test]
    fn test_stale_retained_batch_is_replaced() {
        let config = config();
        let started: Vec<(u32, bool, &str)> = (0..4).map(|i| (i, true, "n1")).collect();
        let snap = snapshot(&["n1", "n2"], &started);
        let model = build(&snap, &config);

        let stale = vec![vec![MoveDescription {
            shard_id: ShardId::new("idx", 99),
            primary: true,
            from: "n1".to_string(),
            to: "n2".to_string(),
            size: SIZE,
            score_delta: 1.0,
            risk: RiskLevel::Low,
        }]];

        let chain = ConstraintChain::with_defaults();
        let step = HeuristicBalancer::new(&config, &chain).balance(
            &model,
            &stale,
            &mut StdRng::seed_from_u64(2),
        );
        match step {
            BalanceStep::Rebalanced { replayed, batch, .. } => {
                assert!(!replayed);
                assert!(batch.iter().all(|mv| mv.shard_id.shard < 4));
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_balanced_and_blocked() {
        let config = config();
        let chain = ConstraintChain::with_defaults();
        let even = snapshot(&["n1", "n2"], &[(0, true, "n1"), (1, true, "n2")]);
        let step = run(&config, &chain, &build(&even, &config));
        assert_eq!(step, BalanceStep::Balanced);

        let uneven = snapshot(&["n1", "n2"], &[(0, true, "n1"), (1, true, "n1")]);
        let chain = ConstraintChain::with_defaults()
            .with(FilterDecider::new().exclude("_id", &["n2"]).unwrap());
        let step = run(&config, &chain, &build(&uneven, &config));
        assert_eq!(step, BalanceStep::OnHold(HoldReason::Blocked));
    }

    #[test]
    fn test_expunged_node_gets_no_placements() {
        let config = BalancerConfig {
            expunge_blacklisted_nodes: true,
            ..config()
        };
        let mut snap = snapshot(&["n1", "n2"], &[(0, true, "n2")]);
        snap.shards
            .push(ShardRouting::unassigned(ShardId::new("idx", 1), true));
        snap.nodes[0].blacklisted = true;
        let model = build(&snap, &config);

        let chain = ConstraintChain::with_defaults();
        let step = run(&config, &chain, &model);
        match step {
            BalanceStep::Allocated(assignments) => {
                assert_eq!(assignments.len(), 1);
                // n1 is emptier but blacklisted
                assert_eq!(assignments[0].node, "n2");
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_retained_move_to_expunged_node_is_dropped() {
        let config = BalancerConfig {
            expunge_blacklisted_nodes: true,
            ..config()
        };
        let started: Vec<(u32, bool, &str)> = (0..4).map(|i| (i, true, "n1")).collect();
        let mut snap = snapshot(&["n1", "n2", "n3"], &started);
        snap.nodes[1].blacklisted = true;
        let model = build(&snap, &config);

        let retained = vec![vec![MoveDescription {
            shard_id: ShardId::new("idx", 0),
            primary: true,
            from: "n1".to_string(),
            to: "n2".to_string(),
            size: SIZE,
            score_delta: 1.0,
            risk: RiskLevel::Low,
        }]];

        let chain = ConstraintChain::with_defaults();
        let step = HeuristicBalancer::new(&config, &chain).balance(
            &model,
            &retained,
            &mut StdRng::seed_from_u64(3),
        );
        match step {
            BalanceStep::Rebalanced { replayed, batch, .. } => {
                assert!(!replayed);
                assert!(!batch.is_empty());
                assert!(batch.iter().all(|mv| mv.to == "n3"));
            }
            other => panic!("unexpected step {:?}", other),
        }
    }
}
