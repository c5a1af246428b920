//! Move search
//!
//! Bounded best-first search over single-copy relocations. Each round
//! enumerates candidate moves out of imbalanced groups, keeps the best
//! `best_candidate_queue_size` of them, and then tries up to `search_depth`
//! in order against a scratch copy of the model. Accepted moves are grouped
//! into batches of at most `concurrent_rebalance` moves.
//!
//! The search stops when a round accepts nothing with no open batch, or when
//! the time limit elapses. Whatever was accepted before the deadline is
//! returned; every batch in the result was validated against the constraint
//! chain and the risk limit at the point it was built.

use rand::Rng;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::time::Instant;
use tempest_core::{NodeId, ShardId, ShardKey};
use tracing::{debug, info, instrument, warn};

use crate::config::BalancerConfig;
use crate::deciders::{AllocationDecider, ConstraintChain};
use crate::model::{ModelCluster, ModelShard};
use crate::moves::{BatchRisk, MoveDescription, RiskLevel};
use crate::scorer::NEGLIGIBLE_SCORE;

/// One ranked relocation candidate
#[derive(Debug, Clone)]
struct Candidate {
    delta: f64,
    size: u64,
    shard_id: ShardId,
    primary: bool,
    from: NodeId,
    to: usize,
    rank: u32,
}

impl Candidate {
    fn key(&self) -> ShardKey {
        ShardKey::new(self.shard_id.clone(), self.primary)
    }
}

// Greater is better: larger improvement, then larger shard, then identity.
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.delta
            .total_cmp(&other.delta)
            .then_with(|| self.size.cmp(&other.size))
            .then_with(|| other.shard_id.cmp(&self.shard_id))
            .then_with(|| other.primary.cmp(&self.primary))
            .then_with(|| other.from.cmp(&self.from))
            .then_with(|| other.rank.cmp(&self.rank))
            .then_with(|| other.to.cmp(&self.to))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

/// Outcome of one search
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    /// Ordered batches; the first is applied now, the rest are retained
    pub batches: Vec<Vec<MoveDescription>>,
    /// An improving candidate was rejected by a decider or the risk limit
    pub blocked: bool,
    /// The time limit cut the search short
    pub timed_out: bool,
    pub rounds: usize,
    /// Candidates scored across all rounds
    pub evaluated: usize,
    pub initial_score: f64,
    /// Score of the model with every batch applied
    pub final_score: f64,
}

impl SearchResult {
    pub fn move_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Bounded heuristic search
pub struct MoveSearch<'a> {
    config: &'a BalancerConfig,
    chain: &'a ConstraintChain,
}

impl<'a> MoveSearch<'a> {
    pub fn new(config: &'a BalancerConfig, chain: &'a ConstraintChain) -> Self {
        Self { config, chain }
    }

    /// Search for batches that lower the score of `model`, within the
    /// configured time limit
    pub fn run<R: Rng>(&self, model: &ModelCluster, rng: &mut R) -> SearchResult {
        let deadline = Instant::now().checked_add(self.config.search_time_limit());
        self.run_until(model, rng, deadline)
    }

    /// Search until `deadline` passes; `None` searches to completion
    #[instrument(skip_all, fields(score = model.balance_score()))]
    pub fn run_until<R: Rng>(
        &self,
        model: &ModelCluster,
        rng: &mut R,
        deadline: Option<Instant>,
    ) -> SearchResult {
        let mut scratch = model.clone();
        let mut result = SearchResult {
            initial_score: model.balance_score(),
            ..Default::default()
        };

        let mut batch: Vec<MoveDescription> = Vec::new();
        let mut risk = BatchRisk::new(&scratch);
        let mut moved: HashSet<ShardKey> = HashSet::new();

        loop {
            if expired(deadline) {
                result.timed_out = true;
                break;
            }

            result.rounds += 1;
            let candidates = self.candidates(&scratch, &moved, rng, deadline, &mut result);
            if candidates.is_empty() && batch.is_empty() {
                break;
            }

            let mut accepted = 0;
            for candidate in candidates.into_iter().take(self.config.search_depth) {
                if moved.contains(&candidate.key()) {
                    continue;
                }
                let Some(mv) = self.try_accept(&scratch, &candidate, &batch, &risk, &mut result) else {
                    continue;
                };

                if scratch.apply_move(&mv).is_none() {
                    warn!(mv = %mv, "Candidate no longer applies to the scratch model");
                    continue;
                }
                debug!(mv = %mv, delta = mv.score_delta, risk = ?mv.risk, "Move accepted");

                risk.add(&mv.from, &mv.to, mv.size);
                moved.insert(mv.key());
                batch.push(mv);
                accepted += 1;

                if batch.len() >= self.config.concurrent_rebalance {
                    debug!(moves = batch.len(), rate = risk.rate(), "Batch full");
                    result.batches.push(std::mem::take(&mut batch));
                    risk = BatchRisk::new(&scratch);
                    moved.clear();
                }
            }

            if accepted == 0 {
                if batch.is_empty() {
                    break;
                }
                // nothing more fits this batch; close it and keep going
                debug!(moves = batch.len(), rate = risk.rate(), "Batch closed early");
                result.batches.push(std::mem::take(&mut batch));
                risk = BatchRisk::new(&scratch);
                moved.clear();
            }
        }

        if !batch.is_empty() {
            result.batches.push(batch);
        }
        result.final_score = scratch.balance_score();

        info!(
            batches = result.batches.len(),
            moves = result.move_count(),
            rounds = result.rounds,
            evaluated = result.evaluated,
            blocked = result.blocked,
            timed_out = result.timed_out,
            initial_score = result.initial_score,
            final_score = result.final_score,
            "Search finished"
        );

        result
    }

    /// Re-check a candidate against the current scratch state
    fn try_accept(
        &self,
        scratch: &ModelCluster,
        candidate: &Candidate,
        batch: &[MoveDescription],
        risk: &BatchRisk,
        result: &mut SearchResult,
    ) -> Option<MoveDescription> {
        let source = scratch.node(&candidate.from)?;
        let shard = source
            .shards()
            .iter()
            .find(|s| s.shard_id == candidate.shard_id && s.primary == candidate.primary)?;
        let destination = scratch.nodes().get(candidate.to)?;

        let delta = scratch.move_delta(shard, candidate.to);
        if !self.is_improvement(delta, scratch.balance_score()) {
            return None;
        }

        if !self.chain.allows_move(shard, destination, scratch, batch) {
            debug!(shard = %shard.key(), to = %destination.id(), "Candidate blocked by deciders");
            result.blocked = true;
            return None;
        }

        let rate = risk.rate_with(&shard.node, destination.id(), shard.size);
        if rate > self.config.maximum_allowed_risk_rate {
            debug!(shard = %shard.key(), to = %destination.id(), rate, "Candidate exceeds risk limit");
            result.blocked = true;
            return None;
        }

        Some(MoveDescription {
            shard_id: shard.shard_id.clone(),
            primary: shard.primary,
            from: shard.node.clone(),
            to: destination.id().clone(),
            size: shard.size,
            score_delta: delta,
            risk: RiskLevel::classify(rate, self.config.maximum_allowed_risk_rate),
        })
    }

    fn is_improvement(&self, delta: f64, current_score: f64) -> bool {
        delta > NEGLIGIBLE_SCORE && delta >= self.config.minimum_node_size_change_rate * current_score
    }

    /// Whether `shard` may be picked up at all
    fn is_candidate(&self, model: &ModelCluster, shard: &ModelShard, moved: &HashSet<ShardKey>) -> bool {
        shard.movable
            && shard.size > self.config.minimum_shard_movement_overhead
            && model.is_scored(shard)
            && !moved.contains(&shard.key())
    }

    /// Best candidates of the round, best first
    fn candidates<R: Rng>(
        &self,
        model: &ModelCluster,
        moved: &HashSet<ShardKey>,
        rng: &mut R,
        deadline: Option<Instant>,
        result: &mut SearchResult,
    ) -> Vec<Candidate> {
        let nodes = model.nodes();
        let ranks: Vec<u32> = nodes.iter().map(|_| rng.gen()).collect();
        let eligible: Vec<usize> = (0..nodes.len())
            .filter(|&i| !(self.config.expunge_blacklisted_nodes && nodes[i].backing_node.blacklisted))
            .collect();
        let breadth = ((self.config.search_scale_factor * eligible.len() as f64).ceil() as usize)
            .clamp(1, eligible.len().max(1));

        let queue_size = self.config.best_candidate_queue_size;
        let mut queue: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(queue_size + 1);

        for (group_id, stats) in model.groups() {
            if stats.loads.score() <= NEGLIGIBLE_SCORE {
                continue;
            }

            let mut destinations = eligible.clone();
            destinations.sort_by_key(|&i| (nodes[i].group_load(group_id), ranks[i]));
            destinations.truncate(breadth);

            for source in nodes {
                if expired(deadline) {
                    result.timed_out = true;
                    return drain(queue);
                }

                for shard in source.shards() {
                    if &shard.group != group_id || !self.is_candidate(model, shard, moved) {
                        continue;
                    }

                    for &to in &destinations {
                        if nodes[to].id() == source.id() {
                            continue;
                        }
                        result.evaluated += 1;

                        let delta = model.move_delta(shard, to);
                        if !self.is_improvement(delta, model.balance_score()) {
                            continue;
                        }
                        if !self.chain.can_allocate(shard, &nodes[to], model) {
                            result.blocked = true;
                            continue;
                        }

                        queue.push(Reverse(Candidate {
                            delta,
                            size: shard.size,
                            shard_id: shard.shard_id.clone(),
                            primary: shard.primary,
                            from: shard.node.clone(),
                            to,
                            rank: ranks[to],
                        }));
                        if queue.len() > queue_size {
                            queue.pop();
                        }
                    }
                }
            }
        }

        drain(queue)
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

fn drain(queue: BinaryHeap<Reverse<Candidate>>) -> Vec<Candidate> {
    // ascending order of Reverse is descending order of candidates
    queue.into_sorted_vec().into_iter().map(|Reverse(c)| c).collect()
}
