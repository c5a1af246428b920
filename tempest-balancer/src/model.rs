//! Cluster model
//!
//! An in-memory copy of the cluster built once per cycle from a snapshot.
//! Nodes are ordered by id and own a `ShardManager` with their copies grouped
//! by balancing group. Group load statistics are kept alongside so a move's
//! score effect can be evaluated without a full rescan. The search clones the
//! model as a scratch copy and applies candidate moves to it.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tempest_core::{
    ClusterSnapshot, DiscoveryNode, DiskUsage, NodeId, ShardId, ShardKey, ShardRouting, ShardState,
    SizeTelemetry,
};
use tracing::{debug, instrument, warn};

use crate::config::BalancerConfig;
use crate::estimator::{EstimateSource, ShardSizeEstimator};
use crate::moves::{MoveDescription, ShardAssignment};
use crate::partitioner::{Group, GroupId, IndexGroupPartitioner};
use crate::scorer::{BalanceScorer, LoadStats};

/// A placed shard copy
#[derive(Debug, Clone, PartialEq)]
pub struct ModelShard {
    pub shard_id: ShardId,
    pub primary: bool,
    pub node: NodeId,
    /// Estimated size in bytes
    pub size: u64,
    pub group: GroupId,
    /// Started and not part of an in-flight recovery
    pub movable: bool,
}

impl ModelShard {
    pub fn key(&self) -> ShardKey {
        ShardKey::new(self.shard_id.clone(), self.primary)
    }
}

/// A copy waiting for initial placement
#[derive(Debug, Clone, PartialEq)]
pub struct UnassignedShard {
    pub shard_id: ShardId,
    pub primary: bool,
    pub size: u64,
    pub group: GroupId,
}

impl UnassignedShard {
    /// The shard as it would look once placed on `node`
    pub fn placed_on(&self, node: &str) -> ModelShard {
        ModelShard {
            shard_id: self.shard_id.clone(),
            primary: self.primary,
            node: node.to_string(),
            size: self.size,
            group: self.group.clone(),
            movable: false,
        }
    }

    /// The copy as deciders see it before it lands anywhere
    pub fn candidate(&self) -> ModelShard {
        self.placed_on("")
    }
}

/// Per-node details for one group
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardGroupDetails {
    /// Copies of this group on the node
    pub shard_count: usize,
    /// In-scope bytes of this group on the node
    pub load: u64,
    /// This node's share of the group score
    pub balance_score: f64,
}

/// Shards held by one node
#[derive(Debug, Clone, Default)]
pub struct ShardManager {
    shards: Vec<ModelShard>,
    group_details: BTreeMap<GroupId, ShardGroupDetails>,
    total_size: u64,
}

impl ShardManager {
    pub fn shards(&self) -> &[ModelShard] {
        &self.shards
    }

    pub fn group_details(&self) -> &BTreeMap<GroupId, ShardGroupDetails> {
        &self.group_details
    }

    fn add(&mut self, shard: ModelShard, in_scope: bool) {
        let details = self.group_details.entry(shard.group.clone()).or_default();
        details.shard_count += 1;
        if in_scope {
            details.load += shard.size;
        }
        self.total_size += shard.size;
        self.shards.push(shard);
    }

    fn remove(&mut self, shard_id: &ShardId, primary: bool, in_scope: bool) -> Option<ModelShard> {
        let position = self
            .shards
            .iter()
            .position(|s| &s.shard_id == shard_id && s.primary == primary)?;
        let shard = self.shards.swap_remove(position);

        if let Some(details) = self.group_details.get_mut(&shard.group) {
            details.shard_count -= 1;
            if in_scope {
                details.load -= shard.size;
            }
        }
        self.total_size -= shard.size;
        Some(shard)
    }
}

/// A node in the model
#[derive(Debug, Clone)]
pub struct ModelNode {
    pub backing_node: DiscoveryNode,
    /// Disk usage from telemetry, if reported
    pub disk_usage: Option<DiskUsage>,
    pub shard_manager: ShardManager,
}

impl ModelNode {
    pub fn id(&self) -> &NodeId {
        &self.backing_node.id
    }

    /// Bytes of every copy on the node
    pub fn total_size(&self) -> u64 {
        self.shard_manager.total_size
    }

    /// In-scope bytes of `group` on the node
    pub fn group_load(&self, group: &GroupId) -> u64 {
        self.shard_manager
            .group_details
            .get(group)
            .map(|d| d.load)
            .unwrap_or(0)
    }

    /// The copy of `shard_id` held here, if any
    pub fn copy_of(&self, shard_id: &ShardId) -> Option<&ModelShard> {
        self.shard_manager
            .shards
            .iter()
            .find(|s| &s.shard_id == shard_id)
    }

    pub fn shards(&self) -> &[ModelShard] {
        &self.shard_manager.shards
    }
}

/// Cluster-wide statistics for one group
#[derive(Debug, Clone, PartialEq)]
pub struct GroupStats {
    pub group: Group,
    pub loads: LoadStats,
    pub shard_count: usize,
}

/// Immutable-per-cycle model of the cluster
#[derive(Debug, Clone)]
pub struct ModelCluster {
    nodes: Vec<ModelNode>,
    node_index: HashMap<NodeId, usize>,
    groups: BTreeMap<GroupId, GroupStats>,
    unassigned: Vec<UnassignedShard>,
    in_flight: usize,
    scorer: BalanceScorer,
    balance_score: f64,
}

impl ModelCluster {
    /// Assemble a model from nodes (any order), placed copies and unassigned copies
    pub fn new(
        mut nodes: Vec<ModelNode>,
        groups: Vec<Group>,
        unassigned: Vec<UnassignedShard>,
        in_flight: usize,
        scorer: BalanceScorer,
    ) -> Self {
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        let node_index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id().clone(), i))
            .collect();

        let groups = groups
            .into_iter()
            .map(|group| {
                (
                    group.id.clone(),
                    GroupStats {
                        group,
                        loads: LoadStats::default(),
                        shard_count: 0,
                    },
                )
            })
            .collect();

        let mut model = Self {
            nodes,
            node_index,
            groups,
            unassigned,
            in_flight,
            scorer,
            balance_score: 0.0,
        };

        let ids: Vec<GroupId> = model.groups.keys().cloned().collect();
        for id in &ids {
            model.rescore_group(id);
        }
        model.balance_score = model.calculate_balance_score();
        model
    }

    pub fn nodes(&self) -> &[ModelNode] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&ModelNode> {
        self.node_index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn node_position(&self, id: &str) -> Option<usize> {
        self.node_index.get(id).copied()
    }

    /// Scored groups (excluded groups are absent)
    pub fn groups(&self) -> &BTreeMap<GroupId, GroupStats> {
        &self.groups
    }

    pub fn group(&self, id: &GroupId) -> Option<&GroupStats> {
        self.groups.get(id)
    }

    pub fn unassigned(&self) -> &[UnassignedShard] {
        &self.unassigned
    }

    /// Copies initializing or relocating when the snapshot was taken
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn scorer(&self) -> BalanceScorer {
        self.scorer
    }

    /// Aggregate score of the current state
    pub fn balance_score(&self) -> f64 {
        self.balance_score
    }

    /// Recompute the aggregate from group statistics
    pub fn calculate_balance_score(&self) -> f64 {
        self.scorer
            .cluster_score(self.groups.values().map(|g| &g.loads))
    }

    /// Score of a single group
    pub fn group_score(&self, id: &GroupId) -> f64 {
        self.groups.get(id).map(|g| g.loads.score()).unwrap_or(0.0)
    }

    /// Weight of a group in the aggregate
    pub fn group_weight(&self, id: &GroupId) -> f64 {
        let scored_total: u64 = self.groups.values().map(|g| g.loads.total).sum();
        self.groups
            .get(id)
            .map(|g| self.scorer.weight(g.loads.total, scored_total))
            .unwrap_or(0.0)
    }

    /// Whether moving `shard` changes its group's score at all
    pub fn is_scored(&self, shard: &ModelShard) -> bool {
        self.groups
            .get(&shard.group)
            .map(|g| g.group.in_scope(shard.primary))
            .unwrap_or(false)
    }

    /// Improvement of the aggregate score if `shard` moved to `to`
    /// (positive is better)
    pub fn move_delta(&self, shard: &ModelShard, to: usize) -> f64 {
        let Some(stats) = self.groups.get(&shard.group) else {
            return 0.0;
        };
        if !stats.group.in_scope(shard.primary) {
            return 0.0;
        }
        let Some(from) = self.node_position(&shard.node) else {
            return 0.0;
        };
        if from == to {
            return 0.0;
        }

        let from_load = self.nodes[from].group_load(&shard.group);
        let to_load = self.nodes[to].group_load(&shard.group);
        let projected = stats.loads.score_after_move(from_load, to_load, shard.size);
        self.group_weight(&shard.group) * (stats.loads.score() - projected)
    }

    /// Apply a relocation. Returns the moved copy, or None if the copy is not
    /// on the source node or a node is unknown.
    pub fn apply_move(&mut self, mv: &MoveDescription) -> Option<ModelShard> {
        let from = self.node_position(&mv.from)?;
        let to = self.node_position(&mv.to)?;
        if from == to || self.nodes[to].copy_of(&mv.shard_id).is_some() {
            return None;
        }

        let group = self.nodes[from].copy_of(&mv.shard_id)?.group.clone();
        let in_scope = self.in_scope(&group, mv.primary);

        let mut shard = self.nodes[from]
            .shard_manager
            .remove(&mv.shard_id, mv.primary, in_scope)?;
        shard.node = mv.to.clone();
        self.nodes[to].shard_manager.add(shard.clone(), in_scope);

        self.rescore_group(&group);
        self.balance_score = self.calculate_balance_score();
        Some(shard)
    }

    /// Place an unassigned copy. Returns false when the copy is not pending
    /// or the node is unknown.
    pub fn apply_assignment(&mut self, assignment: &ShardAssignment) -> bool {
        let Some(to) = self.node_position(&assignment.node) else {
            return false;
        };
        let Some(position) = self
            .unassigned
            .iter()
            .position(|u| u.shard_id == assignment.shard_id && u.primary == assignment.primary)
        else {
            return false;
        };

        let pending = self.unassigned.remove(position);
        let in_scope = self.in_scope(&pending.group, pending.primary);
        let group = pending.group.clone();
        self.nodes[to]
            .shard_manager
            .add(pending.placed_on(&assignment.node), in_scope);
        self.in_flight += 1;

        if self.groups.contains_key(&group) {
            self.rescore_group(&group);
            self.balance_score = self.calculate_balance_score();
        }
        true
    }

    /// Whether the primary of `shard_id` is placed and started
    pub fn primary_active(&self, shard_id: &ShardId) -> bool {
        self.nodes.iter().any(|n| {
            n.shards()
                .iter()
                .any(|s| &s.shard_id == shard_id && s.primary && s.movable)
        })
    }

    fn in_scope(&self, group: &GroupId, primary: bool) -> bool {
        self.groups
            .get(group)
            .map(|g| g.group.in_scope(primary))
            .unwrap_or(false)
    }

    /// Recompute one group's statistics and node contributions from scratch
    fn rescore_group(&mut self, id: &GroupId) {
        let loads: Vec<u64> = self.nodes.iter().map(|n| n.group_load(id)).collect();
        let stats = LoadStats::from_loads(&loads);
        let shard_count = self
            .nodes
            .iter()
            .map(|n| {
                n.shard_manager
                    .group_details
                    .get(id)
                    .map(|d| d.shard_count)
                    .unwrap_or(0)
            })
            .sum();

        for node in &mut self.nodes {
            if let Some(details) = node.shard_manager.group_details.get_mut(id) {
                details.balance_score = stats.node_contribution(details.load);
            }
        }

        if let Some(group) = self.groups.get_mut(id) {
            group.loads = stats;
            group.shard_count = shard_count;
        }
    }
}

/// Builds a `ModelCluster` from a snapshot
pub struct ModelBuilder<'a> {
    partitioner: &'a IndexGroupPartitioner,
    estimator: &'a mut ShardSizeEstimator,
    config: &'a BalancerConfig,
}

impl<'a> ModelBuilder<'a> {
    pub fn new(
        partitioner: &'a IndexGroupPartitioner,
        estimator: &'a mut ShardSizeEstimator,
        config: &'a BalancerConfig,
    ) -> Self {
        Self {
            partitioner,
            estimator,
            config,
        }
    }

    #[instrument(skip_all, fields(nodes = snapshot.nodes.len(), shards = snapshot.shards.len()))]
    pub fn build(mut self, snapshot: &ClusterSnapshot, now: DateTime<Utc>) -> ModelCluster {
        let live: HashSet<ShardKey> = snapshot.shards.iter().map(ShardRouting::key).collect();
        let evicted = self.estimator.retain_live(&live, now);
        if evicted > 0 {
            debug!(evicted, cached = self.estimator.cached_len(), "Pruned size estimates");
        }

        let mut nodes: Vec<ModelNode> = snapshot
            .nodes
            .iter()
            .map(|node| ModelNode {
                backing_node: node.clone(),
                disk_usage: snapshot.info.disk_usage(&node.id),
                shard_manager: ShardManager::default(),
            })
            .collect();
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        let positions: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.backing_node.id.as_str(), i))
            .collect();

        let mut groups: BTreeMap<GroupId, Group> = BTreeMap::new();
        let mut placed: Vec<(usize, ModelShard, bool)> = Vec::new();
        let mut unassigned = Vec::new();
        let mut in_flight = 0;
        let mut defaulted = 0;

        for routing in &snapshot.shards {
            let group = self.partitioner.classify(&routing.shard_id.index);
            let excluded = self.config.is_group_excluded(group.id.as_str());
            if !excluded {
                groups
                    .entry(group.id.clone())
                    .or_insert_with(|| group.clone());
            }

            let estimate = self.estimator.estimate(&routing.key(), &snapshot.info, now);
            if estimate.source == EstimateSource::Default {
                defaulted += 1;
            }

            if routing.state == ShardState::Unassigned {
                unassigned.push(UnassignedShard {
                    shard_id: routing.shard_id.clone(),
                    primary: routing.primary,
                    size: estimate.bytes,
                    group: group.id.clone(),
                });
                continue;
            }

            if routing.in_flight() {
                in_flight += 1;
            }

            let Some(node_id) = routing.projected_node() else {
                warn!(shard = %routing.key(), state = %routing.state, "Assigned copy without a node, skipping");
                continue;
            };
            let Some(&position) = positions.get(node_id.as_str()) else {
                warn!(shard = %routing.key(), node = %node_id, "Copy on unknown node, skipping");
                continue;
            };

            let in_scope = !excluded && group.in_scope(routing.primary);
            placed.push((
                position,
                ModelShard {
                    shard_id: routing.shard_id.clone(),
                    primary: routing.primary,
                    node: node_id.clone(),
                    size: estimate.bytes,
                    group: group.id.clone(),
                    movable: routing.state == ShardState::Started,
                },
                in_scope,
            ));
        }

        for (position, shard, in_scope) in placed {
            nodes[position].shard_manager.add(shard, in_scope);
        }

        if defaulted > 0 {
            debug!(
                defaulted,
                default_size = self.estimator.default_size(),
                "Copies sized with the default estimate"
            );
        }

        // unassigned copies are placed primaries first, then by identity
        unassigned.sort_by(|a: &UnassignedShard, b: &UnassignedShard| {
            b.primary
                .cmp(&a.primary)
                .then_with(|| a.shard_id.cmp(&b.shard_id))
        });

        let model = ModelCluster::new(
            nodes,
            groups.into_values().collect(),
            unassigned,
            in_flight,
            BalanceScorer::new(self.config.weight_by_group_size),
        );

        debug!(
            groups = model.groups().len(),
            unassigned = model.unassigned().len(),
            in_flight = model.in_flight(),
            score = model.balance_score(),
            "Model built"
        );

        model
    }
}
