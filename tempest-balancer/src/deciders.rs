//! Allocation deciders
//!
//! A decider vetoes placements. The engine consults a `ConstraintChain` before
//! placing an unassigned copy, before proposing a relocation, and when
//! checking whether a copy may stay where it is. A placement is legal only if
//! every decider in the chain allows it.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

use crate::config::ConfigError;
use crate::model::{ModelCluster, ModelNode, ModelShard};
use crate::moves::MoveDescription;

/// A pluggable placement rule.
///
/// Deciders are pure functions of their arguments; `cluster` is the model the
/// shard and node belong to.
pub trait AllocationDecider {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Whether `shard` may live on `node`
    fn can_allocate(&self, shard: &ModelShard, node: &ModelNode, cluster: &ModelCluster) -> bool;

    /// Whether `shard` may be moved to `node` given moves already in flight
    fn can_move(
        &self,
        _shard: &ModelShard,
        _node: &ModelNode,
        _cluster: &ModelCluster,
        _in_flight: &[MoveDescription],
    ) -> bool {
        true
    }
}

/// Ordered composition of deciders
#[derive(Default)]
pub struct ConstraintChain {
    deciders: Vec<Box<dyn AllocationDecider + Send + Sync>>,
}

impl std::fmt::Debug for ConstraintChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.deciders.iter().map(|d| d.name()))
            .finish()
    }
}

impl ConstraintChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The deciders every cluster needs
    pub fn with_defaults() -> Self {
        Self::new().with(SameShardDecider)
    }

    pub fn with<D>(mut self, decider: D) -> Self
    where
        D: AllocationDecider + Send + Sync + 'static,
    {
        self.push(decider);
        self
    }

    pub fn push<D>(&mut self, decider: D)
    where
        D: AllocationDecider + Send + Sync + 'static,
    {
        self.deciders.push(Box::new(decider));
    }

    pub fn len(&self) -> usize {
        self.deciders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deciders.is_empty()
    }

    /// Both checks for a relocation
    pub fn allows_move(
        &self,
        shard: &ModelShard,
        node: &ModelNode,
        cluster: &ModelCluster,
        in_flight: &[MoveDescription],
    ) -> bool {
        self.can_allocate(shard, node, cluster) && self.can_move(shard, node, cluster, in_flight)
    }
}

impl AllocationDecider for ConstraintChain {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn can_allocate(&self, shard: &ModelShard, node: &ModelNode, cluster: &ModelCluster) -> bool {
        self.deciders.iter().all(|decider| {
            let allowed = decider.can_allocate(shard, node, cluster);
            if !allowed {
                trace!(decider = decider.name(), shard = %shard.key(), node = %node.id(), "Allocation vetoed");
            }
            allowed
        })
    }

    fn can_move(
        &self,
        shard: &ModelShard,
        node: &ModelNode,
        cluster: &ModelCluster,
        in_flight: &[MoveDescription],
    ) -> bool {
        self.deciders.iter().all(|decider| {
            let allowed = decider.can_move(shard, node, cluster, in_flight);
            if !allowed {
                trace!(decider = decider.name(), shard = %shard.key(), node = %node.id(), "Move vetoed");
            }
            allowed
        })
    }
}

/// Never two copies of one shard on the same node
#[derive(Debug, Clone, Copy, Default)]
pub struct SameShardDecider;

impl AllocationDecider for SameShardDecider {
    fn name(&self) -> &'static str {
        "same_shard"
    }

    fn can_allocate(&self, shard: &ModelShard, node: &ModelNode, _cluster: &ModelCluster) -> bool {
        node.shards().iter().all(|other| {
            other.shard_id != shard.shard_id
                || (other.primary == shard.primary && &other.node == node.id() && shard.node == other.node)
        })
    }
}

/// Attribute filters on destination nodes.
///
/// Each filter maps an attribute (`_id`, `_name`, `_host` or a custom one) to
/// a set of values; values may contain `*` wildcards.
/// - `require`: the node must match every filter
/// - `include`: the node must match at least one filter (when any are set)
/// - `exclude`: the node must match none
#[derive(Debug, Clone, Default)]
pub struct FilterDecider {
    require: Vec<AttributeFilter>,
    include: Vec<AttributeFilter>,
    exclude: Vec<AttributeFilter>,
}

#[derive(Debug, Clone)]
struct AttributeFilter {
    attribute: String,
    values: Vec<Regex>,
}

impl AttributeFilter {
    fn new(attribute: &str, values: &[&str]) -> Result<Self, ConfigError> {
        let values = values
            .iter()
            .map(|value| {
                let pattern = format!("^{}$", regex::escape(value).replace(r"\*", ".*"));
                Regex::new(&pattern).map_err(|e| ConfigError::InvalidPattern {
                    pattern: value.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            attribute: attribute.to_string(),
            values,
        })
    }

    fn matches(&self, node: &ModelNode) -> bool {
        node.backing_node
            .attribute(&self.attribute)
            .map(|actual| self.values.iter().any(|v| v.is_match(actual)))
            .unwrap_or(false)
    }
}

impl FilterDecider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, attribute: &str, values: &[&str]) -> Result<Self, ConfigError> {
        self.require.push(AttributeFilter::new(attribute, values)?);
        Ok(self)
    }

    pub fn include(mut self, attribute: &str, values: &[&str]) -> Result<Self, ConfigError> {
        self.include.push(AttributeFilter::new(attribute, values)?);
        Ok(self)
    }

    pub fn exclude(mut self, attribute: &str, values: &[&str]) -> Result<Self, ConfigError> {
        self.exclude.push(AttributeFilter::new(attribute, values)?);
        Ok(self)
    }
}

impl AllocationDecider for FilterDecider {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn can_allocate(&self, _shard: &ModelShard, node: &ModelNode, _cluster: &ModelCluster) -> bool {
        self.require.iter().all(|f| f.matches(node))
            && (self.include.is_empty() || self.include.iter().any(|f| f.matches(node)))
            && !self.exclude.iter().any(|f| f.matches(node))
    }
}

/// Spread the copies of a shard across the values of a node attribute.
///
/// With `k` copies and `v` distinct values in the cluster, no value may hold
/// more than `ceil(k / v)` copies. Nodes without the attribute are
/// unconstrained.
#[derive(Debug, Clone)]
pub struct AwarenessDecider {
    attribute: String,
}

impl AwarenessDecider {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
        }
    }
}

impl AllocationDecider for AwarenessDecider {
    fn name(&self) -> &'static str {
        "awareness"
    }

    fn can_allocate(&self, shard: &ModelShard, node: &ModelNode, cluster: &ModelCluster) -> bool {
        let Some(value) = node.backing_node.attribute(&self.attribute) else {
            return true;
        };

        let values: BTreeSet<&str> = cluster
            .nodes()
            .iter()
            .filter_map(|n| n.backing_node.attribute(&self.attribute))
            .collect();

        let mut per_value: BTreeMap<&str, usize> = BTreeMap::new();
        let mut copies = 0;
        for other in cluster.nodes() {
            for copy in other.shards() {
                if copy.shard_id != shard.shard_id {
                    continue;
                }
                copies += 1;
                // the copy being placed does not count against itself
                if copy.primary == shard.primary && copy.node == shard.node {
                    continue;
                }
                if let Some(v) = other.backing_node.attribute(&self.attribute) {
                    *per_value.entry(v).or_default() += 1;
                }
            }
        }
        copies += cluster
            .unassigned()
            .iter()
            .filter(|u| u.shard_id == shard.shard_id)
            .count();

        let limit = copies.div_ceil(values.len().max(1)).max(1);
        per_value.get(value).copied().unwrap_or(0) < limit
    }
}

/// Refuse destinations whose disk would cross the high watermark
#[derive(Debug, Clone, Copy)]
pub struct DiskThresholdDecider {
    /// Used fraction (0.0 - 1.0)
    high_watermark: f64,
}

impl DiskThresholdDecider {
    pub fn new(high_watermark: f64) -> Result<Self, ConfigError> {
        if !(high_watermark > 0.0 && high_watermark <= 1.0) {
            return Err(ConfigError::InvalidValue(
                "high_watermark".to_string(),
                format!("{} is outside (0, 1]", high_watermark),
            ));
        }
        Ok(Self { high_watermark })
    }

    fn fits(&self, shard: &ModelShard, node: &ModelNode, pending: u64) -> bool {
        let Some(usage) = node.disk_usage else {
            return true;
        };
        let incoming = if shard.node == *node.id() {
            pending
        } else {
            pending + shard.size
        };
        usage.used_fraction_after(incoming) <= self.high_watermark
    }
}

impl AllocationDecider for DiskThresholdDecider {
    fn name(&self) -> &'static str {
        "disk_threshold"
    }

    fn can_allocate(&self, shard: &ModelShard, node: &ModelNode, _cluster: &ModelCluster) -> bool {
        self.fits(shard, node, 0)
    }

    fn can_move(
        &self,
        shard: &ModelShard,
        node: &ModelNode,
        _cluster: &ModelCluster,
        in_flight: &[MoveDescription],
    ) -> bool {
        let pending = in_flight
            .iter()
            .filter(|mv| &mv.to == node.id())
            .map(|mv| mv.size)
            .sum();
        self.fits(shard, node, pending)
    }
}

/// Cap concurrent incoming relocations per node
#[derive(Debug, Clone, Copy)]
pub struct ThrottleDecider {
    max_incoming: usize,
}

impl ThrottleDecider {
    pub fn new(max_incoming: usize) -> Self {
        Self { max_incoming }
    }
}

impl AllocationDecider for ThrottleDecider {
    fn name(&self) -> &'static str {
        "throttle"
    }

    fn can_allocate(&self, _shard: &ModelShard, _node: &ModelNode, _cluster: &ModelCluster) -> bool {
        true
    }

    fn can_move(
        &self,
        _shard: &ModelShard,
        node: &ModelNode,
        _cluster: &ModelCluster,
        in_flight: &[MoveDescription],
    ) -> bool {
        in_flight.iter().filter(|mv| &mv.to == node.id()).count() < self.max_incoming
    }
}
