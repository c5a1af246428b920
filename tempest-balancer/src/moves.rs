//! Proposed placements and relocations
//!
//! `MoveDescription`s are immutable once created. An ordered `Vec` of them is
//! a batch; batches are applied by the host one at a time.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tempest_core::{NodeId, ShardId, ShardKey};

use crate::model::ModelCluster;

/// Disruption class of a move, relative to the allowed risk rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Classify a batch risk rate in thirds of the allowed maximum
    pub fn classify(rate: f64, max_allowed: f64) -> Self {
        if rate <= max_allowed / 3.0 {
            RiskLevel::Low
        } else if rate <= 2.0 * max_allowed / 3.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }
}

/// A relocation of one started shard copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveDescription {
    pub shard_id: ShardId,
    pub primary: bool,
    pub from: NodeId,
    pub to: NodeId,
    /// Estimated size in bytes
    pub size: u64,
    /// Estimated improvement of the cluster score
    pub score_delta: f64,
    pub risk: RiskLevel,
}

impl MoveDescription {
    pub fn key(&self) -> ShardKey {
        ShardKey::new(self.shard_id.clone(), self.primary)
    }
}

impl fmt::Display for MoveDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.key(), self.from, self.to)
    }
}

/// Initial placement of an unassigned copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub shard_id: ShardId,
    pub primary: bool,
    pub node: NodeId,
    pub size: u64,
}

/// Risk accounting for a batch under construction.
///
/// A node's risk is the bytes moving in or out of it divided by the larger
/// of its size before and after the batch; the batch rate is the maximum
/// over nodes, so it lies in [0, 2].
#[derive(Debug, Clone, Default)]
pub struct BatchRisk {
    base: HashMap<NodeId, u64>,
    incoming: HashMap<NodeId, u64>,
    outgoing: HashMap<NodeId, u64>,
}

impl BatchRisk {
    /// Start a batch from the model's current node sizes
    pub fn new(model: &ModelCluster) -> Self {
        Self {
            base: model
                .nodes()
                .iter()
                .map(|n| (n.id().clone(), n.total_size()))
                .collect(),
            incoming: HashMap::new(),
            outgoing: HashMap::new(),
        }
    }

    /// Current batch rate
    pub fn rate(&self) -> f64 {
        self.incoming
            .keys()
            .chain(self.outgoing.keys())
            .map(|node| self.node_rate(node, 0, 0))
            .fold(0.0, f64::max)
    }

    /// Batch rate if a move of `size` bytes from `from` to `to` were added
    pub fn rate_with(&self, from: &str, to: &str, size: u64) -> f64 {
        let others = self
            .incoming
            .keys()
            .chain(self.outgoing.keys())
            .filter(|n| n.as_str() != from && n.as_str() != to)
            .map(|node| self.node_rate(node, 0, 0))
            .fold(0.0, f64::max);

        others
            .max(self.node_rate(from, 0, size))
            .max(self.node_rate(to, size, 0))
    }

    pub fn add(&mut self, from: &str, to: &str, size: u64) {
        *self.outgoing.entry(from.to_string()).or_default() += size;
        *self.incoming.entry(to.to_string()).or_default() += size;
    }

    fn node_rate(&self, node: &str, extra_in: u64, extra_out: u64) -> f64 {
        let before = self.base.get(node).copied().unwrap_or(0);
        let incoming = self.incoming.get(node).copied().unwrap_or(0) + extra_in;
        let outgoing = self.outgoing.get(node).copied().unwrap_or(0) + extra_out;
        let after = (before + incoming).saturating_sub(outgoing);
        let denominator = before.max(after);
        if denominator == 0 {
            0.0
        } else {
            (incoming + outgoing) as f64 / denominator as f64
        }
    }
}
