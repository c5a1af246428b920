//! Balance scoring
//!
//! A group's score is the population variance of its per-node loads divided
//! by the squared mean load (zero for a group without load). The cluster
//! score is the sum of group scores, optionally weighted by each group's
//! share of the scored bytes.

use serde::{Deserialize, Serialize};

/// Scores below this are treated as balanced
pub const NEGLIGIBLE_SCORE: f64 = 1e-12;

/// Variance-based scorer
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceScorer {
    pub weight_by_group_size: bool,
}

/// Load statistics for one group across all nodes
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadStats {
    /// Number of eligible nodes
    pub nodes: usize,
    /// Summed load
    pub total: u64,
    /// Sum of squared deviations from the mean
    pub squared_deviation: f64,
}

impl LoadStats {
    /// Two-pass computation over per-node loads
    pub fn from_loads(loads: &[u64]) -> Self {
        let nodes = loads.len();
        let total: u64 = loads.iter().sum();
        if nodes == 0 {
            return Self::default();
        }

        let mean = total as f64 / nodes as f64;
        let squared_deviation = loads
            .iter()
            .map(|&load| {
                let dev = load as f64 - mean;
                dev * dev
            })
            .sum();

        Self {
            nodes,
            total,
            squared_deviation,
        }
    }

    pub fn mean(&self) -> f64 {
        if self.nodes == 0 {
            0.0
        } else {
            self.total as f64 / self.nodes as f64
        }
    }

    /// Normalized variance
    pub fn score(&self) -> f64 {
        normalized(self.squared_deviation, self.mean(), self.nodes)
    }

    /// Score after moving `size` bytes from a node with load `from_load` to
    /// a node with load `to_load`. The mean is unchanged by a move.
    pub fn score_after_move(&self, from_load: u64, to_load: u64, size: u64) -> f64 {
        let mean = self.mean();
        let z = size as f64;
        let from_dev = from_load as f64 - mean;
        let to_dev = to_load as f64 - mean;
        let change = 2.0 * z * (z + to_dev - from_dev);
        normalized((self.squared_deviation + change).max(0.0), mean, self.nodes)
    }

    /// One node's share of the group score; shares sum to `score()`
    pub fn node_contribution(&self, load: u64) -> f64 {
        let dev = load as f64 - self.mean();
        normalized(dev * dev, self.mean(), self.nodes)
    }
}

fn normalized(squared_deviation: f64, mean: f64, nodes: usize) -> f64 {
    if nodes == 0 || mean <= 0.0 {
        return 0.0;
    }
    squared_deviation / (nodes as f64 * mean * mean)
}

impl BalanceScorer {
    pub fn new(weight_by_group_size: bool) -> Self {
        Self {
            weight_by_group_size,
        }
    }

    /// Weight applied to a group's score in the cluster sum
    pub fn weight(&self, group_total: u64, scored_total: u64) -> f64 {
        if !self.weight_by_group_size {
            1.0
        } else if scored_total == 0 {
            0.0
        } else {
            group_total as f64 / scored_total as f64
        }
    }

    /// Normalized variance of per-node loads
    pub fn group_score(&self, loads: &[u64]) -> f64 {
        LoadStats::from_loads(loads).score()
    }

    /// Aggregate over `(group stats)` entries
    pub fn cluster_score<'a, I>(&self, groups: I) -> f64
    where
        I: IntoIterator<Item = &'a LoadStats>,
    {
        let groups: Vec<&LoadStats> = groups.into_iter().collect();
        let scored_total: u64 = groups.iter().map(|g| g.total).sum();
        groups
            .iter()
            .map(|g| self.weight(g.total, scored_total) * g.score())
            .sum()
    }
}
