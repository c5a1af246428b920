//! Disk and shard-size telemetry
//!
//! Telemetry is collected by the host and handed to the engine read-only.
//! Any entry may be missing; consumers fall back to conservative defaults.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::shard::{NodeId, ShardKey};

/// Disk usage of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl DiskUsage {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }

    /// Used fraction (0.0 - 1.0); a zero-sized disk counts as full
    pub fn used_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            self.used_bytes() as f64 / self.total_bytes as f64
        }
    }

    /// Used fraction after `extra` more bytes land on the disk
    pub fn used_fraction_after(&self, extra: u64) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.used_bytes().saturating_add(extra) as f64 / self.total_bytes as f64
    }
}

/// A shard size observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeSample {
    pub bytes: u64,
    pub observed_at: DateTime<Utc>,
}

/// Source of disk and size telemetry
pub trait SizeTelemetry {
    /// Latest size sample for a shard copy kind, if any was collected
    fn shard_size(&self, key: &ShardKey) -> Option<SizeSample>;

    /// Current disk usage of a node, if known
    fn disk_usage(&self, node: &str) -> Option<DiskUsage>;
}

/// Point-in-time telemetry snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// Disk usage per node id
    #[serde(default)]
    pub disk_usages: BTreeMap<NodeId, DiskUsage>,
    /// Shard sizes keyed by `ShardKey::identifier()`
    #[serde(default)]
    pub shard_sizes: BTreeMap<String, SizeSample>,
}

impl ClusterInfo {
    /// Record a size sample
    pub fn record_size(&mut self, key: &ShardKey, bytes: u64, observed_at: DateTime<Utc>) {
        self.shard_sizes
            .insert(key.identifier(), SizeSample { bytes, observed_at });
    }

    /// Record disk usage for a node
    pub fn record_disk(&mut self, node: impl Into<NodeId>, usage: DiskUsage) {
        self.disk_usages.insert(node.into(), usage);
    }
}

impl SizeTelemetry for ClusterInfo {
    fn shard_size(&self, key: &ShardKey) -> Option<SizeSample> {
        self.shard_sizes.get(&key.identifier()).copied()
    }

    fn disk_usage(&self, node: &str) -> Option<DiskUsage> {
        self.disk_usages.get(node).copied()
    }
}
