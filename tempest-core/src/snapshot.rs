//! Cluster snapshot
//!
//! The host hands the engine one snapshot per scheduling cycle: live nodes,
//! index metadata, the full routing table and telemetry. The engine only
//! reads it. The mutating helpers here are used by hosts (and the simulator)
//! to apply accepted work between cycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Result, TempestError};
use crate::shard::{NodeId, ShardId, ShardRouting, ShardState};
use crate::telemetry::ClusterInfo;

/// A live data node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    pub id: NodeId,
    /// Host name used for operator-facing reports
    pub host_name: String,
    /// Custom node attributes (zone, rack, ...)
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Set by the host for nodes that should not receive new shards
    #[serde(default)]
    pub blacklisted: bool,
}

impl DiscoveryNode {
    pub fn new(id: impl Into<NodeId>) -> Self {
        let id = id.into();
        Self {
            host_name: id.clone(),
            id,
            attributes: BTreeMap::new(),
            blacklisted: false,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Look up an attribute, including the built-in `_id`, `_name` and `_host`
    pub fn attribute(&self, key: &str) -> Option<&str> {
        match key {
            "_id" => Some(self.id.as_str()),
            "_name" | "_host" => Some(self.host_name.as_str()),
            _ => self.attributes.get(key).map(String::as_str),
        }
    }
}

/// Index metadata relevant to placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    pub number_of_shards: u32,
    #[serde(default)]
    pub number_of_replicas: u32,
    #[serde(default)]
    pub creation_date: Option<DateTime<Utc>>,
}

/// Everything the engine sees in one cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub nodes: Vec<DiscoveryNode>,
    #[serde(default)]
    pub indices: Vec<IndexMetadata>,
    #[serde(default)]
    pub shards: Vec<ShardRouting>,
    #[serde(default)]
    pub info: ClusterInfo,
}

impl ClusterSnapshot {
    /// Parse a snapshot from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a snapshot from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn node(&self, id: &str) -> Option<&DiscoveryNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Whether any copy is initializing or relocating
    pub fn has_shards_in_flight(&self) -> bool {
        self.shards.iter().any(ShardRouting::in_flight)
    }

    /// Copies currently in the given state
    pub fn shards_with_state(&self, state: ShardState) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(move |s| s.state == state)
    }

    /// Assign an unassigned copy to `node`; it starts out initializing
    pub fn start_shard(&mut self, shard_id: &ShardId, primary: bool, node: &str) -> Result<()> {
        if self.node(node).is_none() {
            return Err(TempestError::UnknownNode(node.to_string()));
        }

        let routing = self
            .shards
            .iter_mut()
            .find(|s| {
                &s.shard_id == shard_id && s.primary == primary && s.state == ShardState::Unassigned
            })
            .ok_or_else(|| TempestError::UnknownShard(format!("{} (unassigned)", shard_id)))?;

        routing.state = ShardState::Initializing;
        routing.node = Some(node.to_string());
        Ok(())
    }

    /// Begin relocating a started copy from `from` to `to`
    pub fn relocate_shard(
        &mut self,
        shard_id: &ShardId,
        primary: bool,
        from: &str,
        to: &str,
    ) -> Result<()> {
        if self.node(to).is_none() {
            return Err(TempestError::UnknownNode(to.to_string()));
        }

        let routing = self
            .shards
            .iter_mut()
            .find(|s| {
                &s.shard_id == shard_id && s.primary == primary && s.node.as_deref() == Some(from)
            })
            .ok_or_else(|| TempestError::UnknownShard(format!("{} on {}", shard_id, from)))?;

        if routing.state != ShardState::Started {
            return Err(TempestError::InvalidShardState {
                shard: routing.key().identifier(),
                expected: ShardState::Started.to_string(),
                found: routing.state.to_string(),
            });
        }

        routing.state = ShardState::Relocating;
        routing.relocating_node = Some(to.to_string());
        Ok(())
    }

    /// Complete all in-flight recoveries; returns how many copies settled
    pub fn settle(&mut self) -> usize {
        let mut settled = 0;
        for routing in &mut self.shards {
            match routing.state {
                ShardState::Initializing => {
                    routing.state = ShardState::Started;
                    settled += 1;
                }
                ShardState::Relocating => {
                    if let Some(target) = routing.relocating_node.take() {
                        routing.node = Some(target);
                    }
                    routing.state = ShardState::Started;
                    settled += 1;
                }
                _ => {}
            }
        }
        settled
    }
}
