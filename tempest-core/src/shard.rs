//! Shard and node identities
//!
//! A shard is one partition of an index. Every shard has exactly one primary
//! copy and zero or more replica copies; each copy lives on one node.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Node identifier as assigned by the host cluster
pub type NodeId = String;

/// Identity of one shard of an index (shared by all of its copies)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    /// Owning index name
    pub index: String,
    /// Shard number within the index
    pub shard: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

/// Telemetry key for a shard copy kind.
///
/// Size telemetry reports one value for the primary and one value shared by
/// every replica of the same shard, so the key carries the primary flag but
/// not the node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey {
    pub shard_id: ShardId,
    pub primary: bool,
}

impl ShardKey {
    pub fn new(shard_id: ShardId, primary: bool) -> Self {
        Self { shard_id, primary }
    }

    /// Identifier used by size telemetry, e.g. `[logs-2016][3][p]`
    pub fn identifier(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]",
            self.shard_id,
            if self.primary { "p" } else { "r" }
        )
    }
}

/// Routing state of a shard copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    /// Not assigned to any node
    Unassigned,
    /// Assigned and recovering on its node
    Initializing,
    /// Active on its node
    Started,
    /// Active on its node and being copied to `relocating_node`
    Relocating,
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShardState::Unassigned => "unassigned",
            ShardState::Initializing => "initializing",
            ShardState::Started => "started",
            ShardState::Relocating => "relocating",
        };
        f.write_str(name)
    }
}

/// One copy of a shard as seen in the routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub shard_id: ShardId,
    pub primary: bool,
    pub state: ShardState,
    /// Node currently holding the copy (None when unassigned)
    #[serde(default)]
    pub node: Option<NodeId>,
    /// Relocation target while `state` is `Relocating`
    #[serde(default)]
    pub relocating_node: Option<NodeId>,
}

impl ShardRouting {
    /// A copy that has not been placed yet
    pub fn unassigned(shard_id: ShardId, primary: bool) -> Self {
        Self {
            shard_id,
            primary,
            state: ShardState::Unassigned,
            node: None,
            relocating_node: None,
        }
    }

    /// An active copy on `node`
    pub fn started(shard_id: ShardId, primary: bool, node: impl Into<NodeId>) -> Self {
        Self {
            shard_id,
            primary,
            state: ShardState::Started,
            node: Some(node.into()),
            relocating_node: None,
        }
    }

    pub fn key(&self) -> ShardKey {
        ShardKey::new(self.shard_id.clone(), self.primary)
    }

    /// Whether the copy is recovering somewhere (initializing or relocating)
    pub fn in_flight(&self) -> bool {
        matches!(self.state, ShardState::Initializing | ShardState::Relocating)
    }

    /// The node the copy will live on once in-flight work completes
    pub fn projected_node(&self) -> Option<&NodeId> {
        match self.state {
            ShardState::Relocating => self.relocating_node.as_ref().or(self.node.as_ref()),
            _ => self.node.as_ref(),
        }
    }
}
