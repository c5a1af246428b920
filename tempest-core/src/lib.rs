//! Tempest Core Library
//!
//! Types shared between the Tempest placement engine and its host cluster.
//! This crate provides:
//! - Shard and node identities and routing states
//! - The per-cycle cluster snapshot consumed by the engine
//! - Disk and shard-size telemetry
//! - Common error handling

pub mod error;
pub mod shard;
pub mod snapshot;
pub mod telemetry;

pub use error::{Result, TempestError};
pub use shard::{NodeId, ShardId, ShardKey, ShardRouting, ShardState};
pub use snapshot::{ClusterSnapshot, DiscoveryNode, IndexMetadata};
pub use telemetry::{ClusterInfo, DiskUsage, SizeSample, SizeTelemetry};
