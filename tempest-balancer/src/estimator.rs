//! Shard size estimator
//!
//! Caches the most recent size sample per shard key. Entries older than the
//! model age are refreshed from telemetry the next time they are asked for;
//! when telemetry has nothing fresh either, the configured default size is
//! used instead of a stale value.
//!
//! The model builder prunes the cache once per cycle, so entries for shards
//! that left the cluster do not accumulate.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use tempest_core::{IndexMetadata, ShardId, ShardKey, SizeSample, SizeTelemetry};
use tracing::debug;

/// Where an estimate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateSource {
    Cached,
    Telemetry,
    Default,
}

/// A size estimate for one shard copy kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeEstimate {
    pub bytes: u64,
    pub source: EstimateSource,
}

/// Time-windowed shard size cache
#[derive(Debug, Clone)]
pub struct ShardSizeEstimator {
    cache: HashMap<ShardKey, SizeSample>,
    max_age: Duration,
    default_size: u64,
}

impl ShardSizeEstimator {
    pub fn new(max_age: Duration, default_size: u64) -> Self {
        Self {
            cache: HashMap::new(),
            max_age,
            default_size,
        }
    }

    /// Apply a new staleness window and default size
    pub fn reconfigure(&mut self, max_age: Duration, default_size: u64) {
        self.max_age = max_age;
        self.default_size = default_size;
    }

    pub fn default_size(&self) -> u64 {
        self.default_size
    }

    /// Estimated size in bytes for a shard copy kind
    pub fn size_of<T>(&mut self, key: &ShardKey, telemetry: &T, now: DateTime<Utc>) -> u64
    where
        T: SizeTelemetry + ?Sized,
    {
        self.estimate(key, telemetry, now).bytes
    }

    /// Estimate with provenance
    pub fn estimate<T>(&mut self, key: &ShardKey, telemetry: &T, now: DateTime<Utc>) -> SizeEstimate
    where
        T: SizeTelemetry + ?Sized,
    {
        if let Some(sample) = self.cache.get(key) {
            if self.is_fresh(sample, now) {
                return SizeEstimate {
                    bytes: sample.bytes,
                    source: EstimateSource::Cached,
                };
            }
        }

        match telemetry.shard_size(key) {
            Some(sample) if self.is_fresh(&sample, now) => {
                self.cache.insert(key.clone(), sample);
                SizeEstimate {
                    bytes: sample.bytes,
                    source: EstimateSource::Telemetry,
                }
            }
            stale => {
                if stale.is_some() {
                    debug!(shard = %key, "Size sample older than model age, using default");
                }
                self.cache.remove(key);
                SizeEstimate {
                    bytes: self.default_size,
                    source: EstimateSource::Default,
                }
            }
        }
    }

    /// Whether the cache holds an estimate inside the staleness window
    pub fn has_fresh_estimate(&self, key: &ShardKey, now: DateTime<Utc>) -> bool {
        self.cache
            .get(key)
            .map(|sample| self.is_fresh(sample, now))
            .unwrap_or(false)
    }

    /// Indices created inside the staleness window or lacking a fresh
    /// estimate for any of their shard keys
    pub fn young_indexes(&self, indices: &[IndexMetadata], now: DateTime<Utc>) -> BTreeSet<String> {
        indices
            .iter()
            .filter(|index| {
                let recently_created = index
                    .creation_date
                    .map(|created| now.signed_duration_since(created) <= self.max_age)
                    .unwrap_or(false);

                recently_created || !self.all_estimates_fresh(index, now)
            })
            .map(|index| index.name.clone())
            .collect()
    }

    /// Evict entries that are stale or whose key is not in `live`.
    /// Returns the number of evicted entries.
    pub fn retain_live(&mut self, live: &HashSet<ShardKey>, now: DateTime<Utc>) -> usize {
        let before = self.cache.len();
        let max_age = self.max_age;
        self.cache.retain(|key, sample| {
            live.contains(key) && now.signed_duration_since(sample.observed_at) <= max_age
        });
        before - self.cache.len()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    fn all_estimates_fresh(&self, index: &IndexMetadata, now: DateTime<Utc>) -> bool {
        (0..index.number_of_shards).all(|shard| {
            let shard_id = ShardId::new(index.name.clone(), shard);
            let primary_fresh =
                self.has_fresh_estimate(&ShardKey::new(shard_id.clone(), true), now);
            let replicas_fresh = index.number_of_replicas == 0
                || self.has_fresh_estimate(&ShardKey::new(shard_id, false), now);
            primary_fresh && replicas_fresh
        })
    }

    fn is_fresh(&self, sample: &SizeSample, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(sample.observed_at) <= self.max_age
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempest_core::ClusterInfo;

    fn key(index: &str, shard: u32, primary: bool) -> ShardKey {
        ShardKey::new(ShardId::new(index, shard), primary)
    }

    fn index(name: &str, shards: u32, replicas: u32) -> IndexMetadata {
        IndexMetadata {
            name: name.to_string(),
            number_of_shards: shards,
            number_of_replicas: replicas,
            creation_date: None,
        }
    }

    #[test]
    fn test_fresh_sample_is_cached() {
        let now = Utc::now();
        let mut info = ClusterInfo::default();
        info.record_size(&key("a", 0, true), 500, now - Duration::minutes(5));

        let mut estimator = ShardSizeEstimator::new(Duration::minutes(60), 100);
        let first = estimator.estimate(&key("a", 0, true), &info, now);
        assert_eq!(first.bytes, 500);
        assert_eq!(first.source, EstimateSource::Telemetry);

        let second = estimator.estimate(&key("a", 0, true), &ClusterInfo::default(), now);
        assert_eq!(second.bytes, 500);
        assert_eq!(second.source, EstimateSource::Cached);
    }

    #[test]
    fn test_missing_telemetry_uses_default() {
        let mut estimator = ShardSizeEstimator::new(Duration::minutes(60), 100);
        let estimate = estimator.estimate(&key("a", 0, true), &ClusterInfo::default(), Utc::now());
        assert_eq!(estimate.bytes, 100);
        assert_eq!(estimate.source, EstimateSource::Default);
    }

    #[test]
    fn test_stale_sample_uses_default() {
        let now = Utc::now();
        let mut info = ClusterInfo::default();
        info.record_size(&key("a", 0, true), 500, now - Duration::minutes(90));

        let mut estimator = ShardSizeEstimator::new(Duration::minutes(60), 100);
        assert_eq!(estimator.size_of(&key("a", 0, true), &info, now), 100);
        assert!(!estimator.has_fresh_estimate(&key("a", 0, true), now));
    }

    #[test]
    fn test_cache_entry_expires_and_refreshes() {
        let start = Utc::now();
        let mut info = ClusterInfo::default();
        info.record_size(&key("a", 0, true), 500, start);

        let mut estimator = ShardSizeEstimator::new(Duration::minutes(60), 100);
        assert_eq!(estimator.size_of(&key("a", 0, true), &info, start), 500);

        let later = start + Duration::minutes(61);
        info.record_size(&key("a", 0, true), 800, later);
        assert_eq!(estimator.size_of(&key("a", 0, true), &info, later), 800);
    }

    #[test]
    fn test_young_indexes() {
        let now = Utc::now();
        let mut info = ClusterInfo::default();
        for shard in 0..2 {
            info.record_size(&key("settled", shard, true), 10, now);
            info.record_size(&key("settled", shard, false), 10, now);
        }
        info.record_size(&key("partial", 0, true), 10, now);

        let mut estimator = ShardSizeEstimator::new(Duration::minutes(60), 100);
        let indices = vec![
            index("settled", 2, 1),
            index("partial", 2, 0),
            IndexMetadata {
                creation_date: Some(now - Duration::minutes(1)),
                ..index("brand-new", 1, 0)
            },
        ];

        for meta in &indices {
            for shard in 0..meta.number_of_shards {
                estimator.size_of(&key(&meta.name, shard, true), &info, now);
                estimator.size_of(&key(&meta.name, shard, false), &info, now);
            }
        }

        let young = estimator.young_indexes(&indices, now);
        assert!(!young.contains("settled"));
        assert!(young.contains("partial"));
        assert!(young.contains("brand-new"));
    }

    #[test]
    fn test_retain_live_evicts_departed_and_stale_keys() {
        let now = Utc::now();
        let mut info = ClusterInfo::default();
        info.record_size(&key("logs-1", 0, true), 10, now);
        info.record_size(&key("logs-2", 0, true), 20, now);

        let mut estimator = ShardSizeEstimator::new(Duration::minutes(60), 100);
        estimator.size_of(&key("logs-1", 0, true), &info, now);
        estimator.size_of(&key("logs-2", 0, true), &info, now);
        assert_eq!(estimator.cached_len(), 2);

        let live: HashSet<ShardKey> = [key("logs-2", 0, true)].into_iter().collect();
        assert_eq!(estimator.retain_live(&live, now), 1);
        assert_eq!(estimator.cached_len(), 1);
        assert!(estimator.has_fresh_estimate(&key("logs-2", 0, true), now));

        // still live, but past the window
        assert_eq!(estimator.retain_live(&live, now + Duration::minutes(61)), 1);
        assert_eq!(estimator.cached_len(), 0);
    }
}
