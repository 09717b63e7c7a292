//! Frequency counts of flattened leaf values
//!
//! Counts are keyed by the canonical serialized value. The 32-bit fingerprint
//! only picks the hash bucket; equality is always on the full string, so two
//! values that land in the same bucket are still counted apart.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};

use ahash::AHashMap;
use dashmap::DashMap;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ElementError, PipelineError, Result};
use crate::flattener::{leaf_count, Flattener};
use crate::partitioner::partition;

pub const FINGERPRINT_SEED: u32 = 42;

const M: u32 = 0x5bd1e995;
const R: u32 = 24;

/// Fast non-cryptographic 32-bit hash (MurmurHash2 mixing).
#[inline]
pub fn fingerprint(bytes: &[u8]) -> u32 {
    fingerprint_with_seed(bytes, FINGERPRINT_SEED)
}

pub fn fingerprint_with_seed(bytes: &[u8], seed: u32) -> u32 {
    let mut h = seed ^ (bytes.len() as u32);

    let mut chunks = bytes.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);

        h = h.wrapping_mul(M);
        h ^= k;
    }

    // 0-3 trailing bytes
    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Serialized leaf value used as the aggregation key.
///
/// Hashing feeds the fingerprint to the table; `Eq` compares the full string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ValueKey(String);

impl ValueKey {
    pub fn new(serialized: impl Into<String>) -> Self {
        Self(serialized.into())
    }

    /// Canonical (compact JSON) form of a leaf.
    pub fn from_value(value: &Value) -> Self {
        Self(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn fingerprint(&self) -> u32 {
        fingerprint(self.0.as_bytes())
    }
}

impl Hash for ValueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.fingerprint());
    }
}

/// Hasher that passes a precomputed fingerprint straight through.
#[derive(Debug, Default, Clone, Copy)]
pub struct FingerprintHasher {
    hash: u64,
}

impl Hasher for FingerprintHasher {
    fn finish(&self) -> u64 {
        self.hash
    }

    fn write(&mut self, bytes: &[u8]) {
        self.hash = u64::from(fingerprint_with_seed(bytes, self.hash as u32));
    }

    fn write_u32(&mut self, n: u32) {
        // spread the 32-bit fingerprint so hashbrown's top-7 control bits vary
        self.hash = u64::from(n) | (u64::from(n) << 32);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FingerprintState;

impl BuildHasher for FingerprintState {
    type Hasher = FingerprintHasher;

    fn build_hasher(&self) -> Self::Hasher {
        FingerprintHasher::default()
    }
}

/// Frequency table produced by an aggregation run
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    counts: HashMap<ValueKey, u64, FingerprintState>,

    /// Elements left out because their tree was malformed
    pub skipped: Vec<ElementError>,
}

impl Aggregation {
    fn record(&mut self, key: ValueKey) {
        *self.counts.entry(key).or_insert(0) += 1;
    }

    pub fn get(&self, serialized: &str) -> u64 {
        self.counts
            .get(&ValueKey::new(serialized))
            .copied()
            .unwrap_or(0)
    }

    /// Number of distinct values
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Sum of all counts, equal to the number of leaves aggregated
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Most frequent first, ties broken by key
    pub fn sorted(&self) -> Vec<(&str, u64)> {
        let mut rows: Vec<(&str, u64)> = self.iter().collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        rows
    }

    /// Fingerprints shared by more than one distinct value.
    pub fn shared_buckets(&self) -> Vec<(u32, Vec<&str>)> {
        let mut buckets: AHashMap<u32, Vec<&str>> = AHashMap::new();
        for key in self.counts.keys() {
            buckets.entry(key.fingerprint()).or_default().push(key.as_str());
        }

        let mut shared: Vec<(u32, Vec<&str>)> = buckets
            .into_iter()
            .filter(|(_, keys)| keys.len() > 1)
            .map(|(fp, mut keys)| {
                keys.sort_unstable();
                (fp, keys)
            })
            .collect();
        shared.sort_unstable_by_key(|(fp, _)| *fp);
        shared
    }
}

/// Single-threaded aggregator
#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregator {
    flattener: Flattener,
}

impl Aggregator {
    pub fn new(flattener: Flattener) -> Self {
        Self { flattener }
    }

    /// Count every leaf value across `collection`.
    ///
    /// Malformed elements are skipped and listed in `Aggregation::skipped`.
    pub fn aggregate(&self, collection: &[Value]) -> Aggregation {
        let mut out = Aggregation::default();

        for (ordinal, element) in collection.iter().enumerate() {
            match self.flattener.flatten(element) {
                Ok(flat) => {
                    for (_, value) in flat.iter() {
                        out.record(ValueKey::from_value(value));
                    }
                }
                Err(error) => {
                    let leaves = leaf_count(element);
                    warn!(element = ordinal, leaves, %error, "Skipping malformed element");
                    out.skipped.push(ElementError { element: ordinal, leaves, error });
                }
            }
        }

        debug!(distinct = out.len(), total = out.total(), "Aggregation finished");
        out
    }

    /// Same counts as [`Aggregator::aggregate`], computed across `workers` threads
    /// into a shared `DashMap`.
    pub fn aggregate_parallel(&self, collection: &[Value], workers: usize) -> Result<Aggregation> {
        let partitions = partition(collection, workers)?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| PipelineError::InvalidConfig(format!("cannot build worker pool: {e}")))?;

        let counts: DashMap<ValueKey, u64, FingerprintState> =
            DashMap::with_hasher(FingerprintState);

        let mut skipped: Vec<ElementError> = pool.install(|| {
            partitions
                .par_iter()
                .flat_map_iter(|part| {
                    let mut errors = Vec::new();
                    for (ordinal, element) in part.iter() {
                        match self.flattener.flatten(element) {
                            Ok(flat) => {
                                for (_, value) in flat.iter() {
                                    *counts.entry(ValueKey::from_value(value)).or_insert(0) += 1;
                                }
                            }
                            Err(error) => {
                                let leaves = leaf_count(element);
                                warn!(element = ordinal, leaves, %error, "Skipping malformed element");
                                errors.push(ElementError { element: ordinal, leaves, error });
                            }
                        }
                    }
                    errors
                })
                .collect()
        });
        skipped.sort_by_key(|e| e.element);

        let mut out = Aggregation {
            counts: HashMap::with_capacity_and_hasher(counts.len(), FingerprintState),
            skipped,
        };
        out.counts.extend(counts);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flattener::leaf_count;
    use crate::sample::synthetic_collection;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    #[test]
    fn test_fingerprint_vectors() {
        assert_eq!(fingerprint_with_seed(b"", 0), 0);
        assert_eq!(fingerprint(b""), 275_804_818);
        assert_eq!(fingerprint(b"1"), 0x81bc08a1);
        assert_eq!(fingerprint(b"2"), 0x9dfa4a19);
        assert_eq!(fingerprint(b"\"x\""), 0x516fc5de);
        assert_eq!(fingerprint(b"abcd"), 0x7738deaf);
        assert_eq!(fingerprint(b"hello"), 0x7802f8cc);
        assert_eq!(fingerprint(b"fanout-json"), 0xf60b5f4d);
    }

    #[test]
    fn test_counts_by_serialized_value() {
        let collection = vec![json!({"x": 1}), json!({"x": 1}), json!({"x": 2})];
        let agg = Aggregator::default().aggregate(&collection);

        assert_eq!(agg.get("1"), 2);
        assert_eq!(agg.get("2"), 1);
        assert_eq!(agg.len(), 2);
        assert_eq!(agg.total(), 3);
        assert_eq!(agg.sorted(), vec![("1", 2), ("2", 1)]);
    }

    #[test]
    fn test_string_and_number_are_distinct() {
        let collection = vec![json!({"a": 1, "b": "1", "c": true, "d": null, "e": "true"})];
        let agg = Aggregator::default().aggregate(&collection);

        assert_eq!(agg.get("1"), 1);
        assert_eq!(agg.get("\"1\""), 1);
        assert_eq!(agg.get("true"), 1);
        assert_eq!(agg.get("\"true\""), 1);
        assert_eq!(agg.get("null"), 1);
    }

    #[test]
    fn test_shared_bucket_values_are_not_merged() {
        // Both strings serialize to values with the same fingerprint.
        let a = ValueKey::from_value(&json!("v65409"));
        let b = ValueKey::from_value(&json!("v107643"));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a, b);

        let collection = vec![json!(["v65409", "v107643", "v65409"])];
        let agg = Aggregator::default().aggregate(&collection);

        assert_eq!(agg.get("\"v65409\""), 2);
        assert_eq!(agg.get("\"v107643\""), 1);
        assert_eq!(
            agg.shared_buckets(),
            vec![(a.fingerprint(), vec!["\"v107643\"", "\"v65409\""])]
        );
    }

    #[test]
    fn test_totals_match_leaf_count_and_reads_are_stable() {
        let mut rng = StdRng::seed_from_u64(7);
        let collection = synthetic_collection(&mut rng, 300);
        let leaves: usize = collection.iter().map(leaf_count).sum();

        let agg = Aggregator::default().aggregate(&collection);
        assert_eq!(agg.total(), leaves as u64);
        assert_eq!(agg.total(), agg.total());

        let first: u64 = agg.iter().map(|(_, c)| c).sum();
        let second: u64 = agg.iter().map(|(_, c)| c).sum();
        assert_eq!(first, second);
    }

    #[test]
    fn test_parallel_matches_single_threaded() {
        let mut rng = StdRng::seed_from_u64(11);
        let collection = synthetic_collection(&mut rng, 500);

        let single = Aggregator::default().aggregate(&collection);
        let parallel = Aggregator::default()
            .aggregate_parallel(&collection, 6)
            .unwrap();

        assert_eq!(single.len(), parallel.len());
        assert_eq!(single.total(), parallel.total());
        for (key, count) in single.iter() {
            assert_eq!(parallel.get(key), count, "count for {key}");
        }
    }

    #[test]
    fn test_malformed_elements_are_skipped() {
        let collection = vec![json!({"a": 1}), json!({"a.b": 1, "a": {"b": 2}}), json!({"a": 1})];

        let agg = Aggregator::default().aggregate(&collection);
        assert_eq!(agg.get("1"), 2);
        assert_eq!(agg.skipped.len(), 1);
        assert_eq!(agg.skipped[0].element, 1);
        assert_eq!(agg.skipped[0].leaves, 2);
        assert_eq!(agg.total() + agg.skipped[0].leaves as u64, 4);

        let par = Aggregator::default().aggregate_parallel(&collection, 3).unwrap();
        assert_eq!(par.get("1"), 2);
        assert_eq!(par.skipped, agg.skipped);
    }

    #[test]
    fn test_parallel_rejects_zero_workers() {
        assert!(matches!(
            Aggregator::default().aggregate_parallel(&[json!(1)], 0),
            Err(PipelineError::InvalidConfig(_))
        ));
    }
}
