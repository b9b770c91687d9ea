//! Key-range shard topology.
//!
//! A keyspace's id space is partitioned into half-open byte ranges
//! `[start, end)`, one per shard. This module provides:
//! - `KeyRange` with a fast containment test
//! - unsigned byte-string comparison (`compare_bytes`)
//! - ordered `ShardReference` lists and `build_references` for N-way
//!   range-based sharding
//! - `ShardMapCache`, the per-(keyspace, shard-count) reference cache
//!
//! Byte comparison and range-boundary emptiness are deliberately two separate
//! contracts: `compare_bytes` sorts any empty slice lowest, while a KeyRange
//! with an empty `end` is unbounded above. `KeyRange::contains` applies the
//! boundary rules itself and never routes the upper bound through the
//! general comparison's empty case.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyRangeError {
    #[error("invalid shard count: {0} (must be between 1 and 256)")]
    InvalidShardCount(usize),
    #[error("invalid key range: start {start} sorts after end {end}")]
    InvertedRange { start: String, end: String },
}

/// Compares two byte strings as unsigned bytes, shortest-prefix-first.
///
/// An empty slice sorts lowest regardless of argument position. A length
/// mismatch with an equal common prefix compares equal: callers that need a
/// total order must use fixed-width keys.
pub fn compare_bytes(a: &[u8], b: &[u8]) -> Ordering {
    if a.is_empty() {
        return if b.is_empty() { Ordering::Equal } else { Ordering::Less };
    }
    if b.is_empty() {
        return Ordering::Greater;
    }
    for (x, y) in a.iter().zip(b.iter()) {
        match x.cmp(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Immutable half-open ownership range `[start, end)` over the keyspace-id
/// space. An empty `end` means unbounded above; an empty `start` means
/// unbounded below.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    start: Vec<u8>,
    end: Vec<u8>,
}

impl KeyRange {
    pub fn new(start: Vec<u8>, end: Vec<u8>) -> Result<KeyRange, KeyRangeError> {
        if !start.is_empty() && !end.is_empty() && compare_bytes(&start, &end) == Ordering::Greater {
            return Err(KeyRangeError::InvertedRange {
                start: hex(&start),
                end: hex(&end),
            });
        }
        Ok(KeyRange { start, end })
    }

    /// The full keyspace-id space.
    pub fn full() -> KeyRange {
        KeyRange {
            start: Vec::new(),
            end: Vec::new(),
        }
    }

    pub fn start(&self) -> &[u8] {
        &self.start
    }

    pub fn end(&self) -> &[u8] {
        &self.end
    }

    /// Half-open containment: `start <= id` and, unless the range is
    /// unbounded above, `id < end`. Inclusive on the low boundary.
    pub fn contains(&self, id: &[u8]) -> bool {
        compare_bytes(&self.start, id) != Ordering::Greater
            && (self.end.is_empty() || compare_bytes(id, &self.end) == Ordering::Less)
    }

    /// Canonical shard name for this range, e.g. `-40`, `40-80`, `c0-`.
    pub fn shard_name(&self) -> String {
        format!("{}-{}", hex(&self.start), hex(&self.end))
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.shard_name())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// One shard of a keyspace: its name plus the key range it owns. A missing
/// range marks an unsharded keyspace whose single shard owns everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardReference {
    pub name: String,
    pub key_range: Option<KeyRange>,
}

impl ShardReference {
    pub fn new(name: impl Into<String>, key_range: Option<KeyRange>) -> ShardReference {
        ShardReference {
            name: name.into(),
            key_range,
        }
    }

    pub fn contains(&self, id: &[u8]) -> bool {
        match &self.key_range {
            None => true,
            Some(range) => range.contains(id),
        }
    }
}

/// Builds the ordered reference list for N-way range-based sharding by
/// dividing the byte value space `0..256` into N equal buckets. Boundaries
/// are single bytes, so at most 256 shards can be produced this way.
pub fn build_references(shard_count: usize) -> Result<Vec<ShardReference>, KeyRangeError> {
    if shard_count == 0 || shard_count > 256 {
        return Err(KeyRangeError::InvalidShardCount(shard_count));
    }
    let mut refs = Vec::with_capacity(shard_count);
    let mut start: Vec<u8> = Vec::new();
    for i in 1..=shard_count {
        let end: Vec<u8> = if i == shard_count {
            Vec::new()
        } else {
            vec![((i * 256) / shard_count) as u8]
        };
        let range = KeyRange::new(start.clone(), end.clone())?;
        refs.push(ShardReference::new(range.shard_name(), Some(range)));
        start = end;
    }
    Ok(refs)
}

/// Cache of shard-reference lists keyed by (keyspace, shard count).
///
/// Built once per entry and shared via `Arc`; a topology-change notification
/// invalidates the keyspace's entries and the next reader rebuilds. Lookup
/// is double-checked so concurrent first-time builders do not duplicate the
/// stored entry.
#[derive(Debug, Default)]
pub struct ShardMapCache {
    entries: RwLock<FxHashMap<(String, usize), Arc<Vec<ShardReference>>>>,
}

impl ShardMapCache {
    pub fn new() -> ShardMapCache {
        ShardMapCache::default()
    }

    /// Returns the cached reference list for the keyspace at the given shard
    /// count, building it on first use.
    pub fn references(
        &self,
        keyspace: &str,
        shard_count: usize,
    ) -> Result<Arc<Vec<ShardReference>>, KeyRangeError> {
        let key = (keyspace.to_string(), shard_count);
        if let Some(existing) = self.entries.read().get(&key) {
            return Ok(Arc::clone(existing));
        }
        let built = Arc::new(build_references(shard_count)?);
        let mut entries = self.entries.write();
        Ok(Arc::clone(entries.entry(key).or_insert(built)))
    }

    /// Drops every cached list for a keyspace. Called on topology change.
    pub fn invalidate(&self, keyspace: &str) {
        self.entries.write().retain(|(ks, _), _| ks != keyspace);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

// ============================================================================
// Tests
// ============================================================================
