// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Content-addressed build cache.
//!
//! A cache entry maps a [`CacheKey`] - the deterministic digest of an
//! operation, its input snapshots, and the target platform - to the result of
//! a prior execution. Equal keys must yield semantically interchangeable
//! results; the scheduler assumes nothing about eviction.

use crate::digest::{Digest, DigestWriter};
use crate::graph::{Environment, MetadataAction, Operation};
use crate::platform::Platform;
use crate::snapshot::Snapshot;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Deterministic key binding an operation, its input snapshots, and the
/// target platform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    pub operation_digest: Digest,
    /// Sorted digests of the inputs: the latest context snapshot plus each
    /// direct dependency's snapshot.
    pub input_digests: Vec<Digest>,
    pub platform: Platform,
    /// Degenerate keys never match and are never written back.
    #[serde(skip)]
    degenerate: bool,
}

impl CacheKey {
    pub fn new(operation_digest: Digest, mut input_digests: Vec<Digest>, platform: Platform) -> Self {
        input_digests.sort();
        Self {
            operation_digest,
            input_digests,
            platform,
            degenerate: false,
        }
    }

    /// A key that can never match a prior entry. Used when a real key cannot
    /// be computed (e.g. a dependency snapshot is missing); looking it up is
    /// a guaranteed miss and it is never written, so it cannot poison the
    /// cache.
    pub fn degenerate(platform: Platform) -> Self {
        let salt = uuid::Uuid::new_v4();
        Self {
            operation_digest: Digest::of(salt.as_bytes()),
            input_digests: Vec::new(),
            platform,
            degenerate: true,
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.degenerate
    }

    /// Combined digest of the whole key.
    pub fn digest(&self) -> Digest {
        let mut writer = DigestWriter::new();
        writer.digest(&self.operation_digest);
        for input in &self.input_digests {
            writer.digest(input);
        }
        writer.field("platform", &self.platform.to_string());
        writer.finish()
    }
}

/// The replayable outcome of a prior execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub snapshot: Snapshot,
    pub environment_changes: Environment,
    pub metadata_changes: Vec<MetadataAction>,
}

/// Counters reported by a cache implementation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub evictions: u64,
}

/// The cache boundary the scheduler talks to.
///
/// Implementations must degrade read failures to a miss (`None`); the
/// scheduler treats every miss the same way.
#[async_trait]
pub trait BuildCache: Send + Sync {
    async fn get(&self, key: &CacheKey, operation: &Operation) -> Option<CachedResult>;
    async fn put(&self, key: &CacheKey, operation: &Operation, entry: CachedResult);
    async fn statistics(&self) -> CacheStatistics;
}

/// In-memory cache keyed by the combined key digest. No eviction.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<Digest, CachedResult>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl BuildCache for MemoryCache {
    async fn get(&self, key: &CacheKey, operation: &Operation) -> Option<CachedResult> {
        let entry = self.entries.get(&key.digest()).map(|e| e.clone());
        match &entry {
            Some(_) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(operation = %operation.describe(), "cache hit");
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(operation = %operation.describe(), "cache miss");
            }
        }
        entry
    }

    async fn put(&self, key: &CacheKey, operation: &Operation, entry: CachedResult) {
        if key.is_degenerate() {
            return;
        }
        tracing::trace!(operation = %operation.describe(), "cache store");
        self.entries.insert(key.digest(), entry);
    }

    async fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len() as u64,
            evictions: 0,
        }
    }
}
