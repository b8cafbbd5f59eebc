// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Filesystem snapshots and the snapshotter boundary.
//!
//! The engine never touches filesystem content directly. Executors ask a
//! [`Snapshotter`] for the opaque handle identifying the state after an
//! operation; the on-disk content store and diff/materialization machinery
//! live behind this trait, outside the core.

use crate::digest::{Digest, DigestWriter};
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Opaque handle identifying a filesystem state at a point in the build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub digest: Digest,
    pub size: u64,
}

impl Snapshot {
    pub fn new(digest: Digest, size: u64) -> Self {
        Self { digest, size }
    }
}

/// Provides post-operation filesystem-state handles.
///
/// `materialize` must be deterministic: the same parent and operation digest
/// always produce the same snapshot, across processes.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    async fn materialize(
        &self,
        parent: Option<&Snapshot>,
        operation_digest: &Digest,
    ) -> Result<Snapshot>;
}

/// In-memory snapshotter deriving child identities by digest chaining.
///
/// Sizes are synthetic but deterministic: a pseudo-delta derived from the
/// child digest is added to the parent size, so repeated builds agree on
/// every snapshot byte-for-byte.
#[derive(Debug, Default)]
pub struct MemorySnapshotter {
    snapshots: DashMap<Digest, Snapshot>,
}

impl MemorySnapshotter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct snapshots materialized so far.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.snapshots.contains_key(digest)
    }
}

#[async_trait]
impl Snapshotter for MemorySnapshotter {
    async fn materialize(
        &self,
        parent: Option<&Snapshot>,
        operation_digest: &Digest,
    ) -> Result<Snapshot> {
        let mut writer = DigestWriter::new();
        writer.digest(&parent.map(|p| p.digest).unwrap_or_else(Digest::zero));
        writer.digest(operation_digest);
        let digest = writer.finish();

        let delta = u64::from_le_bytes(
            digest.as_bytes()[..8]
                .try_into()
                .unwrap_or([0u8; 8]),
        ) % 4096;
        let size = parent.map(|p| p.size).unwrap_or(0) + delta;

        let snapshot = Snapshot::new(digest, size);
        self.snapshots.insert(digest, snapshot);
        Ok(snapshot)
    }
}
