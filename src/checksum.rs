//! Manifest checksums.
//!
//! The checksum is a 64-bit digest over a canonical serialization of a
//! manifest's blocks, never over in-memory layout, so it is stable across
//! processes, platforms and the order in which a manifest was assembled.
//!
//! Canonical stream, all integers little-endian:
//!
//! ```text
//! "buildsync.manifest" | version: u32 | max_block_size: u32
//! for each block, ordered by (path, index):
//!     path_len: u64 | path bytes | index: u32 | hash: [u8; 32] | size: u32
//! block_count: u64
//! ```
//!
//! The stream is hashed with BLAKE3 and the first eight output bytes are
//! read as a little-endian `u64`.

use std::fmt;
use std::str::FromStr;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{BuildSyncError, Result};
use crate::manifest::{BlockSource, Manifest};
use crate::types::BuildId;

const DOMAIN_TAG: &[u8] = b"buildsync.manifest";
const FORMAT_VERSION: u32 = 1;

/// Deterministic digest of a manifest's full content.
///
/// # Example
///
/// ```rust
/// use buildsync::{ManifestBuilder, ManifestChecksum};
///
/// let mut builder = ManifestBuilder::new(4096).unwrap();
/// builder.add_file("readme.txt").unwrap().process_block(b"hello").unwrap();
/// let manifest = builder.build();
///
/// assert_eq!(
///     ManifestChecksum::compute(&manifest),
///     ManifestChecksum::compute(&manifest.clone()),
/// );
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ManifestChecksum(u64);

impl ManifestChecksum {
    /// Wrap a raw checksum value.
    #[must_use]
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Raw checksum value, as carried on the wire.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Compute the checksum of any block source.
    #[must_use]
    pub fn compute<S: BlockSource + ?Sized>(source: &S) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(DOMAIN_TAG);
        hasher.update(&FORMAT_VERSION.to_le_bytes());
        hasher.update(&source.max_block_size().to_le_bytes());

        let mut count = 0u64;
        for (key, block) in source.blocks() {
            hasher.update(&(key.path.len() as u64).to_le_bytes());
            hasher.update(key.path.as_bytes());
            hasher.update(&key.index.to_le_bytes());
            hasher.update(block.hash.as_bytes());
            hasher.update(&block.size.to_le_bytes());
            count += 1;
        }
        hasher.update(&count.to_le_bytes());

        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        Self(u64::from_le_bytes(prefix))
    }

    /// Check this checksum against an expected value.
    ///
    /// # Errors
    ///
    /// Returns `ChecksumMismatch` if the values differ.
    pub fn verify(self, expected: Self) -> Result<()> {
        if self != expected {
            return Err(BuildSyncError::ChecksumMismatch {
                expected: expected.0,
                actual: self.0,
            });
        }
        Ok(())
    }
}

impl fmt::Display for ManifestChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for ManifestChecksum {
    type Err = BuildSyncError;

    fn from_str(s: &str) -> Result<Self> {
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|e| BuildSyncError::InvalidRequest(format!("invalid checksum {s:?}: {e}")))
    }
}

/// Insert-only cache of checksums per published build.
///
/// Manifests are immutable once published, so an entry never goes stale.
#[derive(Debug, Default)]
pub struct ChecksumCache {
    entries: DashMap<BuildId, ManifestChecksum>,
}

impl ChecksumCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached checksum for a build, if any.
    #[must_use]
    pub fn get(&self, id: &BuildId) -> Option<ManifestChecksum> {
        self.entries.get(id).map(|entry| *entry)
    }

    /// Return the cached checksum or compute and cache it.
    ///
    /// The checksum is computed without holding any shard lock.
    pub fn get_or_compute(&self, id: &BuildId, manifest: &Manifest) -> ManifestChecksum {
        if let Some(checksum) = self.get(id) {
            return checksum;
        }
        let checksum = ManifestChecksum::compute(manifest);
        *self.entries.entry(id.clone()).or_insert(checksum)
    }

    /// Number of cached builds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::BlockHash;
    use crate::manifest::BlockInfo;

    fn block(seed: &[u8], size: u32) -> BlockInfo {
        BlockInfo::new(BlockHash::compute(seed), size)
    }

    fn sample() -> Manifest {
        let mut manifest = Manifest::new(4096).unwrap();
        manifest
            .insert_file("bin/game", vec![block(b"g0", 4096), block(b"g1", 12)])
            .unwrap();
        manifest
            .insert_file("data/a.pak", vec![block(b"a0", 300)])
            .unwrap();
        manifest
    }

    // ==========================================================================
    // DETERMINISM
    // ==========================================================================

    #[test]
    fn checksum_deterministic() {
        let manifest = sample();
        assert_eq!(
            ManifestChecksum::compute(&manifest),
            ManifestChecksum::compute(&manifest)
        );
    }

    #[test]
    fn checksum_independent_of_insertion_order() {
        let mut reversed = Manifest::new(4096).unwrap();
        reversed
            .insert_file("data/a.pak", vec![block(b"a0", 300)])
            .unwrap();
        reversed
            .insert_file("bin/game", vec![block(b"g0", 4096), block(b"g1", 12)])
            .unwrap();

        assert_eq!(
            ManifestChecksum::compute(&sample()),
            ManifestChecksum::compute(&reversed)
        );
    }

    #[test]
    fn checksum_survives_serialization() {
        let manifest = sample();
        let bytes = bincode::serialize(&manifest).unwrap();
        let restored: Manifest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(
            ManifestChecksum::compute(&manifest),
            ManifestChecksum::compute(&restored)
        );
    }

    // ==========================================================================
    // SENSITIVITY
    // ==========================================================================

    #[test]
    fn checksum_changes_with_block_hash() {
        let mut changed = sample();
        changed
            .insert_file("data/a.pak", vec![block(b"a1", 300)])
            .unwrap();
        assert_ne!(
            ManifestChecksum::compute(&sample()),
            ManifestChecksum::compute(&changed)
        );
    }

    #[test]
    fn checksum_changes_with_block_size() {
        let mut changed = sample();
        changed
            .insert_file("data/a.pak", vec![block(b"a0", 301)])
            .unwrap();
        assert_ne!(
            ManifestChecksum::compute(&sample()),
            ManifestChecksum::compute(&changed)
        );
    }

    #[test]
    fn checksum_changes_with_rename() {
        let mut changed = sample();
        let blocks = changed.remove_file("data/a.pak").unwrap();
        changed.insert_file("data/b.pak", blocks).unwrap();
        assert_ne!(
            ManifestChecksum::compute(&sample()),
            ManifestChecksum::compute(&changed)
        );
    }

    #[test]
    fn checksum_path_boundaries_unambiguous() {
        let shared = block(b"x", 1);
        let mut split_one = Manifest::new(4096).unwrap();
        split_one.insert_file("ab", vec![shared]).unwrap();
        let mut split_two = Manifest::new(4096).unwrap();
        split_two.insert_file("a", vec![shared]).unwrap();

        assert_ne!(
            ManifestChecksum::compute(&split_one),
            ManifestChecksum::compute(&split_two)
        );
    }

    #[test]
    fn checksum_changes_with_block_size_limit() {
        let small = Manifest::new(4096).unwrap();
        let large = Manifest::new(8192).unwrap();
        assert_ne!(
            ManifestChecksum::compute(&small),
            ManifestChecksum::compute(&large)
        );
    }

    // ==========================================================================
    // VERIFY / ENCODING
    // ==========================================================================

    #[test]
    fn verify_match_and_mismatch() {
        let checksum = ManifestChecksum::compute(&sample());
        assert!(checksum.verify(checksum).is_ok());

        let err = checksum.verify(ManifestChecksum::from_u64(1)).unwrap_err();
        assert!(matches!(
            err,
            BuildSyncError::ChecksumMismatch { expected: 1, .. }
        ));
    }

    #[test]
    fn display_and_parse() {
        let checksum = ManifestChecksum::from_u64(0x0123_4567_89ab_cdef);
        assert_eq!(checksum.to_string(), "0123456789abcdef");
        assert_eq!("0123456789abcdef".parse::<ManifestChecksum>().unwrap(), checksum);
        assert!("not hex".parse::<ManifestChecksum>().is_err());
    }

    // ==========================================================================
    // CACHE
    // ==========================================================================

    #[test]
    fn cache_get_or_compute() {
        let cache = ChecksumCache::new();
        let id = BuildId::new(vec![1, 2, 3]);
        let manifest = sample();

        assert!(cache.get(&id).is_none());
        let checksum = cache.get_or_compute(&id, &manifest);
        assert_eq!(checksum, ManifestChecksum::compute(&manifest));
        assert_eq!(cache.get(&id), Some(checksum));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cache_concurrent_inserts_agree() {
        let cache = ChecksumCache::new();
        let manifest = sample();
        let expected = ManifestChecksum::compute(&manifest);

        std::thread::scope(|scope| {
            for i in 0..8u8 {
                let cache = &cache;
                let manifest = &manifest;
                scope.spawn(move || {
                    let id = BuildId::new(vec![i % 2]);
                    assert_eq!(cache.get_or_compute(&id, manifest), expected);
                });
            }
        });

        assert_eq!(cache.len(), 2);
    }
}
