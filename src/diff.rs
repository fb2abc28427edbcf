//! Block-level manifest diffs.
//!
//! A diff is the minimal edit script turning a base manifest into a target
//! manifest. Blocks are aligned by identity (file path and block index), not
//! by their position in the overall block listing, so adding or removing a
//! file never shifts the blocks of any other file. The join is a single hash
//! map lookup per block, which keeps diffing linear in the number of blocks.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::checksum::ManifestChecksum;
use crate::error::{BuildSyncError, Result};
use crate::manifest::{BlockInfo, BlockKey, BlockSource, Manifest};

/// Owned location of a block within a build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockLocation {
    /// Normalized file path.
    pub path: String,
    /// Block index within the file.
    pub index: u32,
}

impl BlockLocation {
    /// Create a block location.
    #[must_use]
    pub fn new(path: impl Into<String>, index: u32) -> Self {
        Self {
            path: path.into(),
            index,
        }
    }

    /// Byte offset of the block within its file.
    #[must_use]
    pub fn offset(&self, max_block_size: u32) -> u64 {
        u64::from(self.index) * u64::from(max_block_size)
    }
}

impl From<BlockKey<'_>> for BlockLocation {
    fn from(key: BlockKey<'_>) -> Self {
        Self::new(key.path, key.index)
    }
}

impl fmt::Display for BlockLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.path, self.index)
    }
}

/// A single block-level change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffOp {
    /// Block present in the target but not in the base.
    Add {
        /// Where the block goes.
        location: BlockLocation,
        /// New block content reference.
        block: BlockInfo,
    },
    /// Block present in the base but not in the target.
    Remove {
        /// Block to drop.
        location: BlockLocation,
    },
    /// Block present in both with different content.
    Modify {
        /// Block to replace.
        location: BlockLocation,
        /// New block content reference.
        block: BlockInfo,
    },
}

impl DiffOp {
    /// Location this operation touches.
    #[must_use]
    pub const fn location(&self) -> &BlockLocation {
        match self {
            Self::Add { location, .. } | Self::Remove { location } | Self::Modify { location, .. } => {
                location
            }
        }
    }

    /// New content the client has to fetch, if any.
    #[must_use]
    pub const fn block(&self) -> Option<&BlockInfo> {
        match self {
            Self::Add { block, .. } | Self::Modify { block, .. } => Some(block),
            Self::Remove { .. } => None,
        }
    }

    /// Check if this is an add operation.
    #[must_use]
    pub const fn is_add(&self) -> bool {
        matches!(self, Self::Add { .. })
    }

    /// Check if this is a remove operation.
    #[must_use]
    pub const fn is_remove(&self) -> bool {
        matches!(self, Self::Remove { .. })
    }

    /// Check if this is a modify operation.
    #[must_use]
    pub const fn is_modify(&self) -> bool {
        matches!(self, Self::Modify { .. })
    }
}

/// Edit script transforming one manifest into another.
///
/// Operations are sorted by location and touch each location at most once,
/// so equal inputs always produce byte-identical diffs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDiff {
    /// Block size shared by both manifests.
    pub max_block_size: u32,
    /// Checksum of the manifest the diff applies to.
    pub base_checksum: ManifestChecksum,
    /// Checksum of the manifest the diff produces.
    pub target_checksum: ManifestChecksum,
    /// Sequence of change operations.
    pub ops: Vec<DiffOp>,
}

impl ManifestDiff {
    /// Create a diff with no operations.
    #[must_use]
    pub const fn new(
        max_block_size: u32,
        base_checksum: ManifestChecksum,
        target_checksum: ManifestChecksum,
    ) -> Self {
        Self {
            max_block_size,
            base_checksum,
            target_checksum,
            ops: Vec::new(),
        }
    }

    /// Number of blocks touched (adds + removes + modifies).
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.ops.len()
    }

    /// Check if the diff changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Bytes of new block content the client has to fetch.
    #[must_use]
    pub fn bytes_to_fetch(&self) -> u64 {
        self.ops
            .iter()
            .filter_map(DiffOp::block)
            .map(|b| u64::from(b.size))
            .sum()
    }

    /// Distinct blocks to fetch, in operation order.
    #[must_use]
    pub fn blocks_to_fetch(&self) -> Vec<BlockInfo> {
        let mut seen = FxHashSet::default();
        self.ops
            .iter()
            .filter_map(DiffOp::block)
            .filter(|b| seen.insert(b.hash))
            .copied()
            .collect()
    }

    /// Encoded size of the diff on the wire.
    #[must_use]
    pub fn estimated_wire_size(&self) -> u64 {
        bincode::serialized_size(self).unwrap_or(u64::MAX)
    }

    /// Apply the diff to its base manifest.
    ///
    /// The base must match `base_checksum` and the result is verified
    /// against `target_checksum`.
    ///
    /// # Errors
    ///
    /// Returns `ChecksumMismatch` if either checksum disagrees, and
    /// `CorruptedDiff` if an operation does not fit the base (adding an
    /// existing block, removing or modifying a missing one, or leaving a
    /// gap in a file).
    pub fn apply(&self, base: &Manifest) -> Result<Manifest> {
        if base.max_block_size() != self.max_block_size {
            return Err(BuildSyncError::CorruptedDiff(format!(
                "block size {} does not match base block size {}",
                self.max_block_size,
                base.max_block_size()
            )));
        }
        ManifestChecksum::compute(base).verify(self.base_checksum)?;

        let mut files: BTreeMap<String, BTreeMap<u32, BlockInfo>> = base
            .blocks()
            .fold(BTreeMap::new(), |mut files, (key, block)| {
                files
                    .entry(key.path.to_string())
                    .or_insert_with(BTreeMap::new)
                    .insert(key.index, *block);
                files
            });

        for op in &self.ops {
            let location = op.location();
            match op {
                DiffOp::Add { block, .. } => {
                    let file = files.entry(location.path.clone()).or_default();
                    if file.insert(location.index, *block).is_some() {
                        return Err(corrupted("add of existing block", location));
                    }
                }
                DiffOp::Modify { block, .. } => {
                    let slot = files
                        .get_mut(&location.path)
                        .and_then(|file| file.get_mut(&location.index))
                        .ok_or_else(|| corrupted("modify of missing block", location))?;
                    *slot = *block;
                }
                DiffOp::Remove { .. } => {
                    files
                        .get_mut(&location.path)
                        .and_then(|file| file.remove(&location.index))
                        .ok_or_else(|| corrupted("remove of missing block", location))?;
                }
            }
        }

        let mut result = Manifest::new(self.max_block_size)?;
        for (path, blocks) in files {
            let contiguous = blocks
                .keys()
                .enumerate()
                .all(|(expected, &index)| index as usize == expected);
            if !contiguous {
                return Err(BuildSyncError::CorruptedDiff(format!(
                    "{path} has a gap in its blocks"
                )));
            }
            result.insert_file(&path, blocks.into_values().collect())?;
        }

        ManifestChecksum::compute(&result).verify(self.target_checksum)?;
        Ok(result)
    }
}

fn corrupted(what: &str, location: &BlockLocation) -> BuildSyncError {
    BuildSyncError::CorruptedDiff(format!("{what} at {location}"))
}

/// Summary counts for a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffStats {
    /// Blocks added.
    pub adds: usize,
    /// Blocks removed.
    pub removes: usize,
    /// Blocks modified.
    pub modifies: usize,
    /// Bytes of new content to fetch.
    pub bytes_to_fetch: u64,
    /// Distinct new blocks to fetch.
    pub unique_blocks_to_fetch: usize,
}

impl DiffStats {
    /// Compute statistics from a diff.
    #[must_use]
    pub fn from_diff(diff: &ManifestDiff) -> Self {
        Self {
            adds: diff.ops.iter().filter(|op| op.is_add()).count(),
            removes: diff.ops.iter().filter(|op| op.is_remove()).count(),
            modifies: diff.ops.iter().filter(|op| op.is_modify()).count(),
            bytes_to_fetch: diff.bytes_to_fetch(),
            unique_blocks_to_fetch: diff.blocks_to_fetch().len(),
        }
    }

    /// Total number of changes.
    #[must_use]
    pub const fn change_count(&self) -> usize {
        self.adds + self.removes + self.modifies
    }
}

/// Result of a diff with an upper bound on the number of changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOutcome {
    /// The diff stayed within the bound.
    Complete(ManifestDiff),
    /// More than `limit` changes were found; computation stopped early.
    LimitExceeded {
        /// The bound that was exceeded.
        limit: usize,
    },
}

/// Computes diffs between block sources.
///
/// # Example
///
/// ```rust
/// use buildsync::{DiffEngine, ManifestBuilder};
///
/// let mut old = ManifestBuilder::new(4096).unwrap();
/// old.add_file("game.bin").unwrap().process_block(b"v1").unwrap();
/// let old = old.build();
///
/// let mut new = ManifestBuilder::new(4096).unwrap();
/// new.add_file("game.bin").unwrap().process_block(b"v2").unwrap();
/// let new = new.build();
///
/// let diff = DiffEngine::new().diff(&old, &new);
/// assert_eq!(diff.change_count(), 1);
/// assert_eq!(diff.apply(&old).unwrap(), new);
/// ```
#[derive(Debug, Clone)]
pub struct DiffEngine {
    check_interval: usize,
}

impl DiffEngine {
    /// Blocks compared between cancellation checks by default.
    pub const DEFAULT_CHECK_INTERVAL: usize = 4096;

    /// Create an engine with the default cancellation check interval.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            check_interval: Self::DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Create an engine that checks for cancellation every `interval` blocks.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    #[must_use]
    pub fn with_check_interval(interval: usize) -> Self {
        assert!(interval > 0, "Check interval must be non-zero");
        Self {
            check_interval: interval,
        }
    }

    /// Configured cancellation check interval.
    #[must_use]
    pub const fn check_interval(&self) -> usize {
        self.check_interval
    }

    /// Compute the full diff from `source` to `target`.
    #[must_use]
    pub fn diff<S, T>(&self, source: &S, target: &T) -> ManifestDiff
    where
        S: BlockSource + ?Sized,
        T: BlockSource + ?Sized,
    {
        let checksums = (
            ManifestChecksum::compute(source),
            ManifestChecksum::compute(target),
        );
        match self.compute(source, target, checksums, None, None) {
            Ok(DiffOutcome::Complete(diff)) => diff,
            // neither a limit nor a cancellation flag was supplied
            Ok(DiffOutcome::LimitExceeded { .. }) | Err(_) => unreachable!(),
        }
    }

    /// Compute the diff unless it has more than `limit` changes.
    #[must_use]
    pub fn diff_bounded<S, T>(&self, source: &S, target: &T, limit: usize) -> DiffOutcome
    where
        S: BlockSource + ?Sized,
        T: BlockSource + ?Sized,
    {
        let checksums = (
            ManifestChecksum::compute(source),
            ManifestChecksum::compute(target),
        );
        self.compute(source, target, checksums, Some(limit), None)
            .unwrap_or(DiffOutcome::LimitExceeded { limit })
    }

    /// Compute the full diff, giving up once `cancel` is set.
    ///
    /// # Errors
    ///
    /// Returns `DiffInterrupted` if `cancel` was observed set.
    pub fn diff_interruptible<S, T>(
        &self,
        source: &S,
        target: &T,
        cancel: &AtomicBool,
    ) -> Result<ManifestDiff>
    where
        S: BlockSource + ?Sized,
        T: BlockSource + ?Sized,
    {
        let checksums = (
            ManifestChecksum::compute(source),
            ManifestChecksum::compute(target),
        );
        match self.compute(source, target, checksums, None, Some(cancel))? {
            DiffOutcome::Complete(diff) => Ok(diff),
            DiffOutcome::LimitExceeded { .. } => Err(BuildSyncError::DiffInterrupted),
        }
    }

    /// Key-based join shared by every entry point. Checksums come from the
    /// caller, which may have them cached per build.
    pub(crate) fn compute<S, T>(
        &self,
        source: &S,
        target: &T,
        (base_checksum, target_checksum): (ManifestChecksum, ManifestChecksum),
        limit: Option<usize>,
        cancel: Option<&AtomicBool>,
    ) -> Result<DiffOutcome>
    where
        S: BlockSource + ?Sized,
        T: BlockSource + ?Sized,
    {
        let exceeded = |changes: usize| limit.is_some_and(|limit| changes > limit);

        let mut remaining: FxHashMap<BlockKey<'_>, &BlockInfo> =
            FxHashMap::with_capacity_and_hasher(source.block_count(), FxBuildHasher);
        for (i, (key, block)) in source.blocks().enumerate() {
            self.checkpoint(i, cancel)?;
            remaining.insert(key, block);
        }

        let mut ops = Vec::new();
        for (i, (key, block)) in target.blocks().enumerate() {
            self.checkpoint(i, cancel)?;
            match remaining.remove(&key) {
                Some(old) if old == block => continue,
                Some(_) => ops.push(DiffOp::Modify {
                    location: key.into(),
                    block: *block,
                }),
                None => ops.push(DiffOp::Add {
                    location: key.into(),
                    block: *block,
                }),
            }
            if exceeded(ops.len()) {
                return Ok(DiffOutcome::LimitExceeded {
                    limit: limit.unwrap_or_default(),
                });
            }
        }

        if exceeded(ops.len() + remaining.len()) {
            return Ok(DiffOutcome::LimitExceeded {
                limit: limit.unwrap_or_default(),
            });
        }

        ops.extend(remaining.into_keys().map(|key| DiffOp::Remove {
            location: key.into(),
        }));
        ops.sort_unstable_by(|a, b| a.location().cmp(b.location()));

        Ok(DiffOutcome::Complete(ManifestDiff {
            max_block_size: target.max_block_size(),
            base_checksum,
            target_checksum,
            ops,
        }))
    }

    fn checkpoint(&self, step: usize, cancel: Option<&AtomicBool>) -> Result<()> {
        if let Some(cancel) = cancel {
            if step % self.check_interval == 0 && cancel.load(Ordering::Relaxed) {
                return Err(BuildSyncError::DiffInterrupted);
            }
        }
        Ok(())
    }
}

impl Default for DiffEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::BlockHash;

    fn block(seed: &[u8], size: u32) -> BlockInfo {
        BlockInfo::new(BlockHash::compute(seed), size)
    }

    fn manifest(files: &[(&str, &[&str])]) -> Manifest {
        let mut manifest = Manifest::new(4096).unwrap();
        for (path, seeds) in files {
            let blocks = seeds.iter().map(|seed| block(seed.as_bytes(), 4096)).collect();
            manifest.insert_file(path, blocks).unwrap();
        }
        manifest
    }

    // ==========================================================================
    // BLOCK LOCATION / OPS
    // ==========================================================================

    #[test]
    fn location_offset_and_display() {
        let location = BlockLocation::new("data/a.pak", 3);
        assert_eq!(location.offset(4096), 12288);
        assert_eq!(location.to_string(), "data/a.pak#3");
    }

    #[test]
    fn op_accessors() {
        let add = DiffOp::Add {
            location: BlockLocation::new("a", 0),
            block: block(b"x", 1),
        };
        let remove = DiffOp::Remove {
            location: BlockLocation::new("a", 1),
        };
        assert!(add.is_add());
        assert!(add.block().is_some());
        assert!(remove.is_remove());
        assert!(remove.block().is_none());
        assert_eq!(remove.location().index, 1);
    }

    // ==========================================================================
    // DIFF COMPUTATION
    // ==========================================================================

    #[test]
    fn diff_identical_is_empty() {
        let m = manifest(&[("a", &["1", "2"]), ("b", &["3"])]);
        let diff = DiffEngine::new().diff(&m, &m);
        assert!(diff.is_empty());
        assert_eq!(diff.change_count(), 0);
        assert_eq!(diff.base_checksum, diff.target_checksum);
    }

    #[test]
    fn diff_modified_block() {
        let old = manifest(&[("a", &["1", "2"])]);
        let new = manifest(&[("a", &["1", "X"])]);
        let diff = DiffEngine::new().diff(&old, &new);

        assert_eq!(diff.change_count(), 1);
        assert!(diff.ops[0].is_modify());
        assert_eq!(diff.ops[0].location(), &BlockLocation::new("a", 1));
    }

    #[test]
    fn diff_appended_and_truncated() {
        let short = manifest(&[("a", &["1"])]);
        let long = manifest(&[("a", &["1", "2", "3"])]);

        let grow = DiffEngine::new().diff(&short, &long);
        assert_eq!(grow.change_count(), 2);
        assert!(grow.ops.iter().all(DiffOp::is_add));

        let shrink = DiffEngine::new().diff(&long, &short);
        assert_eq!(shrink.change_count(), 2);
        assert!(shrink.ops.iter().all(DiffOp::is_remove));
    }

    #[test]
    fn diff_new_file_does_not_cascade() {
        let old = manifest(&[("a", &["1"]), ("c", &["3", "4"])]);
        let new = manifest(&[("a", &["1"]), ("b", &["2"]), ("c", &["3", "4"])]);
        let diff = DiffEngine::new().diff(&old, &new);

        assert_eq!(diff.change_count(), 1);
        assert_eq!(diff.ops[0], DiffOp::Add {
            location: BlockLocation::new("b", 0),
            block: block(b"2", 4096),
        });
    }

    #[test]
    fn diff_removed_file() {
        let old = manifest(&[("a", &["1"]), ("b", &["2", "3"])]);
        let new = manifest(&[("a", &["1"])]);
        let diff = DiffEngine::new().diff(&old, &new);

        let stats = DiffStats::from_diff(&diff);
        assert_eq!(stats.removes, 2);
        assert_eq!(stats.change_count(), 2);
        assert_eq!(stats.bytes_to_fetch, 0);
    }

    #[test]
    fn diff_size_change_is_modify() {
        let mut old = Manifest::new(4096).unwrap();
        old.insert_file("a", vec![block(b"1", 100)]).unwrap();
        let mut new = Manifest::new(4096).unwrap();
        new.insert_file("a", vec![block(b"1", 200)]).unwrap();

        let diff = DiffEngine::new().diff(&old, &new);
        assert_eq!(diff.change_count(), 1);
        assert!(diff.ops[0].is_modify());
    }

    #[test]
    fn diff_ops_sorted_by_location() {
        let old = manifest(&[("z", &["1"]), ("m", &["2", "3"])]);
        let new = manifest(&[("a", &["4"]), ("m", &["2", "5", "6"])]);
        let diff = DiffEngine::new().diff(&old, &new);

        let locations: Vec<&BlockLocation> = diff.ops.iter().map(DiffOp::location).collect();
        let mut sorted = locations.clone();
        sorted.sort();
        assert_eq!(locations, sorted);
        assert_eq!(diff.change_count(), 4);
    }

    #[test]
    fn diff_stats_counts() {
        let old = manifest(&[("a", &["1", "2"]), ("gone", &["g"])]);
        let new = manifest(&[("a", &["1", "X", "Y"]), ("dup", &["X"])]);
        let diff = DiffEngine::new().diff(&old, &new);
        let stats = DiffStats::from_diff(&diff);

        assert_eq!(stats.adds, 2);
        assert_eq!(stats.removes, 1);
        assert_eq!(stats.modifies, 1);
        assert_eq!(stats.bytes_to_fetch, 3 * 4096);
        assert_eq!(stats.unique_blocks_to_fetch, 2);
    }

    #[test]
    fn estimated_wire_size_grows_with_ops() {
        let old = manifest(&[("a", &["1"])]);
        let new = manifest(&[("a", &["2", "3"])]);
        let empty = DiffEngine::new().diff(&old, &old);
        let diff = DiffEngine::new().diff(&old, &new);

        assert!(diff.estimated_wire_size() > empty.estimated_wire_size());
        assert_eq!(
            diff.estimated_wire_size(),
            bincode::serialize(&diff).unwrap().len() as u64
        );
    }

    // ==========================================================================
    // BOUNDED / INTERRUPTIBLE
    // ==========================================================================

    #[test]
    fn bounded_within_limit() {
        let old = manifest(&[("a", &["1", "2", "3"])]);
        let new = manifest(&[("a", &["X", "Y", "Z"])]);

        match DiffEngine::new().diff_bounded(&old, &new, 3) {
            DiffOutcome::Complete(diff) => assert_eq!(diff.change_count(), 3),
            DiffOutcome::LimitExceeded { .. } => panic!("Expected complete diff"),
        }
    }

    #[test]
    fn bounded_exceeds_limit() {
        let old = manifest(&[("a", &["1", "2", "3"])]);
        let new = manifest(&[("a", &["X", "Y", "Z"])]);

        assert_eq!(
            DiffEngine::new().diff_bounded(&old, &new, 2),
            DiffOutcome::LimitExceeded { limit: 2 }
        );
    }

    #[test]
    fn bounded_counts_removals() {
        let old = manifest(&[("a", &["1"]), ("b", &["2"]), ("c", &["3"])]);
        let new = manifest(&[("a", &["1"])]);

        assert_eq!(
            DiffEngine::new().diff_bounded(&old, &new, 1),
            DiffOutcome::LimitExceeded { limit: 1 }
        );
    }

    #[test]
    fn bounded_zero_limit_identical() {
        let m = manifest(&[("a", &["1"])]);
        assert!(matches!(
            DiffEngine::new().diff_bounded(&m, &m, 0),
            DiffOutcome::Complete(_)
        ));
    }

    #[test]
    fn interruptible_completes_when_not_cancelled() {
        let old = manifest(&[("a", &["1"])]);
        let new = manifest(&[("a", &["2"])]);
        let cancel = AtomicBool::new(false);

        let diff = DiffEngine::with_check_interval(1)
            .diff_interruptible(&old, &new, &cancel)
            .unwrap();
        assert_eq!(diff.change_count(), 1);
    }

    #[test]
    fn interruptible_stops_when_cancelled() {
        let old = manifest(&[("a", &["1"])]);
        let new = manifest(&[("a", &["2"])]);
        let cancel = AtomicBool::new(true);

        let result = DiffEngine::with_check_interval(1).diff_interruptible(&old, &new, &cancel);
        assert!(matches!(result, Err(BuildSyncError::DiffInterrupted)));
    }

    #[test]
    #[should_panic(expected = "Check interval must be non-zero")]
    fn zero_check_interval_panics() {
        let _ = DiffEngine::with_check_interval(0);
    }

    // ==========================================================================
    // APPLY
    // ==========================================================================

    #[test]
    fn apply_reconstructs_target() {
        let old = manifest(&[("a", &["1", "2"]), ("b", &["3"])]);
        let new = manifest(&[("a", &["1"]), ("c", &["4", "5"])]);
        let diff = DiffEngine::new().diff(&old, &new);

        assert_eq!(diff.apply(&old).unwrap(), new);
    }

    #[test]
    fn apply_to_wrong_base_fails() {
        let old = manifest(&[("a", &["1"])]);
        let new = manifest(&[("a", &["2"])]);
        let other = manifest(&[("a", &["3"])]);
        let diff = DiffEngine::new().diff(&old, &new);

        assert!(matches!(
            diff.apply(&other),
            Err(BuildSyncError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn apply_rejects_block_size_mismatch() {
        let old = manifest(&[("a", &["1"])]);
        let diff = DiffEngine::new().diff(&old, &old);
        let other = Manifest::new(8192).unwrap();

        assert!(matches!(
            diff.apply(&other),
            Err(BuildSyncError::CorruptedDiff(_))
        ));
    }

    #[test]
    fn apply_rejects_add_of_existing() {
        let old = manifest(&[("a", &["1"])]);
        let mut diff = DiffEngine::new().diff(&old, &old);
        diff.ops.push(DiffOp::Add {
            location: BlockLocation::new("a", 0),
            block: block(b"2", 4096),
        });

        assert!(matches!(diff.apply(&old), Err(BuildSyncError::CorruptedDiff(_))));
    }

    #[test]
    fn apply_rejects_modify_of_missing() {
        let old = manifest(&[("a", &["1"])]);
        let mut diff = DiffEngine::new().diff(&old, &old);
        diff.ops.push(DiffOp::Modify {
            location: BlockLocation::new("b", 0),
            block: block(b"2", 4096),
        });

        assert!(matches!(diff.apply(&old), Err(BuildSyncError::CorruptedDiff(_))));
    }

    #[test]
    fn apply_rejects_gap() {
        let old = manifest(&[("a", &["1", "2"])]);
        let mut diff = DiffEngine::new().diff(&old, &old);
        diff.ops.push(DiffOp::Remove {
            location: BlockLocation::new("a", 0),
        });

        let err = diff.apply(&old).unwrap_err();
        assert!(err.to_string().contains("gap"));
    }

    #[test]
    fn apply_rejects_tampered_content() {
        let old = manifest(&[("a", &["1"])]);
        let new = manifest(&[("a", &["2"])]);
        let mut diff = DiffEngine::new().diff(&old, &new);
        diff.ops[0] = DiffOp::Modify {
            location: BlockLocation::new("a", 0),
            block: block(b"evil", 4096),
        };

        assert!(matches!(
            diff.apply(&old),
            Err(BuildSyncError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn diff_serde_roundtrip() {
        let old = manifest(&[("a", &["1"])]);
        let new = manifest(&[("a", &["2"]), ("b", &["3"])]);
        let diff = DiffEngine::new().diff(&old, &new);

        let bytes = bincode::serialize(&diff).unwrap();
        let restored: ManifestDiff = bincode::deserialize(&bytes).unwrap();
        assert_eq!(diff, restored);
    }
}
