//! Build manifests: the block layout of every file in a build.
//!
//! A manifest maps each file path to the ordered list of blocks that make
//! up the file. Blocks are fixed-size slices of `max_block_size` bytes (the
//! last block of a file may be shorter), each identified by its content
//! hash. Files are kept in a sorted map so that enumeration order is
//! canonical and independent of how the manifest was assembled.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read};
use std::path::Path;

use rayon::prelude::*;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::diff::{DiffEngine, ManifestDiff};
use crate::error::{BuildSyncError, Result};
use crate::hash::BlockHash;

/// Smallest accepted `max_block_size`.
pub const MIN_BLOCK_SIZE: u32 = 4 * 1024;

/// Largest accepted `max_block_size`.
pub const MAX_BLOCK_SIZE: u32 = 64 * 1024 * 1024;

/// Block size used when none is configured.
pub const DEFAULT_BLOCK_SIZE: u32 = 1024 * 1024;

/// Metadata for a single block: content hash and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockInfo {
    /// BLAKE3 hash of the block bytes.
    pub hash: BlockHash,
    /// Block length in bytes.
    pub size: u32,
}

impl BlockInfo {
    /// Create block metadata from a known hash.
    #[must_use]
    pub const fn new(hash: BlockHash, size: u32) -> Self {
        Self { hash, size }
    }
}

/// Stable identity of a block: the file it belongs to and its position.
///
/// Since blocks are fixed-size, `index` is equivalent to the byte offset
/// `index * max_block_size` within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey<'a> {
    /// Normalized file path.
    pub path: &'a str,
    /// Block index within the file.
    pub index: u32,
}

/// Anything that can enumerate its blocks with a stable identity.
///
/// Checksumming and diffing only rely on this view of a manifest, so any
/// manifest representation can take part in them.
pub trait BlockSource {
    /// Upper bound on any block's size.
    fn max_block_size(&self) -> u32;

    /// Total number of blocks yielded by [`BlockSource::blocks`].
    fn block_count(&self) -> usize;

    /// Every block, ordered by path and then by index.
    fn blocks(&self) -> Box<dyn Iterator<Item = (BlockKey<'_>, &BlockInfo)> + '_>;
}

/// Block layout of a complete build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    max_block_size: u32,
    files: BTreeMap<String, Vec<BlockInfo>>,
}

impl Manifest {
    /// Create an empty manifest.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBlockSize` if `max_block_size` is out of range.
    pub fn new(max_block_size: u32) -> Result<Self> {
        validate_block_size(max_block_size)?;
        Ok(Self {
            max_block_size,
            files: BTreeMap::new(),
        })
    }

    /// Maximum size of any block in this manifest.
    #[must_use]
    pub const fn max_block_size(&self) -> u32 {
        self.max_block_size
    }

    /// Blocks of a single file.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<&[BlockInfo]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// All files in canonical (sorted) order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &[BlockInfo])> {
        self.files
            .iter()
            .map(|(path, blocks)| (path.as_str(), blocks.as_slice()))
    }

    /// Number of files.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Number of blocks across all files.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    /// Check if the manifest lists no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Size of one file in bytes.
    #[must_use]
    pub fn file_size(&self, path: &str) -> Option<u64> {
        self.file(path)
            .map(|blocks| blocks.iter().map(|b| u64::from(b.size)).sum())
    }

    /// Total space used by the files the manifest describes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files
            .values()
            .flatten()
            .map(|b| u64::from(b.size))
            .sum()
    }

    /// Distinct blocks, in order of first occurrence.
    ///
    /// Builds often repeat content (padding, duplicated assets), so this is
    /// the set a client actually has to fetch for a fresh install.
    #[must_use]
    pub fn unique_blocks(&self) -> Vec<BlockInfo> {
        let mut seen = FxHashSet::default();
        self.files
            .values()
            .flatten()
            .filter(|block| seen.insert(block.hash))
            .copied()
            .collect()
    }

    /// Insert or replace a file.
    ///
    /// A file with no blocks is not represented; inserting one removes any
    /// existing entry for the path.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPath` for a non-normalized path and `InvalidBlock`
    /// for a block outside `1..=max_block_size`.
    pub fn insert_file(&mut self, path: &str, blocks: Vec<BlockInfo>) -> Result<()> {
        let path = normalize_path(path)?;
        if blocks.is_empty() {
            self.files.remove(&path);
            return Ok(());
        }
        if u32::try_from(blocks.len()).is_err() {
            return Err(BuildSyncError::InvalidPath(format!(
                "{path} has too many blocks"
            )));
        }
        for block in &blocks {
            check_block(&path, block.size, self.max_block_size)?;
        }
        self.files.insert(path, blocks);
        Ok(())
    }

    /// Remove a file, returning its blocks.
    pub fn remove_file(&mut self, path: &str) -> Option<Vec<BlockInfo>> {
        self.files.remove(path)
    }

    /// Check invariants of a manifest obtained from an untrusted source.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        validate_block_size(self.max_block_size)?;
        for (path, blocks) in &self.files {
            if normalize_path(path)? != *path {
                return Err(BuildSyncError::InvalidPath(path.clone()));
            }
            if blocks.is_empty() {
                return Err(BuildSyncError::InvalidPath(format!("{path} has no blocks")));
            }
            for block in blocks {
                check_block(path, block.size, self.max_block_size)?;
            }
        }
        Ok(())
    }

    /// Compare an installed directory against this manifest.
    ///
    /// The returned diff transforms the installed state into this manifest;
    /// an empty diff means the installation is complete and intact.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be scanned.
    pub fn verify_installation(&self, root: &Path) -> Result<ManifestDiff> {
        let installed = scan_directory(root, self.max_block_size)?;
        Ok(DiffEngine::new().diff(&installed, self))
    }

    /// Bytes that still have to be written below `root` before every file
    /// exists at its final size. Existing files count toward their size.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if an existing file cannot be inspected.
    pub fn space_required(&self, root: &Path) -> Result<u64> {
        let mut required = 0u64;
        for (path, blocks) in &self.files {
            let size: u64 = blocks.iter().map(|b| u64::from(b.size)).sum();
            let existing = match fs::metadata(root.join(path)) {
                Ok(meta) if meta.is_file() => meta.len(),
                Ok(_) => 0,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
            };
            required += size.saturating_sub(existing);
        }
        Ok(required)
    }

    /// Create every file below `root` at its final size so blocks can be
    /// written in any order.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientSpace` if the volume holding `root` cannot fit
    /// the bytes still missing, or an I/O error if a file cannot be created.
    pub fn preallocate(&self, root: &Path) -> Result<()> {
        fs::create_dir_all(root)?;
        let available = available_space(root)?;
        self.preallocate_within(root, available)
    }

    fn preallocate_within(&self, root: &Path, available: Option<u64>) -> Result<()> {
        let required = self.space_required(root)?;
        if let Some(available) = available {
            if required > available {
                return Err(BuildSyncError::InsufficientSpace {
                    required,
                    available,
                });
            }
        }

        for (path, blocks) in &self.files {
            let full = root.join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            let size = blocks.iter().map(|b| u64::from(b.size)).sum();
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&full)?
                .set_len(size)?;
        }

        tracing::debug!(
            root = %root.display(),
            files = self.file_count(),
            required,
            "preallocated files"
        );
        Ok(())
    }
}

impl BlockSource for Manifest {
    fn max_block_size(&self) -> u32 {
        self.max_block_size
    }

    fn block_count(&self) -> usize {
        Manifest::block_count(self)
    }

    fn blocks(&self) -> Box<dyn Iterator<Item = (BlockKey<'_>, &BlockInfo)> + '_> {
        Box::new(self.files.iter().flat_map(|(path, blocks)| {
            blocks.iter().enumerate().map(move |(i, block)| {
                #[allow(clippy::cast_possible_truncation)] // bounded by insert_file
                let key = BlockKey {
                    path: path.as_str(),
                    index: i as u32,
                };
                (key, block)
            })
        }))
    }
}

/// Free bytes on the mounted volume that holds `root`, if it can be found.
fn available_space(root: &Path) -> Result<Option<u64>> {
    let root = root.canonicalize()?;
    let disks = sysinfo::Disks::new_with_refreshed_list();
    Ok(disks
        .list()
        .iter()
        .filter(|disk| root.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().components().count())
        .map(sysinfo::Disk::available_space))
}

/// Validate that a maximum block size is acceptable.
///
/// # Errors
///
/// Returns `InvalidBlockSize` unless the size is a power of two between
/// [`MIN_BLOCK_SIZE`] and [`MAX_BLOCK_SIZE`].
pub fn validate_block_size(size: u32) -> Result<()> {
    if !size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) {
        return Err(BuildSyncError::InvalidBlockSize(size));
    }
    Ok(())
}

/// Normalize a relative file path to the manifest's `/`-separated form.
///
/// # Errors
///
/// Returns `InvalidPath` for absolute paths and for empty, `.` or `..`
/// components.
pub fn normalize_path(path: &str) -> Result<String> {
    let unified = path.replace('\\', "/");
    if unified.is_empty() || unified.contains('\0') {
        return Err(BuildSyncError::InvalidPath(path.to_string()));
    }
    let valid = unified
        .split('/')
        .all(|component| !matches!(component, "" | "." | ".."));
    if !valid {
        return Err(BuildSyncError::InvalidPath(path.to_string()));
    }
    Ok(unified)
}

fn check_block(path: &str, size: u32, max: u32) -> Result<()> {
    if size == 0 || size > max {
        return Err(BuildSyncError::InvalidBlock {
            path: path.to_string(),
            size,
            max,
        });
    }
    Ok(())
}

/// Builder for [`Manifest`].
///
/// # Example
///
/// ```rust
/// use buildsync::ManifestBuilder;
///
/// let mut builder = ManifestBuilder::new(4096).unwrap();
/// builder.add_file("bin/game").unwrap().process_block(b"\x7fELF").unwrap();
/// let manifest = builder.build();
/// assert_eq!(manifest.file_count(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    max_block_size: u32,
    files: BTreeMap<String, FileBuilder>,
}

impl ManifestBuilder {
    /// Create a builder for manifests with the given block size.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBlockSize` if the size is out of range.
    pub fn new(max_block_size: u32) -> Result<Self> {
        validate_block_size(max_block_size)?;
        Ok(Self {
            max_block_size,
            files: BTreeMap::new(),
        })
    }

    /// Get the builder for a file, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPath` if the path is not a normalized relative path.
    pub fn add_file(&mut self, path: &str) -> Result<&mut FileBuilder> {
        let path = normalize_path(path)?;
        let max_block_size = self.max_block_size;
        Ok(self
            .files
            .entry(path.clone())
            .or_insert_with(|| FileBuilder::new(path, max_block_size)))
    }

    /// Build the manifest. Files without blocks are dropped.
    #[must_use]
    pub fn build(self) -> Manifest {
        let files = self
            .files
            .into_iter()
            .filter(|(_, file)| !file.blocks.is_empty())
            .map(|(path, file)| (path, file.blocks))
            .collect();
        Manifest {
            max_block_size: self.max_block_size,
            files,
        }
    }
}

/// Builder for a single file's block list.
#[derive(Debug, Clone)]
pub struct FileBuilder {
    path: String,
    max_block_size: u32,
    blocks: Vec<BlockInfo>,
}

impl FileBuilder {
    fn new(path: String, max_block_size: u32) -> Self {
        Self {
            path,
            max_block_size,
            blocks: Vec::new(),
        }
    }

    /// Path of the file being built.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Blocks appended so far.
    #[must_use]
    pub fn blocks(&self) -> &[BlockInfo] {
        &self.blocks
    }

    /// Append block metadata to the end of the file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBlock` if the block is empty or larger than the
    /// manifest's maximum block size.
    pub fn append_block(&mut self, block: BlockInfo) -> Result<()> {
        check_block(&self.path, block.size, self.max_block_size)?;
        self.blocks.push(block);
        Ok(())
    }

    /// Hash the next block of the file and append it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBlock` if `data` is empty or too large.
    pub fn process_block(&mut self, data: &[u8]) -> Result<BlockInfo> {
        let size = u32::try_from(data.len()).unwrap_or(u32::MAX);
        check_block(&self.path, size, self.max_block_size)?;
        let block = BlockInfo::new(BlockHash::compute(data), size);
        self.blocks.push(block);
        Ok(block)
    }

    /// Split a stream into blocks and append them all.
    ///
    /// Returns the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if reading fails.
    pub fn process_reader<R: Read>(&mut self, reader: &mut R) -> Result<u64> {
        let block_size = u64::from(self.max_block_size);
        let mut total = 0u64;

        loop {
            let mut chunk = reader.by_ref().take(block_size);
            let hash = BlockHash::compute_streaming(&mut chunk)?;
            let len = block_size - chunk.limit();
            if len == 0 {
                break;
            }

            // len never exceeds max_block_size
            self.append_block(BlockInfo::new(hash, len as u32))?;
            total += len;

            if len < block_size {
                break;
            }
        }

        Ok(total)
    }
}

/// Build a manifest describing every regular file below `root`.
///
/// Files are hashed in parallel. Symlinks are not followed and empty files
/// are not represented.
///
/// # Errors
///
/// Returns an error if the directory cannot be walked, a file cannot be
/// read, or a path is not valid UTF-8.
pub fn scan_directory(root: &Path, max_block_size: u32) -> Result<Manifest> {
    validate_block_size(max_block_size)?;

    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| BuildSyncError::InvalidPath(entry.path().display().to_string()))?;
        let components: Option<Vec<&str>> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect();
        let path = components
            .ok_or_else(|| BuildSyncError::InvalidPath(relative.display().to_string()))?
            .join("/");
        entries.push((path, entry.into_path()));
    }

    let files: Vec<(String, Vec<BlockInfo>)> = entries
        .into_par_iter()
        .map(|(path, absolute)| -> Result<(String, Vec<BlockInfo>)> {
            let mut file = FileBuilder::new(path, max_block_size);
            let mut reader = BufReader::new(File::open(&absolute)?);
            file.process_reader(&mut reader)?;
            Ok((file.path, file.blocks))
        })
        .collect::<Result<_>>()?;

    let mut manifest = Manifest::new(max_block_size)?;
    for (path, blocks) in files {
        manifest.insert_file(&path, blocks)?;
    }

    tracing::debug!(
        root = %root.display(),
        files = manifest.file_count(),
        blocks = manifest.block_count(),
        "scanned directory"
    );

    Ok(manifest)
}
