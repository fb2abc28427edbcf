//! Read-only access to published builds.
//!
//! The resolution service only ever asks two questions of its backing
//! store: which build is current for a branch and target, and what a given
//! build contains. `Ok(None)` answers "no such build" and is an ordinary
//! outcome; `Err` means the backing store itself failed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::error::{BuildSyncError, Result};
use crate::manifest::Manifest;
use crate::types::{BranchId, BuildId, Target};

/// A build as published for a branch and target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedBuild {
    /// Identifier of the build.
    pub build_id: BuildId,
    /// Its immutable manifest.
    pub manifest: Arc<Manifest>,
}

/// Lookup of published manifests.
///
/// A successful [`ManifestStore::by_build_id`] must always return the
/// manifest originally published under that identifier.
pub trait ManifestStore: Send + Sync {
    /// Current build for a branch on one target.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the backing store cannot be read.
    fn latest(&self, branch: BranchId, target: Target) -> Result<Option<PublishedBuild>>;

    /// Manifest of a specific build.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the backing store cannot be read.
    fn by_build_id(&self, id: &BuildId) -> Result<Option<Arc<Manifest>>>;
}

impl<S: ManifestStore + ?Sized> ManifestStore for Arc<S> {
    fn latest(&self, branch: BranchId, target: Target) -> Result<Option<PublishedBuild>> {
        (**self).latest(branch, target)
    }

    fn by_build_id(&self, id: &BuildId) -> Result<Option<Arc<Manifest>>> {
        (**self).by_build_id(id)
    }
}

#[derive(Debug, Default)]
struct Catalog {
    builds: FxHashMap<BuildId, Arc<Manifest>>,
    latest: FxHashMap<(BranchId, Target), BuildId>,
}

/// Store kept entirely in memory.
///
/// Suited to tests and to embedding the service behind a publisher that
/// already holds its manifests.
///
/// # Example
///
/// ```rust
/// use buildsync::{BranchId, BuildId, InMemoryStore, Manifest, ManifestStore, Target};
///
/// let store = InMemoryStore::new();
/// let id = BuildId::new(b"build-1".to_vec());
/// store
///     .publish(BranchId::new(1), Target::LinuxX64, id.clone(), Manifest::new(4096).unwrap())
///     .unwrap();
///
/// let latest = store.latest(BranchId::new(1), Target::LinuxX64).unwrap().unwrap();
/// assert_eq!(latest.build_id, id);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    catalog: RwLock<Catalog>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a build's manifest.
    ///
    /// Registering the same content twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the identifier is already bound to a different
    /// manifest.
    pub fn insert_build(&self, id: BuildId, manifest: Manifest) -> Result<Arc<Manifest>> {
        let mut catalog = self.catalog.write();
        if let Some(existing) = catalog.builds.get(&id) {
            if **existing != manifest {
                return Err(BuildSyncError::Store(format!(
                    "build {id} is already published with different content"
                )));
            }
            return Ok(Arc::clone(existing));
        }
        let manifest = Arc::new(manifest);
        catalog.builds.insert(id, Arc::clone(&manifest));
        Ok(manifest)
    }

    /// Point a branch and target at an already registered build.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the build has not been registered.
    pub fn set_latest(&self, branch: BranchId, target: Target, id: BuildId) -> Result<()> {
        let mut catalog = self.catalog.write();
        if !catalog.builds.contains_key(&id) {
            return Err(BuildSyncError::Store(format!("unknown build {id}")));
        }
        catalog.latest.insert((branch, target), id);
        Ok(())
    }

    /// Register a build and make it current for a branch and target.
    ///
    /// # Errors
    ///
    /// See [`InMemoryStore::insert_build`].
    pub fn publish(
        &self,
        branch: BranchId,
        target: Target,
        id: BuildId,
        manifest: Manifest,
    ) -> Result<()> {
        self.insert_build(id.clone(), manifest)?;
        self.set_latest(branch, target, id)
    }

    /// Number of registered builds.
    #[must_use]
    pub fn build_count(&self) -> usize {
        self.catalog.read().builds.len()
    }
}

impl ManifestStore for InMemoryStore {
    fn latest(&self, branch: BranchId, target: Target) -> Result<Option<PublishedBuild>> {
        let catalog = self.catalog.read();
        Ok(catalog.latest.get(&(branch, target)).and_then(|id| {
            catalog.builds.get(id).map(|manifest| PublishedBuild {
                build_id: id.clone(),
                manifest: Arc::clone(manifest),
            })
        }))
    }

    fn by_build_id(&self, id: &BuildId) -> Result<Option<Arc<Manifest>>> {
        Ok(self.catalog.read().builds.get(id).cloned())
    }
}

/// File listing the current build per branch and target.
pub const RELEASES_FILE: &str = "releases.toml";

/// Directory holding one bincode manifest per build.
pub const BUILDS_DIR: &str = "builds";

/// Extension of manifest files under [`BUILDS_DIR`].
pub const MANIFEST_EXTENSION: &str = "manifest";

/// Longest build id, in bytes, a [`DirectoryStore`] can hold. Its hex file
/// name stays well under the 255-byte name limit of common filesystems.
pub const MAX_BUILD_ID_LEN: usize = 64;

#[derive(Debug, Default, Deserialize)]
struct Releases {
    #[serde(default, rename = "release")]
    releases: Vec<ReleaseEntry>,
}

#[derive(Debug, Deserialize)]
struct ReleaseEntry {
    branch: BranchId,
    target: Target,
    build: String,
}

/// Store backed by a directory written by a publisher.
///
/// Layout:
///
/// ```text
/// <root>/releases.toml           [[release]] branch, target, build (hex)
/// <root>/builds/<hex>.manifest   bincode-encoded Manifest
/// ```
///
/// `releases.toml` is re-read on every lookup so a publisher can move a
/// branch forward without restarting the server. When several entries name
/// the same branch and target, the last one wins. Manifests are immutable,
/// so each is loaded and validated once and then served from memory.
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    manifests: DashMap<BuildId, Arc<Manifest>>,
}

impl DirectoryStore {
    /// Open a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `Store` if `root` is not a directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(BuildSyncError::Store(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            root,
            manifests: DashMap::new(),
        })
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the manifest file for a build.
    #[must_use]
    pub fn manifest_path(&self, id: &BuildId) -> PathBuf {
        self.root
            .join(BUILDS_DIR)
            .join(format!("{}.{MANIFEST_EXTENSION}", id.to_hex()))
    }

    /// Number of manifests loaded so far.
    #[must_use]
    pub fn cached_manifests(&self) -> usize {
        self.manifests.len()
    }

    fn read_releases(&self) -> Result<Releases> {
        let path = self.root.join(RELEASES_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Releases::default()),
            Err(e) => return Err(store_failure(&path, &e)),
        };
        toml::from_str(&text).map_err(|e| store_failure(&path, &e))
    }

    fn load_manifest(&self, id: &BuildId) -> Result<Option<Manifest>> {
        let path = self.manifest_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_failure(&path, &e)),
        };
        let manifest: Manifest =
            bincode::deserialize(&bytes).map_err(|e| store_failure(&path, &e))?;
        manifest.validate().map_err(|e| store_failure(&path, &e))?;
        Ok(Some(manifest))
    }
}

fn store_failure(path: &Path, err: &dyn std::fmt::Display) -> BuildSyncError {
    tracing::warn!(path = %path.display(), error = %err, "manifest store read failed");
    BuildSyncError::Store(format!("{}: {err}", path.display()))
}

impl ManifestStore for DirectoryStore {
    fn latest(&self, branch: BranchId, target: Target) -> Result<Option<PublishedBuild>> {
        let releases = self.read_releases()?;
        let Some(entry) = releases
            .releases
            .iter()
            .rev()
            .find(|entry| entry.branch == branch && entry.target == target)
        else {
            return Ok(None);
        };

        let build_id: BuildId = entry.build.parse().map_err(|e| {
            store_failure(&self.root.join(RELEASES_FILE), &e)
        })?;
        let manifest = self.by_build_id(&build_id)?.ok_or_else(|| {
            BuildSyncError::Store(format!(
                "release {branch}/{target} names build {build_id} but its manifest is missing"
            ))
        })?;

        Ok(Some(PublishedBuild { build_id, manifest }))
    }

    fn by_build_id(&self, id: &BuildId) -> Result<Option<Arc<Manifest>>> {
        // ids that cannot name a manifest file are simply unknown
        if id.is_empty() || id.as_bytes().len() > MAX_BUILD_ID_LEN {
            return Ok(None);
        }
        if let Some(manifest) = self.manifests.get(id) {
            return Ok(Some(Arc::clone(manifest.value())));
        }
        let Some(manifest) = self.load_manifest(id)? else {
            return Ok(None);
        };
        let manifest = Arc::clone(
            self.manifests
                .entry(id.clone())
                .or_insert_with(|| Arc::new(manifest))
                .value(),
        );
        tracing::debug!(build = %id, blocks = manifest.block_count(), "loaded manifest");
        Ok(Some(manifest))
    }
}
