//! Latest-build resolution.
//!
//! [`BuildResolutionService`] answers a [`BuildRequest`] with the latest
//! build of a branch and whichever payload brings the client up to date
//! most cheaply. Rules, first match wins:
//!
//! 1. No local build: full manifest.
//! 2. Local build unknown to the store: full manifest.
//! 3. Local manifest checksum equals the latest: no payload.
//! 4. Diff within `diff_change_threshold` changes: the diff.
//! 5. Otherwise: full manifest.
//!
//! Resolution writes nothing shared except the optional checksum cache, so
//! one service can serve any number of threads.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::checksum::{ChecksumCache, ManifestChecksum};
use crate::diff::{DiffEngine, DiffOutcome};
use crate::error::{BuildSyncError, Result};
use crate::manifest::Manifest;
use crate::request::{BuildPayload, BuildRequest, BuildResponse};
use crate::store::{ManifestStore, PublishedBuild};
use crate::types::{BuildId, Target};

/// The single operation exposed to clients.
pub trait BuildResolver: Send + Sync {
    /// Resolve the latest build for a request.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for malformed requests, `BuildNotFound` if
    /// no requested target has a published build, and `Store` if the
    /// backing store fails.
    fn get_latest_build(&self, request: &BuildRequest) -> Result<BuildResponse>;
}

impl<R: BuildResolver + ?Sized> BuildResolver for Arc<R> {
    fn get_latest_build(&self, request: &BuildRequest) -> Result<BuildResponse> {
        (**self).get_latest_build(request)
    }
}

/// Configuration for resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Largest diff, in changed blocks, sent instead of a full manifest.
    pub diff_change_threshold: usize,
    /// Cache manifest checksums per build.
    pub cache_checksums: bool,
    /// Blocks compared between cancellation checks while diffing.
    pub diff_check_interval: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            diff_change_threshold: 2048,
            cache_checksums: true,
            diff_check_interval: DiffEngine::DEFAULT_CHECK_INTERVAL,
        }
    }
}

impl ServiceConfig {
    /// Check values that have no sensible meaning.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `diff_check_interval` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.diff_check_interval == 0 {
            return Err(BuildSyncError::Config(
                "diff_check_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`BuildResolutionService`].
///
/// # Example
///
/// ```rust
/// use buildsync::{InMemoryStore, ServiceBuilder};
///
/// let service = ServiceBuilder::new()
///     .diff_change_threshold(64)
///     .cache_checksums(false)
///     .build(InMemoryStore::new());
/// assert_eq!(service.config().diff_change_threshold, 64);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ServiceBuilder {
    config: ServiceConfig,
}

impl ServiceBuilder {
    /// Create a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    #[must_use]
    pub fn with_config(config: ServiceConfig) -> Self {
        Self { config }
    }

    /// Set the largest diff sent instead of a full manifest.
    #[must_use]
    pub fn diff_change_threshold(mut self, threshold: usize) -> Self {
        self.config.diff_change_threshold = threshold;
        self
    }

    /// Enable or disable the per-build checksum cache.
    #[must_use]
    pub fn cache_checksums(mut self, enabled: bool) -> Self {
        self.config.cache_checksums = enabled;
        self
    }

    /// Set how many blocks are compared between cancellation checks.
    ///
    /// Zero means the default, see [`BuildResolutionService::with_config`].
    #[must_use]
    pub fn diff_check_interval(mut self, interval: usize) -> Self {
        self.config.diff_check_interval = interval;
        self
    }

    /// Build the service over a store.
    #[must_use]
    pub fn build<S: ManifestStore>(self, store: S) -> BuildResolutionService<S> {
        BuildResolutionService::with_config(store, self.config)
    }
}

/// Which decision rule produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// No local build was given.
    FreshInstall,
    /// The local build is not known to the store.
    UnknownLocalBuild,
    /// The client already has the latest content.
    UpToDate,
    /// A diff within the threshold was sent.
    Diff {
        /// Blocks touched by the diff.
        changes: usize,
    },
    /// The diff exceeded the threshold and a full manifest was sent.
    DiffTooLarge {
        /// Threshold that was exceeded.
        limit: usize,
    },
    /// The builds use different block sizes, so no diff can apply and a
    /// full manifest was sent.
    BlockSizeChanged {
        /// Block size of the local build.
        from: u32,
        /// Block size of the latest build.
        to: u32,
    },
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FreshInstall => f.write_str("fresh-install"),
            Self::UnknownLocalBuild => f.write_str("unknown-local-build"),
            Self::UpToDate => f.write_str("up-to-date"),
            Self::Diff { changes } => write!(f, "diff({changes})"),
            Self::DiffTooLarge { limit } => write!(f, "diff-too-large(>{limit})"),
            Self::BlockSizeChanged { from, to } => write!(f, "block-size-changed({from}->{to})"),
        }
    }
}

/// Resolves requests against a [`ManifestStore`].
#[derive(Debug)]
pub struct BuildResolutionService<S> {
    store: S,
    config: ServiceConfig,
    engine: DiffEngine,
    checksums: Option<ChecksumCache>,
}

impl<S: ManifestStore> BuildResolutionService<S> {
    /// Create a service with default configuration.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self::with_config(store, ServiceConfig::default())
    }

    /// Create a service with a custom configuration.
    ///
    /// A zero `diff_check_interval` is replaced by the default, so the
    /// stored configuration always passes [`ServiceConfig::validate`].
    #[must_use]
    pub fn with_config(store: S, mut config: ServiceConfig) -> Self {
        if config.diff_check_interval == 0 {
            config.diff_check_interval = DiffEngine::DEFAULT_CHECK_INTERVAL;
        }
        let engine = DiffEngine::with_check_interval(config.diff_check_interval);
        let checksums = config.cache_checksums.then(ChecksumCache::new);
        Self {
            store,
            config,
            engine,
            checksums,
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Backing store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Checksum cache, when enabled.
    #[must_use]
    pub const fn checksum_cache(&self) -> Option<&ChecksumCache> {
        self.checksums.as_ref()
    }

    /// Resolve a request, also reporting which rule applied.
    ///
    /// # Errors
    ///
    /// See [`BuildResolver::get_latest_build`].
    pub fn resolve(&self, request: &BuildRequest) -> Result<(BuildResponse, Resolution)> {
        request.validate()?;

        let (target, latest) = self.resolve_latest(request)?;
        let latest_checksum = self.checksum(&latest.build_id, &latest.manifest);

        let (payload, resolution) = match request.local_build_id() {
            None => (
                BuildPayload::Manifest(Arc::clone(&latest.manifest)),
                Resolution::FreshInstall,
            ),
            // build ids name immutable manifests
            Some(local_id) if *local_id == latest.build_id => {
                (BuildPayload::UpToDate, Resolution::UpToDate)
            }
            Some(local_id) => match self.store.by_build_id(local_id)? {
                None => (
                    BuildPayload::Manifest(Arc::clone(&latest.manifest)),
                    Resolution::UnknownLocalBuild,
                ),
                Some(local) => self.compare(local_id, &local, &latest.manifest, latest_checksum)?,
            },
        };

        tracing::debug!(
            branch = %request.branch_id,
            platform = %target,
            build = %latest.build_id,
            checksum = %latest_checksum,
            resolution = %resolution,
            "resolved latest build"
        );

        let response = BuildResponse {
            build_id: latest.build_id,
            manifest_checksum: latest_checksum,
            payload,
        };
        Ok((response, resolution))
    }

    /// First requested target with a published build, in request order.
    fn resolve_latest(&self, request: &BuildRequest) -> Result<(Target, PublishedBuild)> {
        for &target in &request.targets {
            if let Some(latest) = self.store.latest(request.branch_id, target)? {
                return Ok((target, latest));
            }
        }
        Err(BuildSyncError::BuildNotFound {
            branch: request.branch_id,
            targets: request.targets.clone(),
        })
    }

    fn compare(
        &self,
        local_id: &BuildId,
        local: &Manifest,
        latest: &Arc<Manifest>,
        latest_checksum: ManifestChecksum,
    ) -> Result<(BuildPayload, Resolution)> {
        let local_checksum = self.checksum(local_id, local);
        if local_checksum == latest_checksum {
            return Ok((BuildPayload::UpToDate, Resolution::UpToDate));
        }
        // block indices only line up between equal block sizes
        if local.max_block_size() != latest.max_block_size() {
            return Ok((
                BuildPayload::Manifest(Arc::clone(latest)),
                Resolution::BlockSizeChanged {
                    from: local.max_block_size(),
                    to: latest.max_block_size(),
                },
            ));
        }

        let limit = self.config.diff_change_threshold;
        let outcome = self.engine.compute(
            local,
            &**latest,
            (local_checksum, latest_checksum),
            Some(limit),
            None,
        )?;

        Ok(match outcome {
            DiffOutcome::Complete(diff) => {
                let changes = diff.change_count();
                (BuildPayload::Diff(diff), Resolution::Diff { changes })
            }
            DiffOutcome::LimitExceeded { limit } => (
                BuildPayload::Manifest(Arc::clone(latest)),
                Resolution::DiffTooLarge { limit },
            ),
        })
    }

    fn checksum(&self, id: &BuildId, manifest: &Manifest) -> ManifestChecksum {
        match &self.checksums {
            Some(cache) => cache.get_or_compute(id, manifest),
            None => ManifestChecksum::compute(manifest),
        }
    }
}

impl<S: ManifestStore> BuildResolver for BuildResolutionService<S> {
    fn get_latest_build(&self, request: &BuildRequest) -> Result<BuildResponse> {
        self.resolve(request).map(|(response, _)| response)
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::hash::BlockHash;
    use crate::manifest::BlockInfo;
    use crate::store::InMemoryStore;
    use crate::types::BranchId;
    use proptest::prelude::*;

    fn manifest_strategy() -> impl Strategy<Value = Manifest> {
        (
            prop::sample::select(vec![4096u32, 8192, 65536]),
            prop::collection::btree_map(
                "[a-c]{1,2}",
                prop::collection::vec((0u8..5, 1u32..=4096), 1..5),
                0..5,
            ),
        )
            .prop_map(|(block_size, files)| {
                let mut manifest = Manifest::new(block_size).unwrap();
                for (path, blocks) in files {
                    let blocks = blocks
                        .into_iter()
                        .map(|(seed, size)| BlockInfo::new(BlockHash::compute(&[seed]), size))
                        .collect();
                    manifest.insert_file(&path, blocks).unwrap();
                }
                manifest
            })
    }

    proptest! {
        /// Whatever the service sends, the client rebuilds the latest manifest
        #[test]
        fn every_response_reconstructs(
            local in manifest_strategy(),
            latest in manifest_strategy(),
            threshold in 0usize..16,
        ) {
            let store = InMemoryStore::new();
            store.insert_build(BuildId::new(vec![1]), local.clone()).unwrap();
            store
                .publish(BranchId::new(1), Target::LinuxX64, BuildId::new(vec![2]), latest.clone())
                .unwrap();
            let service = ServiceBuilder::new().diff_change_threshold(threshold).build(store);

            let request = BuildRequest::new(BranchId::new(1), [Target::LinuxX64])
                .with_local_build(BuildId::new(vec![1]));
            let response = service.get_latest_build(&request).unwrap();

            prop_assert_eq!(response.reconstruct(Some(&local)).unwrap(), latest);
        }
    }
}
