//! Request and response contract of `GetLatestBuild`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::checksum::ManifestChecksum;
use crate::diff::ManifestDiff;
use crate::error::{BuildSyncError, Result};
use crate::manifest::Manifest;
use crate::types::{BranchId, BuildId, Target};

/// Request for the latest build of a branch.
///
/// # Example
///
/// ```rust
/// use buildsync::{BranchId, BuildId, BuildRequest, Target};
///
/// let request = BuildRequest::new(BranchId::new(1), [Target::WindowsX64, Target::WindowsX86])
///     .with_local_build(BuildId::new(vec![0x2a]));
/// assert!(request.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Branch to resolve. `0` is invalid.
    pub branch_id: BranchId,
    /// Acceptable targets in order of preference. Must not be empty.
    pub targets: Vec<Target>,
    /// Build the client has installed, if any.
    pub local_build_id: Option<BuildId>,
}

impl BuildRequest {
    /// Request for a fresh install.
    #[must_use]
    pub fn new(branch_id: BranchId, targets: impl IntoIterator<Item = Target>) -> Self {
        Self {
            branch_id,
            targets: targets.into_iter().collect(),
            local_build_id: None,
        }
    }

    /// Declare the build the client currently has.
    #[must_use]
    pub fn with_local_build(mut self, id: BuildId) -> Self {
        self.local_build_id = Some(id);
        self
    }

    /// Local build, treating an empty identifier as absent.
    #[must_use]
    pub fn local_build_id(&self) -> Option<&BuildId> {
        self.local_build_id.as_ref().filter(|id| !id.is_empty())
    }

    /// Reject requests that cannot be resolved.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the branch is unset or no target is given.
    pub fn validate(&self) -> Result<()> {
        if self.branch_id.is_unset() {
            return Err(BuildSyncError::InvalidRequest(
                "branch_id is required".to_string(),
            ));
        }
        if self.targets.is_empty() {
            return Err(BuildSyncError::InvalidRequest(
                "at least one target is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a response carries besides the build identity.
///
/// Exactly one case applies, so a response can never hold both a manifest
/// and a diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildPayload {
    /// The client already has the latest build.
    UpToDate,
    /// The complete latest manifest.
    Manifest(Arc<Manifest>),
    /// Changes from the client's build to the latest one.
    Diff(ManifestDiff),
}

impl BuildPayload {
    /// Short name for logs and CLI output.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UpToDate => "up-to-date",
            Self::Manifest(_) => "manifest",
            Self::Diff(_) => "diff",
        }
    }
}

/// Answer to a [`BuildRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResponse {
    /// Latest build of the branch on the resolved target.
    pub build_id: BuildId,
    /// Checksum of the latest manifest.
    pub manifest_checksum: ManifestChecksum,
    /// Manifest, diff, or nothing.
    pub payload: BuildPayload,
}

impl BuildResponse {
    /// Full manifest, if the response carries one.
    #[must_use]
    pub fn manifest(&self) -> Option<&Manifest> {
        match &self.payload {
            BuildPayload::Manifest(manifest) => Some(manifest.as_ref()),
            _ => None,
        }
    }

    /// Diff, if the response carries one.
    #[must_use]
    pub fn manifest_diff(&self) -> Option<&ManifestDiff> {
        match &self.payload {
            BuildPayload::Diff(diff) => Some(diff),
            _ => None,
        }
    }

    /// Whether the client is already current.
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        matches!(self.payload, BuildPayload::UpToDate)
    }

    /// Produce the latest manifest on the client side.
    ///
    /// `local` is the manifest of the build named in the request. The
    /// result is always checked against `manifest_checksum`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the payload needs a local manifest and
    /// none was given, `ChecksumMismatch` if the result does not match, and
    /// `CorruptedDiff` if the diff does not apply.
    pub fn reconstruct(&self, local: Option<&Manifest>) -> Result<Manifest> {
        let manifest = match &self.payload {
            BuildPayload::Manifest(manifest) => Manifest::clone(manifest),
            BuildPayload::UpToDate => local.cloned().ok_or_else(|| {
                BuildSyncError::InvalidRequest(
                    "up-to-date response needs the local manifest".to_string(),
                )
            })?,
            BuildPayload::Diff(diff) => {
                diff.target_checksum.verify(self.manifest_checksum)?;
                let base = local.ok_or_else(|| {
                    BuildSyncError::InvalidRequest(
                        "diff response needs the local manifest".to_string(),
                    )
                })?;
                diff.apply(base)?
            }
        };
        ManifestChecksum::compute(&manifest).verify(self.manifest_checksum)?;
        Ok(manifest)
    }

    /// Encode for transport.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| BuildSyncError::ProtocolError(format!("Failed to encode response: {e}")))
    }

    /// Decode from transport bytes.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if deserialization fails.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| BuildSyncError::ProtocolError(format!("Failed to decode response: {e}")))
    }
}
