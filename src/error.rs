//! Error types for buildsync operations.

use thiserror::Error;

use crate::types::{BranchId, Target};

/// Errors that can occur while resolving, diffing, or transporting builds.
#[derive(Error, Debug)]
pub enum BuildSyncError {
    /// I/O error during read/write operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The request was malformed and rejected before any lookup.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No published build exists for the branch on any requested target.
    #[error("No published build for branch {branch} on targets {targets:?}")]
    BuildNotFound {
        /// Requested branch.
        branch: BranchId,
        /// Targets that were tried, in request order.
        targets: Vec<Target>,
    },

    /// The backing manifest store failed. Callers may retry.
    #[error("Manifest store failure: {0}")]
    Store(String),

    /// Invalid maximum block size for a manifest.
    #[error("Invalid block size: {0} (must be power of 2, 4096-67108864)")]
    InvalidBlockSize(u32),

    /// A block does not fit the manifest's block size bounds.
    #[error("Invalid block in {path}: size {size} (must be 1-{max})")]
    InvalidBlock {
        /// File the block belongs to.
        path: String,
        /// Offending block size.
        size: u32,
        /// Manifest maximum block size.
        max: u32,
    },

    /// A manifest path is not a normalized relative path.
    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    /// Manifest checksum did not match the expected value.
    #[error("Checksum mismatch: expected {expected:016x}, got {actual:016x}")]
    ChecksumMismatch {
        /// Expected checksum
        expected: u64,
        /// Actual computed checksum
        actual: u64,
    },

    /// A diff could not be applied to the given base manifest.
    #[error("Corrupted diff: {0}")]
    CorruptedDiff(String),

    /// Diff computation was cancelled between comparison steps.
    #[error("Diff computation interrupted")]
    DiffInterrupted,

    /// The target volume cannot hold the files being installed.
    #[error("Insufficient disk space: {required} bytes required, {available} available")]
    InsufficientSpace {
        /// Bytes still to be written.
        required: u64,
        /// Free bytes on the volume.
        available: u64,
    },

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol error during network operations.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// A background task failed before producing a result.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Error reported by a remote server.
    #[error("Remote error {code}: {message}")]
    Remote {
        /// Wire error code.
        code: u32,
        /// Server-provided message.
        message: String,
    },
}

impl BuildSyncError {
    /// Wire code for client input errors.
    pub const CODE_INVALID_REQUEST: u32 = 400;
    /// Wire code for a branch/target without a published build.
    pub const CODE_NOT_FOUND: u32 = 404;
    /// Wire code for internal failures.
    pub const CODE_INTERNAL: u32 = 500;
    /// Wire code for retryable backing failures.
    pub const CODE_UNAVAILABLE: u32 = 503;

    /// Whether the caller may retry the same request unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(_) | Self::Io(_) => true,
            Self::Remote { code, .. } => *code == Self::CODE_UNAVAILABLE,
            _ => false,
        }
    }

    /// Whether this is the distinct "no published build" condition.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::BuildNotFound { .. } => true,
            Self::Remote { code, .. } => *code == Self::CODE_NOT_FOUND,
            _ => false,
        }
    }

    /// Code used when reporting this error over the wire.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidRequest(_) => Self::CODE_INVALID_REQUEST,
            Self::BuildNotFound { .. } => Self::CODE_NOT_FOUND,
            Self::Store(_) | Self::Io(_) => Self::CODE_UNAVAILABLE,
            Self::Remote { code, .. } => *code,
            _ => Self::CODE_INTERNAL,
        }
    }
}

/// Result type for buildsync operations.
pub type Result<T> = std::result::Result<T, BuildSyncError>;
