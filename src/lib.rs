//! # Buildsync
//!
//! Latest-build resolution for build distribution.
//!
//! A client names a branch, the targets it can run, and the build it has
//! installed. The service answers with the latest build of that branch and
//! either nothing (already current), a block-level diff from the installed
//! build, or the complete manifest.
//!
//! ## Features
//!
//! - **Manifests**: files split into fixed-size BLAKE3-hashed blocks
//! - **Checksums**: one 64-bit fingerprint per manifest for integrity checks
//! - **Diffs**: add/remove/modify operations keyed by block location
//! - **Serving**: framed bincode protocol over TCP with tokio
//!
//! ## Example
//!
//! ```rust
//! use buildsync::{
//!     BlockHash, BlockInfo, BranchId, BuildId, BuildRequest, InMemoryStore, Manifest,
//!     ServiceBuilder, Target,
//! };
//!
//! let block = |seed: &[u8]| BlockInfo::new(BlockHash::compute(seed), 4096);
//!
//! let mut installed = Manifest::new(4096).unwrap();
//! installed.insert_file("game.pak", vec![block(b"a"), block(b"b")]).unwrap();
//!
//! let mut latest = Manifest::new(4096).unwrap();
//! latest.insert_file("game.pak", vec![block(b"a"), block(b"c")]).unwrap();
//!
//! let store = InMemoryStore::new();
//! store.insert_build(BuildId::new(vec![1]), installed.clone()).unwrap();
//! store
//!     .publish(BranchId::new(7), Target::WindowsX64, BuildId::new(vec![2]), latest.clone())
//!     .unwrap();
//!
//! let service = ServiceBuilder::new().build(store);
//! let request = BuildRequest::new(BranchId::new(7), [Target::WindowsX64])
//!     .with_local_build(BuildId::new(vec![1]));
//!
//! let response = service.resolve(&request).unwrap().0;
//! assert_eq!(response.manifest_diff().unwrap().change_count(), 1);
//! assert_eq!(response.reconstruct(Some(&installed)).unwrap(), latest);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

#[cfg(feature = "async")]
pub mod async_service;
mod checksum;
mod config;
mod diff;
mod error;
mod hash;
mod manifest;
mod protocol;
mod request;
mod service;
mod store;
mod types;

pub use checksum::{ChecksumCache, ManifestChecksum};
pub use config::{Config, LoggingConfig, ServerConfig};
pub use diff::{BlockLocation, DiffEngine, DiffOp, DiffOutcome, DiffStats, ManifestDiff};
pub use error::{BuildSyncError, Result};
pub use hash::BlockHash;
pub use manifest::{
    normalize_path, scan_directory, validate_block_size, BlockInfo, BlockKey, BlockSource,
    FileBuilder, Manifest, ManifestBuilder, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
};
#[cfg(feature = "async")]
pub use protocol::{read_message_async, write_message_async};
pub use protocol::{
    respond, Codec, FrameHeader, Message, MessageType, MAX_PAYLOAD_SIZE, PROTOCOL_MAGIC,
    PROTOCOL_VERSION,
};
pub use request::{BuildPayload, BuildRequest, BuildResponse};
pub use service::{
    BuildResolutionService, BuildResolver, Resolution, ServiceBuilder, ServiceConfig,
};
pub use store::{
    DirectoryStore, InMemoryStore, ManifestStore, PublishedBuild, BUILDS_DIR,
    MANIFEST_EXTENSION, MAX_BUILD_ID_LEN, RELEASES_FILE,
};
pub use types::{BranchId, BuildId, Target};
