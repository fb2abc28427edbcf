//! Block content hash using BLAKE3.
//!
//! Every block a manifest lists is identified by the BLAKE3 digest of its
//! bytes. Clients fetch blocks by this hash, so it doubles as the content
//! reference carried by diff operations.

use std::io::Read;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BuildSyncError;

/// Content hash of a single block.
///
/// # Example
///
/// ```rust
/// use buildsync::BlockHash;
///
/// let hash1 = BlockHash::compute(b"hello world");
/// let hash2 = BlockHash::compute(b"hello world");
/// assert_eq!(hash1, hash2);
///
/// let hash3 = BlockHash::compute(b"different data");
/// assert_ne!(hash1, hash3);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockHash([u8; 32]);

impl BlockHash {
    /// Compute the BLAKE3 hash of a block.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        Self(*hash.as_bytes())
    }

    /// Hash everything a reader yields until end of stream.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if reading fails.
    ///
    /// # Example
    ///
    /// ```rust
    /// use buildsync::BlockHash;
    /// use std::io::Cursor;
    ///
    /// let data = b"streaming data";
    /// let hash = BlockHash::compute_streaming(&mut Cursor::new(data)).unwrap();
    /// assert_eq!(hash, BlockHash::compute(data));
    /// ```
    pub fn compute_streaming<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut hasher = blake3::Hasher::new();
        let mut buffer = [0u8; 8192];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(Self(*hasher.finalize().as_bytes()))
    }

    /// Get the raw bytes of the hash.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockHash({}...)", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for BlockHash {
    type Err = BuildSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| BuildSyncError::InvalidRequest(format!("invalid block hash {s:?}: {e}")))?;
        Ok(Self(bytes))
    }
}
