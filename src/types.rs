//! Identifiers shared by the request contract and the manifest store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BuildSyncError;

/// Product branch identifier (a release channel).
///
/// `0` is the wire default and means "unset".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(u64);

impl BranchId {
    /// Create a branch identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether the branch was left at the wire default.
    #[must_use]
    pub const fn is_unset(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for BranchId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of an immutable published build.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(Vec<u8>);

impl BuildId {
    /// Wrap raw identifier bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw identifier bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the identifier has no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lowercase hex encoding, also used as the on-disk file stem.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BuildId({})", self.to_hex())
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for BuildId {
    type Err = BuildSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        hex::decode(s)
            .map(Self)
            .map_err(|e| BuildSyncError::InvalidRequest(format!("invalid build id {s:?}: {e}")))
    }
}

/// Platform a client is able to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Target {
    /// 64-bit Windows
    WindowsX64,
    /// 32-bit Windows
    WindowsX86,
    /// 64-bit Linux on x86
    LinuxX64,
    /// 64-bit Linux on ARM
    LinuxArm64,
    /// macOS on Intel
    MacosX64,
    /// macOS on Apple Silicon
    MacosArm64,
}

impl Target {
    /// Every supported target.
    pub const ALL: [Self; 6] = [
        Self::WindowsX64,
        Self::WindowsX86,
        Self::LinuxX64,
        Self::LinuxArm64,
        Self::MacosX64,
        Self::MacosArm64,
    ];

    /// Canonical name, matching the serde representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WindowsX64 => "windows-x64",
            Self::WindowsX86 => "windows-x86",
            Self::LinuxX64 => "linux-x64",
            Self::LinuxArm64 => "linux-arm64",
            Self::MacosX64 => "macos-x64",
            Self::MacosArm64 => "macos-arm64",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = BuildSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "windows-x64" | "win64" | "windows-x86_64" => Ok(Self::WindowsX64),
            "windows-x86" | "win32" => Ok(Self::WindowsX86),
            "linux-x64" | "linux-x86_64" | "linux64" => Ok(Self::LinuxX64),
            "linux-arm64" | "linux-aarch64" => Ok(Self::LinuxArm64),
            "macos-x64" | "macos-x86_64" | "osx64" => Ok(Self::MacosX64),
            "macos-arm64" | "macos-aarch64" => Ok(Self::MacosArm64),
            _ => Err(BuildSyncError::InvalidRequest(format!("unknown target: {s}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_unset() {
        assert!(BranchId::new(0).is_unset());
        assert!(!BranchId::from(3).is_unset());
        assert_eq!(BranchId::new(42).get(), 42);
    }

    #[test]
    fn build_id_hex() {
        let id = BuildId::new(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(id.to_string(), "deadbeef");
        assert_eq!("deadbeef".parse::<BuildId>().unwrap(), id);
        assert_eq!(format!("{id:?}"), "BuildId(deadbeef)");
    }

    #[test]
    fn build_id_rejects_bad_hex() {
        assert!("xyz".parse::<BuildId>().is_err());
    }

    #[test]
    fn target_names_roundtrip() {
        for target in Target::ALL {
            assert_eq!(target.as_str().parse::<Target>().unwrap(), target);
        }
    }

    #[test]
    fn target_aliases() {
        assert_eq!("WIN64".parse::<Target>().unwrap(), Target::WindowsX64);
        assert_eq!("linux-aarch64".parse::<Target>().unwrap(), Target::LinuxArm64);
        assert!("amiga".parse::<Target>().is_err());
    }

    #[test]
    fn target_serde_name() {
        let encoded = toml::Value::try_from(Target::MacosArm64).unwrap();
        assert_eq!(encoded.as_str(), Some("macos-arm64"));
    }
}
