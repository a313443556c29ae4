//! Type-safe configuration types for liveforge
//!
//! String-valued choices (compression, clone mode, excluded regions, package
//! backends, distro families) are enums with `strum` derives so they parse
//! from flags and config files and display back the same way.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// Compression profile for the filesystem image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CompressionProfile {
    #[default]
    Fast,
    Standard,
    Max,
}

impl CompressionProfile {
    /// Concrete compressor for this profile.
    pub const fn compression(self) -> Compression {
        match self {
            Self::Fast => Compression {
                algorithm: "zstd",
                level: Some(3),
                extra: &[],
            },
            Self::Standard => Compression {
                algorithm: "zstd",
                level: Some(15),
                extra: &[],
            },
            Self::Max => Compression {
                algorithm: "xz",
                level: None,
                extra: &["-Xbcj", "x86"],
            },
        }
    }
}

/// Compressor algorithm and level handed to `mksquashfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compression {
    pub algorithm: &'static str,
    /// `None` means the compressor's own default level.
    pub level: Option<u8>,
    pub extra: &'static [&'static str],
}

impl Compression {
    /// `mksquashfs` arguments selecting this compressor.
    pub fn mksquashfs_args(&self) -> Vec<String> {
        let mut args = vec!["-comp".to_string(), self.algorithm.to_string()];
        if let Some(level) = self.level {
            args.push("-Xcompression-level".to_string());
            args.push(level.to_string());
        }
        args.extend(self.extra.iter().map(|s| (*s).to_string()));
        args
    }
}

/// Clone variant of the build. Clones keep user data and credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum CloneMode {
    #[default]
    None,
    Clone,
    CryptedClone,
}

impl CloneMode {
    pub const fn is_clone(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Named filesystem region that may be left out of the snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExcludeRegion {
    /// Caches, logs and other build-irrelevant state
    Static,
    /// Every home directory
    Home,
    /// The primary user's home directory only
    Mine,
    Usr,
    Var,
}

/// Native package manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Apt,
    Pacman,
    Dnf,
    Zypper,
}

/// Distro family; each has one fixed installer module sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum DistroFamily {
    Debian,
    Ubuntu,
    Arch,
    Fedora,
}

impl DistroFamily {
    /// Native package backend of the family.
    pub const fn backend(self) -> Backend {
        match self {
            Self::Debian | Self::Ubuntu => Backend::Apt,
            Self::Arch => Backend::Pacman,
            Self::Fedora => Backend::Dnf,
        }
    }

    /// Map an os-release `ID`/`ID_LIKE` token to a family.
    pub fn from_os_release_id(id: &str) -> Option<Self> {
        match id.trim().trim_matches('"') {
            "debian" | "devuan" | "raspbian" => Some(Self::Debian),
            "ubuntu" | "linuxmint" | "pop" | "neon" | "elementary" => Some(Self::Ubuntu),
            "arch" | "manjaro" | "endeavouros" | "garuda" => Some(Self::Arch),
            "fedora" | "rhel" | "centos" | "almalinux" | "rocky" | "nobara" => Some(Self::Fedora),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_profiles_map_to_pairs() {
        assert_eq!(CompressionProfile::Fast.compression().algorithm, "zstd");
        assert_eq!(CompressionProfile::Fast.compression().level, Some(3));
        assert_eq!(CompressionProfile::Max.compression().algorithm, "xz");
    }

    #[test]
    fn test_mksquashfs_args() {
        let args = CompressionProfile::Fast.compression().mksquashfs_args();
        assert_eq!(args, vec!["-comp", "zstd", "-Xcompression-level", "3"]);

        let args = CompressionProfile::Max.compression().mksquashfs_args();
        assert_eq!(args, vec!["-comp", "xz", "-Xbcj", "x86"]);
    }

    #[test]
    fn test_clone_mode_parse() {
        assert_eq!("crypted-clone".parse::<CloneMode>().ok(), Some(CloneMode::CryptedClone));
        assert!(CloneMode::Clone.is_clone());
        assert!(!CloneMode::None.is_clone());
    }

    #[test]
    fn test_distro_family_from_os_release() {
        assert_eq!(DistroFamily::from_os_release_id("\"ubuntu\""), Some(DistroFamily::Ubuntu));
        assert_eq!(DistroFamily::from_os_release_id("rocky"), Some(DistroFamily::Fedora));
        assert_eq!(DistroFamily::from_os_release_id("gentoo"), None);
        assert_eq!(DistroFamily::Arch.backend(), Backend::Pacman);
    }
}
