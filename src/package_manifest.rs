//! Package manifest (`packages.conf`) inside the target root
//!
//! The manifest is a YAML document with a `backend` and an ordered list of
//! `operations`, each carrying at most one of `install` / `remove`. It is
//! re-read on every use: earlier steps may rewrite it.

use crate::types::Backend;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Location of the manifest relative to the target root.
pub const MANIFEST_RELATIVE_PATH: &str = "etc/calamares/modules/packages.conf";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("operation #{index} has both `install` and `remove`")]
    AmbiguousOperation { index: usize },
}

/// One entry of `operations`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageOperation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove: Option<Vec<String>>,
}

impl PackageOperation {
    pub fn install<I: IntoIterator<Item = S>, S: Into<String>>(packages: I) -> Self {
        Self {
            install: Some(packages.into_iter().map(Into::into).collect()),
            remove: None,
        }
    }

    pub fn remove<I: IntoIterator<Item = S>, S: Into<String>>(packages: I) -> Self {
        Self {
            install: None,
            remove: Some(packages.into_iter().map(Into::into).collect()),
        }
    }
}

/// The manifest document as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub backend: Backend,
    #[serde(default)]
    pub operations: Vec<PackageOperation>,
}

/// Removals and installs to apply, in manifest order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageOperationSet {
    pub backend: Backend,
    pub remove: Vec<String>,
    pub install: Vec<String>,
}

impl PackageOperationSet {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.install.is_empty()
    }
}

/// Path of the manifest under `target_root`.
pub fn manifest_path(target_root: &Path) -> PathBuf {
    target_root.join(MANIFEST_RELATIVE_PATH)
}

impl PackageManifest {
    /// Default manifest for a build: removes `tooling` after installation when
    /// `release` is set, otherwise leaves the package set untouched.
    pub fn for_build(backend: Backend, release: bool, tooling: &[&str]) -> Self {
        let removals: Vec<&str> = if release { tooling.to_vec() } else { Vec::new() };
        Self {
            backend,
            operations: vec![
                PackageOperation::remove(removals),
                PackageOperation::install(Vec::<String>::new()),
            ],
        }
    }

    /// Make sure every package of `tooling` is removed, appending one
    /// removal for those no operation removes yet. Returns whether the
    /// manifest changed.
    pub fn ensure_removed(&mut self, tooling: &[&str]) -> bool {
        let missing: Vec<&str> = tooling
            .iter()
            .copied()
            .filter(|pkg| {
                !self
                    .operations
                    .iter()
                    .filter_map(|op| op.remove.as_ref())
                    .any(|removed| removed.iter().any(|r| r == pkg))
            })
            .collect();
        if missing.is_empty() {
            return false;
        }
        self.operations.push(PackageOperation::remove(missing));
        true
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self, ManifestError> {
        serde_yaml::from_str(content).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Read the manifest under `target_root`. A missing manifest is `Ok(None)`.
    pub fn load(target_root: &Path) -> Result<Option<Self>, ManifestError> {
        let path = manifest_path(target_root);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ManifestError::Io {
            path: path.clone(),
            source,
        })?;
        Self::parse(&path, &content).map(Some)
    }

    /// Flatten `operations` into removals and installs, preserving order.
    pub fn operation_set(&self) -> Result<PackageOperationSet, ManifestError> {
        let mut set = PackageOperationSet {
            backend: self.backend,
            remove: Vec::new(),
            install: Vec::new(),
        };
        for (index, op) in self.operations.iter().enumerate() {
            match (&op.install, &op.remove) {
                (Some(_), Some(_)) => return Err(ManifestError::AmbiguousOperation { index }),
                (Some(install), None) => set.install.extend(install.iter().cloned()),
                (None, Some(remove)) => set.remove.extend(remove.iter().cloned()),
                (None, None) => {}
            }
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_manifest(root: &Path, yaml: &str) {
        let path = manifest_path(root);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, yaml).unwrap();
    }

    #[test]
    fn test_missing_manifest_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(PackageManifest::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_parses_calamares_layout() {
        let dir = TempDir::new().unwrap();
        write_manifest(
            dir.path(),
            "backend: pacman\noperations:\n  - remove:\n      - calamares\n  - install:\n      - vim\n      - git\n",
        );
        let set = PackageManifest::load(dir.path())
            .unwrap()
            .unwrap()
            .operation_set()
            .unwrap();
        assert_eq!(set.backend, Backend::Pacman);
        assert_eq!(set.remove, vec!["calamares"]);
        assert_eq!(set.install, vec!["vim", "git"]);
    }

    /// Earlier releases only honoured removals when the first operation's
    /// remove list was empty, so a populated removal list was silently
    /// dropped. Removals listed first are applied.
    #[test]
    fn test_populated_first_removal_is_not_dropped() {
        let manifest = PackageManifest {
            backend: Backend::Apt,
            operations: vec![PackageOperation::remove(["live-boot"]), PackageOperation::install(["vim"])],
        };
        let set = manifest.operation_set().unwrap();
        assert_eq!(set.remove, vec!["live-boot"]);
        assert_eq!(set.install, vec!["vim"]);
    }

    /// With an empty first removal the outcome is the same under both readings.
    #[test]
    fn test_empty_first_removal_uses_second_install() {
        let manifest = PackageManifest {
            backend: Backend::Apt,
            operations: vec![
                PackageOperation::remove(Vec::<String>::new()),
                PackageOperation::install(["vim"]),
            ],
        };
        let set = manifest.operation_set().unwrap();
        assert!(set.remove.is_empty());
        assert_eq!(set.install, vec!["vim"]);
    }

    #[test]
    fn test_rejects_operation_with_both_lists() {
        let manifest = PackageManifest {
            backend: Backend::Dnf,
            operations: vec![PackageOperation {
                install: Some(vec!["a".into()]),
                remove: Some(vec!["b".into()]),
            }],
        };
        assert!(matches!(
            manifest.operation_set(),
            Err(ManifestError::AmbiguousOperation { index: 0 })
        ));
    }

    #[test]
    fn test_release_manifest_removes_tooling() {
        let manifest = PackageManifest::for_build(Backend::Apt, true, &["calamares", "liveforge"]);
        let set = manifest.operation_set().unwrap();
        assert_eq!(set.remove, vec!["calamares", "liveforge"]);

        let yaml = manifest.to_yaml().unwrap();
        assert!(yaml.contains("backend: apt"));
    }

    #[test]
    fn test_ensure_removed_appends_only_missing_tooling() {
        let mut manifest = PackageManifest {
            backend: Backend::Pacman,
            operations: vec![PackageOperation::remove(["calamares"]), PackageOperation::install(["vim"])],
        };
        assert!(manifest.ensure_removed(&["calamares", "liveforge"]));
        assert_eq!(manifest.operations.last(), Some(&PackageOperation::remove(["liveforge"])));

        let set = manifest.operation_set().unwrap();
        assert_eq!(set.remove, vec!["calamares", "liveforge"]);
        assert_eq!(set.install, vec!["vim"]);

        assert!(!manifest.ensure_removed(&["calamares", "liveforge"]));
        assert_eq!(manifest.operations.len(), 3);
    }

    #[test]
    fn test_non_release_manifest_is_empty() {
        let manifest = PackageManifest::for_build(Backend::Pacman, false, &["calamares"]);
        assert!(manifest.operation_set().unwrap().is_empty());
    }
}
