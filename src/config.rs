//! Build configuration
//!
//! `BuildRequest` is what the caller asked for (flags or a config file).
//! `BuildConfiguration` is the validated, immutable form the pipeline runs
//! from. `HostLayout` names every fixed location the pipeline touches.

use crate::error::ConfigError;
use crate::types::{CloneMode, CompressionProfile, DistroFamily, ExcludeRegion};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Addons the pipeline knows how to hook in.
pub const KNOWN_ADDONS: &[&str] = &["adapt", "ichoice", "pve", "rsupport", "theme"];

/// Vendor assumed when an addon is given without one.
pub const DEFAULT_VENDOR: &str = "core";

/// Fixed filesystem locations read or written during a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    /// Root of the system being snapshotted.
    pub source_root: PathBuf,
    pub addons_dir: PathBuf,
    /// Holds `vendors/<name>` themes.
    pub wardrobe_dir: PathBuf,
    pub applications_dir: PathBuf,
    /// Working area: staged root, images and generated scripts.
    pub snapshot_dir: PathBuf,
    /// Installer module templates for this distro.
    pub template_dir: PathBuf,
    /// Local package repository used during installation.
    pub cache_dir: PathBuf,
    pub installer_config_dir: PathBuf,
    pub primary_user: Option<String>,
}

impl HostLayout {
    /// Standard locations on the running system.
    pub fn system() -> Self {
        Self::under(Path::new("/"), primary_user())
    }

    /// Standard locations relocated under `root`.
    pub fn under(root: &Path, primary_user: Option<String>) -> Self {
        let wardrobe = match &primary_user {
            Some(user) => root.join("home").join(user).join(".wardrobe"),
            None => root.join("root/.wardrobe"),
        };
        Self {
            source_root: root.to_path_buf(),
            addons_dir: root.join("usr/share/liveforge/addons"),
            wardrobe_dir: wardrobe,
            applications_dir: root.join("usr/share/applications"),
            snapshot_dir: root.join("home/liveforge"),
            template_dir: root.join("etc/liveforge/calamares"),
            cache_dir: root.join("var/local/yolk"),
            installer_config_dir: root.join("etc/calamares"),
            primary_user,
        }
    }

    /// Root the snapshot is copied into and the installer is configured in.
    pub fn staged_root(&self) -> PathBuf {
        self.snapshot_dir.join("rootfs")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.snapshot_dir.join("scripts")
    }

    /// Output image for `image_name`.
    pub fn image_path(&self, image_name: &str) -> PathBuf {
        self.snapshot_dir
            .join(image_name)
            .join("live")
            .join("filesystem.squashfs")
    }
}

/// The invoking user behind `sudo`, if any.
fn primary_user() -> Option<String> {
    std::env::var("SUDO_USER")
        .ok()
        .filter(|u| !u.is_empty() && u != "root")
}

/// `vendor/name` reference to an addon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonSpec {
    pub vendor: String,
    pub name: String,
}

impl AddonSpec {
    /// Parse `vendor/name`; a bare `name` belongs to the default vendor.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim().trim_matches('/');
        let (vendor, name) = match raw.split_once('/') {
            Some((vendor, name)) => (vendor, name),
            None => (DEFAULT_VENDOR, raw),
        };
        if vendor.is_empty() || name.is_empty() || name.contains('/') {
            return Err(ConfigError::Invalid {
                field: "addons",
                reason: format!("`{}` is not vendor/name", raw),
            });
        }
        Ok(Self {
            vendor: vendor.to_string(),
            name: name.to_string(),
        })
    }

    pub fn dir(&self, layout: &HostLayout) -> PathBuf {
        layout.addons_dir.join(&self.vendor).join(&self.name)
    }
}

impl std::fmt::Display for AddonSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.vendor, self.name)
    }
}

/// Resolve addons. Existence is checked first so a typo in a real addon name
/// reports the path that was looked at.
pub fn resolve_addons(raw: &[String], layout: &HostLayout) -> Result<Vec<AddonSpec>, ConfigError> {
    let mut addons = Vec::with_capacity(raw.len());
    for entry in raw {
        let addon = AddonSpec::parse(entry)?;
        let dir = addon.dir(layout);
        if !dir.is_dir() {
            return Err(ConfigError::AddonNotFound {
                name: addon.to_string(),
                path: dir,
            });
        }
        if !KNOWN_ADDONS.contains(&addon.name.as_str()) {
            return Err(ConfigError::UnknownAddon(addon.to_string()));
        }
        addons.push(addon);
    }
    Ok(addons)
}

/// Resolve a theme reference. A bare name is looked up in the wardrobe; a
/// path is used as given. Either way it must contain a `theme` entry.
pub fn resolve_theme(theme: &str, layout: &HostLayout) -> Result<PathBuf, ConfigError> {
    let trimmed = theme.trim();
    let candidate = if trimmed.contains('/') {
        PathBuf::from(trimmed.trim_end_matches('/'))
    } else {
        layout.wardrobe_dir.join("vendors").join(trimmed)
    };
    let resolved = if candidate.is_absolute() {
        candidate
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&candidate))
            .unwrap_or(candidate)
    };
    if !resolved.join("theme").exists() {
        return Err(ConfigError::ThemeNotFound(resolved));
    }
    Ok(resolved)
}

/// Custom final steps a theme ships, relative to the theme directory.
pub const THEME_STEPS_FILE: &str = "theme/calamares/custom_final_steps.yml";

/// Step names listed by the theme, in order. A theme without the file
/// contributes none.
pub fn theme_custom_steps(theme: &Path) -> Result<Vec<String>, ConfigError> {
    let path = theme.join(THEME_STEPS_FILE);
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let invalid = |reason: String| ConfigError::Invalid {
        field: "custom_final_steps",
        reason,
    };
    let content = std::fs::read_to_string(&path).map_err(|e| invalid(format!("{}: {}", path.display(), e)))?;
    serde_yaml::from_str(&content).map_err(|e| invalid(format!("{}: {}", path.display(), e)))
}

/// Keep desktop links whose `.desktop` entry exists; warn about the rest.
pub fn validate_links(links: &[String], layout: &HostLayout) -> Vec<String> {
    links
        .iter()
        .filter(|link| {
            let entry = layout.applications_dir.join(format!("{}.desktop", link));
            let found = entry.exists();
            if !found {
                warn!("Desktop link {} not found, dropping it", entry.display());
            }
            found
        })
        .cloned()
        .collect()
}

/// `prefix` and `basename` end up in a file name under the snapshot
/// directory, so neither may hold a path separator, a parent reference or
/// whitespace.
pub fn check_name_part(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.contains('/') || value.contains("..") || value.contains(char::is_whitespace) {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("{:?} cannot contain '/', '..' or whitespace", value),
        });
    }
    Ok(())
}

/// Account names the installer can delete: lowercase, digits, `_` and `-`,
/// not starting with a digit or `-`, and never `root`.
pub fn check_user_name(value: &str) -> Result<(), ConfigError> {
    let valid_start = value.starts_with(|c: char| c.is_ascii_lowercase() || c == '_');
    let valid_rest = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid_start || !valid_rest || value == "root" {
        return Err(ConfigError::Invalid {
            field: "live_user",
            reason: format!("{:?} is not a removable account name", value),
        });
    }
    Ok(())
}

/// Set of excluded snapshot regions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludeSet(BTreeSet<ExcludeRegion>);

impl ExcludeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, region: ExcludeRegion) {
        self.0.insert(region);
    }

    pub fn contains(&self, region: ExcludeRegion) -> bool {
        self.0.contains(&region)
    }

    pub fn iter(&self) -> impl Iterator<Item = ExcludeRegion> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<ExcludeRegion> for ExcludeSet {
    fn from_iter<I: IntoIterator<Item = ExcludeRegion>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Raw request, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub prefix: String,
    /// Empty means "derive from the host name".
    pub basename: String,
    pub theme: Option<String>,
    pub compression: CompressionProfile,
    pub clone: bool,
    pub crypted_clone: bool,
    pub excludes: Vec<ExcludeRegion>,
    pub addons: Vec<String>,
    pub links: Vec<String>,
    pub interactive: bool,
    pub unsecure: bool,
    pub release: bool,
    pub script_only: bool,
    pub verbose: bool,
    pub custom_final_steps: Vec<String>,
    /// Overrides detection from os-release.
    pub distro: Option<DistroFamily>,
    /// Live session account removed from the installed system.
    pub live_user: String,
    /// Rebuild the local package cache even when one exists.
    pub yolk_renew: bool,
}

impl Default for BuildRequest {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            basename: String::new(),
            theme: None,
            compression: CompressionProfile::Fast,
            clone: false,
            crypted_clone: false,
            excludes: Vec::new(),
            addons: Vec::new(),
            links: Vec::new(),
            interactive: true,
            unsecure: false,
            release: false,
            script_only: false,
            verbose: false,
            custom_final_steps: Vec::new(),
            distro: None,
            live_user: crate::sequencer::DEFAULT_LIVE_USER.to_string(),
            yolk_renew: false,
        }
    }
}

impl BuildRequest {
    /// Clone mode implied by the two clone flags.
    pub fn clone_mode(&self) -> Result<CloneMode, ConfigError> {
        match (self.clone, self.crypted_clone) {
            (true, true) => Err(ConfigError::ConflictingCloneModes),
            (true, false) => Ok(CloneMode::Clone),
            (false, true) => Ok(CloneMode::CryptedClone),
            (false, false) => Ok(CloneMode::None),
        }
    }
}

/// Validated configuration. Built only by `Producer::prepare`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfiguration {
    pub prefix: String,
    pub basename: String,
    /// `None` means built-in defaults.
    pub theme: Option<PathBuf>,
    pub compression: CompressionProfile,
    pub clone_mode: CloneMode,
    pub excludes: ExcludeSet,
    pub addons: Vec<AddonSpec>,
    pub desktop_links: Vec<String>,
    pub interactive: bool,
    /// Always true for clones.
    pub unsecure: bool,
    pub release: bool,
    pub script_only: bool,
    pub verbose: bool,
    pub live_user: String,
    pub yolk_renew: bool,
}

impl BuildConfiguration {
    pub fn is_clone(&self) -> bool {
        self.clone_mode.is_clone()
    }
}

/// Detect the distro family from `<root>/etc/os-release` (`ID`, then `ID_LIKE`).
pub fn detect_distro(root: &Path) -> Result<DistroFamily, ConfigError> {
    let path = root.join("etc/os-release");
    let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::Invalid {
        field: "distro",
        reason: format!("cannot read {}: {}", path.display(), e),
    })?;
    let value = |key: &str| {
        content
            .lines()
            .find_map(|line| line.strip_prefix(key)?.strip_prefix('='))
            .map(|v| v.trim().trim_matches('"').to_string())
    };
    let id = value("ID").unwrap_or_default();
    if let Some(family) = DistroFamily::from_os_release_id(&id) {
        return Ok(family);
    }
    value("ID_LIKE")
        .unwrap_or_default()
        .split_whitespace()
        .find_map(DistroFamily::from_os_release_id)
        .ok_or(ConfigError::UnknownDistro(id))
}
