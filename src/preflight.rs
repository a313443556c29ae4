//! Pre-flight checks for the host
//!
//! Two layers:
//! - Environment: root privileges and the binaries every build shells out to.
//!   Failing here stops the program before anything is planned.
//! - Prerequisites: host state a build needs (installer templates, installer
//!   config, local package cache). These can be remedied, with the operator's
//!   consent, by `Producer::produce`.

use crate::command_executor::{shell_quote, CommandExecutor, EchoPolicy};
use crate::config::HostLayout;
use crate::error::CommandFailure;
use crate::process_guard::CommandProcessGroup;
use crate::templates;
use crate::types::DistroFamily;
use std::fmt;
use std::process::Command;
use tracing::{debug, info};

/// Binaries every produce run needs.
const REQUIRED_BINARIES: &[&str] = &["mksquashfs", "rsync", "chroot", "mount", "umount"];

/// Packages placed in the local repository for offline installs.
const CACHE_PACKAGES: &[&str] = &["grub-efi-amd64-bin", "grub-pc-bin", "efibootmgr", "cryptsetup", "keyutils"];

/// Result of environment verification
#[derive(Debug)]
pub struct PreflightResult {
    pub missing_binaries: Vec<String>,
    pub is_root: bool,
}

impl PreflightResult {
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty() && self.is_root
    }
}

impl fmt::Display for PreflightResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut problems = Vec::new();
        if !self.is_root {
            problems.push("root privileges required (run with sudo)".to_string());
        }
        for binary in &self.missing_binaries {
            problems.push(format!("missing {} (install: {})", binary, package_for_binary(binary)));
        }
        write!(f, "{}", problems.join("; "))
    }
}

fn binary_exists(name: &str) -> bool {
    Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {}", shell_quote(name)))
        .in_new_process_group()
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Package providing `binary` on most distros.
fn package_for_binary(binary: &str) -> &'static str {
    match binary {
        "mksquashfs" => "squashfs-tools",
        "rsync" => "rsync",
        "chroot" => "coreutils",
        "mount" | "umount" => "util-linux",
        _ => "unknown",
    }
}

pub fn verify_environment() -> PreflightResult {
    debug!("Running pre-flight checks...");
    let missing_binaries = REQUIRED_BINARIES
        .iter()
        .filter(|b| !binary_exists(b))
        .map(|b| (*b).to_string())
        .collect();
    PreflightResult {
        missing_binaries,
        is_root: is_running_as_root(),
    }
}

/// Skip root check (for development/testing)
/// Set LIVEFORGE_SKIP_ROOT_CHECK=1 to skip
pub fn should_skip_root_check() -> bool {
    std::env::var("LIVEFORGE_SKIP_ROOT_CHECK")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Host state a build depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Prerequisite {
    /// Installer module templates for the distro.
    DistroTemplate,
    /// Installer configuration directory seeded from the templates.
    InstallerConfigRefresh,
    /// Local package repository used by offline installs.
    PackageCache,
}

impl Prerequisite {
    /// Prerequisites not satisfied on this host, in remedy order. With
    /// `renew_cache` a Debian-family package cache counts as unmet even when
    /// present.
    pub fn unmet(layout: &HostLayout, family: DistroFamily, renew_cache: bool) -> Vec<Self> {
        let mut unmet = Vec::new();
        if !templates::templates_installed(&layout.template_dir) {
            unmet.push(Self::DistroTemplate);
        }
        if !layout.installer_config_dir.join("modules").is_dir() {
            unmet.push(Self::InstallerConfigRefresh);
        }
        let debian_like = matches!(family, DistroFamily::Debian | DistroFamily::Ubuntu);
        if debian_like && (renew_cache || !layout.cache_dir.join("Packages").is_file()) {
            unmet.push(Self::PackageCache);
        }
        unmet
    }

    /// Bring the host into the state this prerequisite describes.
    pub fn remedy(
        self,
        executor: &dyn CommandExecutor,
        layout: &HostLayout,
        echo: EchoPolicy,
    ) -> Result<(), CommandFailure> {
        info!(prerequisite = %self, "Remedying");
        match self {
            Self::DistroTemplate => templates::install_builtin(executor, &layout.template_dir).map_err(|e| {
                CommandFailure::new(
                    format!("install templates into {}", layout.template_dir.display()),
                    -1,
                    e.to_string(),
                )
            }),
            Self::InstallerConfigRefresh => {
                let modules = shell_quote(&layout.installer_config_dir.join("modules").display().to_string());
                let templates = shell_quote(&format!("{}/.", layout.template_dir.display()));
                executor.run(&format!("mkdir -p {modules} && cp -a {templates} {modules}/"), echo)?;
                Ok(())
            }
            Self::PackageCache => {
                let cache = shell_quote(&layout.cache_dir.display().to_string());
                executor.run(
                    &format!(
                        "mkdir -p {cache} && cd {cache} && rm -f ./*.deb Packages && apt-get download {} && dpkg-scanpackages -m . > Packages",
                        CACHE_PACKAGES.join(" ")
                    ),
                    echo,
                )?;
                Ok(())
            }
        }
    }
}
