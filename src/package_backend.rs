//! Package backend adapter
//!
//! Translates install/remove/query requests into the native command of each
//! package manager, optionally running inside a target root via `chroot`.
//!
//! # Idempotence
//!
//! - Queries never mutate state, so repeating them against an unchanged system
//!   gives the same answer.
//! - Installs use each backend's "already installed is fine" mode
//!   (`--needed`, `-y`), so re-running an install is a zero-effect success.
//! - Removals skip packages that are not installed; several backends treat
//!   removing an absent package as an error.

use crate::command_executor::{in_root, shell_quote, CommandExecutor, EchoPolicy};
use crate::error::CommandFailure;
use crate::types::Backend;
use std::path::Path;
use tracing::{debug, info};

/// Characters that must never reach a package-manager command line.
const FORBIDDEN_CHARS: &[char] = &[';', '|', '&', '$', '`', '"', '\'', ' ', '\n', '<', '>'];

/// Reject names that could smuggle shell syntax into a command line.
pub fn validate_package_name(name: &str) -> Result<(), CommandFailure> {
    if name.is_empty() || name.starts_with('-') || name.contains(FORBIDDEN_CHARS) {
        return Err(CommandFailure::new("", -1, format!("invalid package name: {:?}", name))
            .with_packages([name]));
    }
    Ok(())
}

impl Backend {
    fn installed_query(self, package: &str) -> String {
        match self {
            Self::Apt => format!("dpkg-query -W -f='${{Status}}' {}", package),
            Self::Pacman => format!("pacman -Q {}", package),
            Self::Dnf | Self::Zypper => format!("rpm -q {}", package),
        }
    }

    fn available_query(self, package: &str) -> String {
        match self {
            Self::Apt => format!("apt-cache policy {}", package),
            Self::Pacman => format!("pacman -Si {}", package),
            Self::Dnf => format!("dnf list --available {}", package),
            Self::Zypper => format!("zypper --non-interactive search -x {}", package),
        }
    }

    fn install_command(self, package: &str) -> String {
        match self {
            Self::Apt => format!("env DEBIAN_FRONTEND=noninteractive apt-get install -y {}", package),
            Self::Pacman => format!("pacman -S --noconfirm --needed {}", package),
            Self::Dnf => format!("dnf install -y {}", package),
            Self::Zypper => format!("zypper --non-interactive install {}", package),
        }
    }

    fn remove_command(self, package: &str) -> String {
        match self {
            Self::Apt => format!("env DEBIAN_FRONTEND=noninteractive apt-get purge -y {}", package),
            Self::Pacman => format!("pacman -Rns --noconfirm {}", package),
            Self::Dnf => format!("dnf remove -y {}", package),
            Self::Zypper => format!("zypper --non-interactive remove {}", package),
        }
    }

    /// Cleanup run once after a batch of removals.
    fn after_remove_command(self) -> Option<&'static str> {
        match self {
            Self::Apt => Some("env DEBIAN_FRONTEND=noninteractive apt-get autoremove -y"),
            _ => None,
        }
    }

    fn installed_from_output(self, package: &str, exit_ok: bool, stdout: &str) -> bool {
        match self {
            Self::Apt => exit_ok && stdout.contains("install ok installed"),
            Self::Pacman | Self::Dnf | Self::Zypper => exit_ok && !stdout.contains("not installed") && stdout.contains(package),
        }
    }

    fn available_from_output(self, package: &str, exit_ok: bool, stdout: &str) -> bool {
        match self {
            Self::Apt => {
                exit_ok
                    && stdout
                        .lines()
                        .any(|l| l.trim_start().starts_with("Candidate:") && !l.contains("(none)"))
            }
            Self::Pacman | Self::Zypper => exit_ok,
            Self::Dnf => exit_ok && stdout.contains(package),
        }
    }
}

/// Package operations against one executor.
pub struct PackageBackend<'a> {
    executor: &'a dyn CommandExecutor,
}

impl<'a> PackageBackend<'a> {
    pub fn new(executor: &'a dyn CommandExecutor) -> Self {
        Self { executor }
    }

    /// True when `package` is installed on the host, or inside `target_root`.
    pub fn is_installed(&self, backend: Backend, package: &str, target_root: Option<&Path>) -> bool {
        if validate_package_name(package).is_err() {
            return false;
        }
        let cmd = in_root(target_root, &backend.installed_query(package));
        match self.executor.query(&cmd) {
            Ok(out) => backend.installed_from_output(package, out.success(), &out.stdout),
            Err(e) => {
                debug!("{} query failed: {}", backend, e);
                false
            }
        }
    }

    /// True when the repositories offer `package`. Does not imply install success.
    pub fn is_available(&self, backend: Backend, package: &str) -> bool {
        if validate_package_name(package).is_err() {
            return false;
        }
        match self.executor.query(&backend.available_query(package)) {
            Ok(out) => backend.available_from_output(package, out.success(), &out.stdout),
            Err(e) => {
                debug!("{} availability query failed: {}", backend, e);
                false
            }
        }
    }

    /// Install packages one invocation at a time, stopping at the first failure.
    pub fn install(
        &self,
        backend: Backend,
        packages: &[String],
        target_root: Option<&Path>,
        echo: EchoPolicy,
    ) -> Result<(), CommandFailure> {
        for package in packages {
            validate_package_name(package)?;
            info!(%backend, package = package.as_str(), "Installing");
            let cmd = in_root(target_root, &backend.install_command(&shell_quote(package)));
            self.executor
                .run(&cmd, echo)
                .map_err(|e| e.with_packages([package.as_str()]))?;
        }
        Ok(())
    }

    /// Remove installed packages; absent packages are skipped.
    pub fn remove(
        &self,
        backend: Backend,
        packages: &[String],
        target_root: Option<&Path>,
        echo: EchoPolicy,
    ) -> Result<(), CommandFailure> {
        let mut removed = Vec::new();
        for package in packages {
            validate_package_name(package)?;
            if !self.is_installed(backend, package, target_root) {
                debug!(%backend, package = package.as_str(), "Not installed, nothing to remove");
                continue;
            }
            info!(%backend, package = package.as_str(), "Removing");
            let cmd = in_root(target_root, &backend.remove_command(&shell_quote(package)));
            self.executor
                .run(&cmd, echo)
                .map_err(|e| e.with_packages([package.as_str()]))?;
            removed.push(package.as_str());
        }

        if !removed.is_empty() {
            if let Some(cleanup) = backend.after_remove_command() {
                self.executor
                    .run(&in_root(target_root, cleanup), echo)
                    .map_err(|e| e.with_packages(removed))?;
            }
        }
        Ok(())
    }
}
