//! Module step registry
//!
//! Every step a distro sequence can run is declared here once, as a tagged
//! `StepKind` plus an explicit `FailurePolicy`. A registry is built per distro
//! family before execution starts and never changes afterwards.

use crate::types::DistroFamily;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// What happens to the sequence when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Halt the sequence and report the step.
    Fatal,
    /// Log a warning and carry on.
    BestEffort,
}

/// Which of the two config variants a calamares module renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleVariant {
    Apply,
    Undo,
}

/// Kind of work a step performs, with its kind-specific argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    /// Render one module config from a template plus context.
    BuilderModule { module: String },
    /// Render one of two named config variants of a module.
    CalamaresModule { module: String, variant: ModuleVariant },
    /// Apply the package manifest through the package backend.
    PackageOperation,
    /// Run a host command; `{{root}}` expands to the target root.
    ShellHook { command: String },
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::BuilderModule { .. } => "builder-module",
            Self::CalamaresModule { .. } => "calamares-module",
            Self::PackageOperation => "package-operation",
            Self::ShellHook { .. } => "shell-hook",
        }
    }
}

/// A named, immutable unit of installer work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleStep {
    pub name: String,
    pub kind: StepKind,
    /// When set, the step looks for overrides in the build's theme.
    pub theme_aware: bool,
    pub policy: FailurePolicy,
}

impl ModuleStep {
    pub fn builder(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: StepKind::BuilderModule {
                module: name.to_string(),
            },
            theme_aware: false,
            policy: FailurePolicy::Fatal,
        }
    }

    pub fn calamares(name: &str, module: &str, variant: ModuleVariant) -> Self {
        Self {
            name: name.to_string(),
            kind: StepKind::CalamaresModule {
                module: module.to_string(),
                variant,
            },
            theme_aware: false,
            policy: FailurePolicy::Fatal,
        }
    }

    pub fn packages() -> Self {
        Self {
            name: "packages".to_string(),
            kind: StepKind::PackageOperation,
            theme_aware: false,
            policy: FailurePolicy::Fatal,
        }
    }

    pub fn hook(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: StepKind::ShellHook {
                command: command.to_string(),
            },
            theme_aware: false,
            policy: FailurePolicy::BestEffort,
        }
    }

    pub fn themed(mut self) -> Self {
        self.theme_aware = true;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Name of the config file this step renders, if it renders one.
    pub fn config_name(&self) -> Option<String> {
        match &self.kind {
            StepKind::BuilderModule { module } => Some(module.clone()),
            StepKind::CalamaresModule {
                module,
                variant: ModuleVariant::Apply,
            } => Some(module.clone()),
            StepKind::CalamaresModule {
                module,
                variant: ModuleVariant::Undo,
            } => Some(format!("{}-undo", module)),
            StepKind::PackageOperation | StepKind::ShellHook { .. } => None,
        }
    }
}

impl fmt::Display for ModuleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind.label())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("step `{0}` is not registered")]
    NotFound(String),

    #[error("step `{0}` registered twice")]
    Duplicate(String),
}

impl From<RegistryError> for crate::error::LiveforgeError {
    fn from(err: RegistryError) -> Self {
        crate::error::LiveforgeError::Registry(err.to_string())
    }
}

/// Steps every family shares.
const COMMON_BUILDERS: &[&str] = &[
    "welcome",
    "mount",
    "unpackfs",
    "machineid",
    "fstab",
    "keyboard",
    "localecfg",
    "luksbootkeyfile",
    "displaymanager",
    "networkcfg",
    "hwclock",
    "initramfs",
    "grubcfg",
    "bootloader",
    "removeuser",
    "umount",
    "finished",
];

/// Builders whose template the theme may override.
const THEMED_BUILDERS: &[&str] = &["partition", "locale", "users"];

/// Name → step table for one distro family.
#[derive(Debug, Clone)]
pub struct StepRegistry {
    family: DistroFamily,
    steps: HashMap<String, ModuleStep>,
}

impl StepRegistry {
    fn empty(family: DistroFamily) -> Self {
        Self {
            family,
            steps: HashMap::new(),
        }
    }

    /// Canonical step table for `family`.
    pub fn for_family(family: DistroFamily) -> Self {
        let mut registry = Self::empty(family);
        let mut add = |step: ModuleStep| {
            registry.steps.insert(step.name.clone(), step);
        };

        for name in COMMON_BUILDERS {
            add(ModuleStep::builder(name));
        }
        for name in THEMED_BUILDERS {
            add(ModuleStep::builder(name).themed());
        }
        add(ModuleStep::packages());
        add(ModuleStep::calamares("cleanup", "cleanup", ModuleVariant::Apply));

        add(ModuleStep::hook(
            "before_bootloader_mkdirs",
            "mkdir -p {{root}}/boot/efi/EFI/boot",
        ));
        add(ModuleStep::hook(
            "before_bootloader",
            "cp --remove-destination /etc/resolv.conf {{root}}/etc/resolv.conf",
        ));

        match family {
            DistroFamily::Debian | DistroFamily::Ubuntu => {
                add(ModuleStep::calamares("sources-yolk", "sources-yolk", ModuleVariant::Apply));
                add(ModuleStep::calamares("sources-yolk-undo", "sources-yolk", ModuleVariant::Undo));
                add(ModuleStep::hook("after_bootloader", "chroot {{root}} update-grub"));
                add(ModuleStep::hook("add386arch", "chroot {{root}} dpkg --add-architecture i386"));
                if family == DistroFamily::Ubuntu {
                    add(ModuleStep::hook(
                        "bug-LP#1829805",
                        "touch {{root}}/boot/initrd.img-$(uname -r)",
                    ));
                }
            }
            DistroFamily::Arch => {
                add(ModuleStep::hook(
                    "after_bootloader",
                    "chroot {{root}} grub-mkconfig -o /boot/grub/grub.cfg",
                ));
            }
            DistroFamily::Fedora => {
                add(ModuleStep::hook("dracut", "chroot {{root}} dracut --regenerate-all --force"));
                add(ModuleStep::hook(
                    "after_bootloader",
                    "chroot {{root}} grub2-mkconfig -o /boot/grub2/grub.cfg",
                ));
            }
        }

        registry
    }

    /// Register theme-provided modules (`theme/calamares/modules/*.yml`) that
    /// have no built-in step, so custom final steps can name them.
    pub fn with_theme_modules(mut self, theme: &Path) -> std::io::Result<Self> {
        let dir = theme.join("theme").join("calamares").join("modules");
        if !dir.is_dir() {
            return Ok(self);
        }
        let mut names: Vec<String> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "yml"))
            .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        for name in names {
            if !self.steps.contains_key(&name) {
                tracing::debug!("Registering theme module {}", name);
                let step = ModuleStep::calamares(&name, &name, ModuleVariant::Apply).themed();
                self.steps.insert(name, step);
            }
        }
        Ok(self)
    }

    /// Add one step. Only for construction; names must be unique.
    pub fn register(mut self, step: ModuleStep) -> Result<Self, RegistryError> {
        if self.steps.contains_key(&step.name) {
            return Err(RegistryError::Duplicate(step.name));
        }
        self.steps.insert(step.name.clone(), step);
        Ok(self)
    }

    pub fn family(&self) -> DistroFamily {
        self.family
    }

    pub fn resolve(&self, name: &str) -> Result<&ModuleStep, RegistryError> {
        self.steps
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_hooks_are_best_effort_and_modules_fatal() {
        for family in DistroFamily::iter() {
            let registry = StepRegistry::for_family(family);
            for name in ["before_bootloader_mkdirs", "before_bootloader", "after_bootloader"] {
                assert_eq!(registry.resolve(name).unwrap().policy, FailurePolicy::BestEffort);
            }
            for name in ["partition", "mount", "unpackfs", "packages", "cleanup"] {
                assert_eq!(registry.resolve(name).unwrap().policy, FailurePolicy::Fatal);
            }
        }
    }

    #[test]
    fn test_resolve_unknown_is_not_found() {
        let registry = StepRegistry::for_family(DistroFamily::Debian);
        assert_eq!(
            registry.resolve("step-a"),
            Err(RegistryError::NotFound("step-a".into()))
        );
    }

    #[test]
    fn test_family_specific_hooks() {
        assert!(StepRegistry::for_family(DistroFamily::Ubuntu).contains("bug-LP#1829805"));
        assert!(!StepRegistry::for_family(DistroFamily::Debian).contains("bug-LP#1829805"));
        assert!(StepRegistry::for_family(DistroFamily::Fedora).contains("dracut"));
        assert!(!StepRegistry::for_family(DistroFamily::Arch).contains("sources-yolk"));
    }

    #[test]
    fn test_variant_config_names() {
        let registry = StepRegistry::for_family(DistroFamily::Debian);
        assert_eq!(
            registry.resolve("sources-yolk").unwrap().config_name().as_deref(),
            Some("sources-yolk")
        );
        assert_eq!(
            registry.resolve("sources-yolk-undo").unwrap().config_name().as_deref(),
            Some("sources-yolk-undo")
        );
        assert_eq!(registry.resolve("packages").unwrap().config_name(), None);
    }

    #[test]
    fn test_theme_modules_registered() {
        let theme = tempfile::TempDir::new().unwrap();
        let modules = theme.path().join("theme/calamares/modules");
        std::fs::create_dir_all(&modules).unwrap();
        std::fs::write(modules.join("step-a.yml"), "---\n").unwrap();
        std::fs::write(modules.join("partition.yml"), "---\n").unwrap();

        let registry = StepRegistry::for_family(DistroFamily::Arch)
            .with_theme_modules(theme.path())
            .unwrap();
        let step = registry.resolve("step-a").unwrap();
        assert!(step.theme_aware);
        assert_eq!(step.policy, FailurePolicy::Fatal);
        assert!(matches!(registry.resolve("partition").unwrap().kind, StepKind::BuilderModule { .. }));
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let registry = StepRegistry::for_family(DistroFamily::Debian);
        let err = registry.register(ModuleStep::builder("mount")).unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("mount".into()));
    }
}
