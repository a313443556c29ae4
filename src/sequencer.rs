//! Distro sequencer
//!
//! Composes the fixed installer module order for a distro family, then walks
//! it against a staged root: rendering module configs, applying the package
//! manifest and running host hooks. Each step's failure policy decides
//! whether a failure halts the sequence.

use crate::command_executor::{shell_quote, CommandExecutor, EchoPolicy};
use crate::error::{BuildError, StepError};
use crate::package_backend::PackageBackend;
use crate::package_manifest::{manifest_path, PackageManifest};
use crate::process_guard::CancelToken;
use crate::registry::{FailurePolicy, ModuleStep, ModuleVariant, StepKind, StepRegistry};
use crate::sequence_state::{SequencePhase, SequenceState, SequenceTracker};
use crate::templates::{self, ModuleContext, MODULES_DIR};
use crate::types::DistroFamily;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Pseudo-step name reported when writing the installer settings fails.
pub const SETTINGS_STEP: &str = "settings";

/// Packages removed from the installed system of a release build.
pub const RELEASE_TOOLING: &[&str] = &["calamares", "liveforge"];

/// Live session account when none is configured.
pub const DEFAULT_LIVE_USER: &str = "live";

/// Local repository the `sources-yolk` pair points apt at.
pub const YOLK_DIR: &str = "/var/local/yolk";

/// Display managers probed on the host, in preference order.
const DISPLAY_MANAGERS: &[&str] = &["sddm", "gdm3", "gdm", "lightdm", "lxdm", "slim", "ly"];

/// Modules the installer shows as pages rather than running as jobs.
const SHOW_MODULES: &[&str] = &["welcome", "locale", "keyboard", "partition", "users"];

/// Everything the sequencer needs to know about one run.
#[derive(Debug, Clone)]
pub struct SequenceOptions {
    /// Staged root the configuration is written into.
    pub target_root: PathBuf,
    pub theme: Option<PathBuf>,
    /// Installed distro templates, `<module>.yml`, used before the built-ins.
    pub template_dir: Option<PathBuf>,
    /// Account `removeuser` deletes from the installed system.
    pub live_user: String,
    pub is_clone: bool,
    pub release: bool,
    /// Step names injected after `cleanup`, resolved when they run.
    pub custom_final_steps: Vec<String>,
    /// Boot entry name written into the bootloader config.
    pub distributor: String,
    pub echo: EchoPolicy,
}

impl SequenceOptions {
    pub fn new(target_root: impl Into<PathBuf>) -> Self {
        Self {
            target_root: target_root.into(),
            theme: None,
            template_dir: None,
            live_user: DEFAULT_LIVE_USER.to_string(),
            is_clone: false,
            release: false,
            custom_final_steps: Vec::new(),
            distributor: "liveforge".to_string(),
            echo: EchoPolicy::Silent,
        }
    }
}

/// One entry of a composed sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub name: String,
    pub phase: SequencePhase,
}

/// Ordered step names for one run, each tagged with its phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencePlan {
    family: DistroFamily,
    steps: Vec<PlannedStep>,
}

impl SequencePlan {
    /// Canonical order for `family`. Clones keep their users, so `removeuser`
    /// is left out; custom final steps land between `cleanup` and `umount`.
    pub fn compose(family: DistroFamily, is_clone: bool, custom_final_steps: &[String]) -> Self {
        let debian_like = matches!(family, DistroFamily::Debian | DistroFamily::Ubuntu);
        let mut steps = Vec::new();
        let mut push = |phase: SequencePhase, name: &str| {
            steps.push(PlannedStep {
                name: name.to_string(),
                phase,
            });
        };

        push(SequencePhase::Bootstrapping, "welcome");

        let modules = SequencePhase::ModulesApplying;
        for name in ["partition", "mount", "unpackfs"] {
            push(modules, name);
        }
        if debian_like {
            push(modules, "sources-yolk");
        }
        for name in [
            "machineid",
            "fstab",
            "locale",
            "keyboard",
            "localecfg",
            "luksbootkeyfile",
            "users",
            "displaymanager",
            "networkcfg",
            "hwclock",
            "before_bootloader_mkdirs",
        ] {
            push(modules, name);
        }
        match family {
            DistroFamily::Ubuntu => push(modules, "bug-LP#1829805"),
            DistroFamily::Fedora => push(modules, "dracut"),
            DistroFamily::Debian | DistroFamily::Arch => {}
        }
        for name in ["initramfs", "grubcfg", "before_bootloader", "bootloader", "after_bootloader"] {
            push(modules, name);
        }
        if debian_like {
            push(modules, "add386arch");
        }

        let packages = SequencePhase::PackagesApplying;
        push(packages, "packages");
        if !is_clone {
            push(packages, "removeuser");
        }
        if debian_like {
            push(packages, "sources-yolk-undo");
        }
        push(packages, "cleanup");

        for name in custom_final_steps {
            push(SequencePhase::CustomStepsApplying, name.as_str());
        }

        push(SequencePhase::Finalizing, "umount");
        push(SequencePhase::Finalizing, "finished");

        Self { family, steps }
    }

    pub fn family(&self) -> DistroFamily {
        self.family
    }

    pub fn steps(&self) -> &[PlannedStep] {
        &self.steps
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Display for SequencePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} installer sequence:", self.family)?;
        for (i, step) in self.steps.iter().enumerate() {
            writeln!(f, "  {:>2}. {:<26} [{}]", i + 1, step.name, step.phase)?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct Instance {
    id: String,
    module: &'static str,
    config: String,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct InstallerSettings {
    modules_search: Vec<&'static str>,
    instances: Vec<Instance>,
    sequence: Vec<BTreeMap<&'static str, Vec<String>>>,
    branding: String,
    prompt_install: bool,
    dont_chroot: bool,
}

/// Runs a composed sequence against one target root.
pub struct DistroSequencer<'a> {
    executor: &'a dyn CommandExecutor,
    registry: StepRegistry,
    options: SequenceOptions,
    plan: SequencePlan,
    context: ModuleContext,
    cancel: CancelToken,
    tracker: SequenceTracker,
}

impl<'a> DistroSequencer<'a> {
    pub fn new(
        executor: &'a dyn CommandExecutor,
        registry: StepRegistry,
        options: SequenceOptions,
        cancel: CancelToken,
    ) -> Self {
        let family = registry.family();
        let plan = SequencePlan::compose(family, options.is_clone, &options.custom_final_steps);
        let context = detect_context(executor, family, &options);
        Self {
            executor,
            registry,
            options,
            plan,
            context,
            cancel,
            tracker: SequenceTracker::new(),
        }
    }

    pub fn plan(&self) -> &SequencePlan {
        &self.plan
    }

    pub fn context(&self) -> &ModuleContext {
        &self.context
    }

    pub fn state(&self) -> &SequenceState {
        self.tracker.state()
    }

    pub fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    /// Run every planned step. The first fatal failure (or a cancellation
    /// observed between steps) halts the sequence; nothing is unmounted.
    pub fn run(&mut self) -> Result<(), BuildError> {
        info!(
            family = %self.plan.family(),
            root = %self.options.target_root.display(),
            steps = self.plan.len(),
            "Starting installer sequence"
        );

        if self.cancel.is_cancelled() {
            return Err(self.halt(SETTINGS_STEP, StepError::Cancelled));
        }
        self.advance_to(SETTINGS_STEP, SequencePhase::Bootstrapping)?;
        if let Err(cause) = self.bootstrap() {
            return Err(self.halt(SETTINGS_STEP, cause));
        }

        let planned = self.plan.steps().to_vec();
        for entry in &planned {
            if self.cancel.is_cancelled() {
                return Err(self.halt(&entry.name, StepError::Cancelled));
            }
            self.advance_to(&entry.name, entry.phase)?;

            let step = match self.registry.resolve(&entry.name) {
                Ok(step) => step.clone(),
                Err(_) => return Err(self.halt(&entry.name, StepError::Unresolved(entry.name.clone()))),
            };

            match self.execute_step(&step) {
                Ok(()) => debug!(step = step.name.as_str(), "Step done"),
                Err(cause) => match step.policy {
                    FailurePolicy::Fatal => return Err(self.halt(&step.name, cause)),
                    FailurePolicy::BestEffort => {
                        warn!(step = step.name.as_str(), "Hook failed, continuing: {}", cause);
                    }
                },
            }
        }

        self.advance_to("finished", SequencePhase::Done)?;
        info!("Installer sequence complete");
        Ok(())
    }

    /// Perform one step without consulting its failure policy.
    pub fn execute_step(&self, step: &ModuleStep) -> Result<(), StepError> {
        debug!(step = %step, "Executing");
        match &step.kind {
            StepKind::BuilderModule { module } => {
                let template = self.template_for(step, module)?;
                self.write_module(module, &self.context.render(&template))
            }
            StepKind::CalamaresModule { module, variant } => {
                let config = match variant {
                    ModuleVariant::Apply => module.clone(),
                    ModuleVariant::Undo => format!("{}-undo", module),
                };
                let template = self.template_for(step, &config)?;
                self.write_module(&config, &self.context.render(&template))
            }
            StepKind::PackageOperation => self.apply_packages(),
            StepKind::ShellHook { command } => {
                let root = shell_quote(&self.options.target_root.display().to_string());
                let command = command.replace("{{root}}", &root);
                self.executor.run(&command, self.options.echo)?;
                Ok(())
            }
        }
    }

    fn halt(&mut self, step: &str, cause: StepError) -> BuildError {
        error!(step, "Installer step failed: {}", cause);
        if let Err(e) = self.tracker.fail(step, cause.clone()) {
            debug!("Failure not recorded: {}", e);
        }
        BuildError::SequencerFailed {
            step: step.to_string(),
            cause,
        }
    }

    /// Walk forward one phase at a time until `target` is reached.
    fn advance_to(&mut self, step: &str, target: SequencePhase) -> Result<(), BuildError> {
        while self.tracker.phase() < target {
            let Some(next) = self.tracker.phase().next() else {
                break;
            };
            if let Err(e) = self.tracker.transition_to(next) {
                return Err(self.halt(step, StepError::OutOfOrder(e.to_string())));
            }
        }
        if self.tracker.phase() != target {
            let reason = format!("{} belongs to {} but sequence is at {}", step, target, self.tracker.phase());
            return Err(self.halt(step, StepError::OutOfOrder(reason)));
        }
        Ok(())
    }

    fn theme_override(&self, config: &str) -> Option<PathBuf> {
        let theme = self.options.theme.as_ref()?;
        let path = theme
            .join("theme")
            .join("calamares")
            .join("modules")
            .join(format!("{}.yml", config));
        path.is_file().then_some(path)
    }

    /// Theme override when the step is theme-aware and one exists, then the
    /// installed distro template, then the built-in one.
    fn template_for(&self, step: &ModuleStep, config: &str) -> Result<String, StepError> {
        if step.theme_aware {
            if let Some(path) = self.theme_override(config) {
                debug!(config, path = %path.display(), "Using theme override");
                return std::fs::read_to_string(&path).map_err(|e| StepError::io(path, e));
            }
        }
        if let Some(dir) = &self.options.template_dir {
            let path = dir.join(format!("{}.yml", config));
            if path.is_file() {
                debug!(config, path = %path.display(), "Using installed template");
                return std::fs::read_to_string(&path).map_err(|e| StepError::io(path, e));
            }
        }
        templates::builtin(config)
            .map(str::to_string)
            .ok_or_else(|| StepError::MissingTemplate(config.to_string()))
    }

    fn write_module(&self, config: &str, contents: &str) -> Result<(), StepError> {
        let path = self
            .options
            .target_root
            .join(MODULES_DIR)
            .join(format!("{}.conf", config));
        self.executor
            .write_file(&path, contents)
            .map_err(|e| StepError::io(path, e))
    }

    /// Write `settings.conf` and the package manifest. A theme manifest
    /// replaces the one in the target; a default is written when there is
    /// none. Release builds always get the tooling removal added.
    fn bootstrap(&self) -> Result<(), StepError> {
        let settings = self.render_settings()?;
        let path = self.options.target_root.join("etc/calamares/settings.conf");
        self.executor
            .write_file(&path, &settings)
            .map_err(|e| StepError::io(path, e))?;

        let path = manifest_path(&self.options.target_root);
        let (mut manifest, mut dirty) = match self.theme_override("packages") {
            Some(themed) => {
                let contents = std::fs::read_to_string(&themed).map_err(|e| StepError::io(&themed, e))?;
                let manifest = PackageManifest::parse(&themed, &contents).map_err(|e| StepError::Manifest(e.to_string()))?;
                (manifest, true)
            }
            None => match PackageManifest::load(&self.options.target_root)
                .map_err(|e| StepError::Manifest(e.to_string()))?
            {
                Some(existing) => (existing, false),
                None => (
                    PackageManifest::for_build(self.plan.family().backend(), self.options.release, RELEASE_TOOLING),
                    true,
                ),
            },
        };
        if self.options.release && manifest.ensure_removed(RELEASE_TOOLING) {
            info!(tooling = ?RELEASE_TOOLING, "Release build, tooling removed after install");
            dirty = true;
        }
        if !dirty {
            return Ok(());
        }

        let yaml = manifest.to_yaml().map_err(|e| StepError::Render {
            module: "packages".into(),
            message: e.to_string(),
        })?;
        self.executor
            .write_file(&path, &yaml)
            .map_err(|e| StepError::io(&path, e))
    }

    fn render_settings(&self) -> Result<String, StepError> {
        let mut instances = Vec::new();
        let mut show: Vec<String> = Vec::new();
        let mut exec: Vec<String> = Vec::new();

        for entry in self.plan.steps() {
            if SHOW_MODULES.contains(&entry.name.as_str()) {
                // A clone carries its users over, so there is no users page.
                if !(self.options.is_clone && entry.name == "users") {
                    show.push(entry.name.clone());
                }
                continue;
            }
            if entry.name == "finished" {
                continue;
            }
            // Custom steps may only exist in the theme; they still get an instance.
            let kind = self.registry.resolve(&entry.name).map(|s| s.kind.clone()).unwrap_or_else(|_| {
                StepKind::CalamaresModule {
                    module: entry.name.clone(),
                    variant: ModuleVariant::Apply,
                }
            });
            match kind {
                StepKind::BuilderModule { module } => exec.push(module),
                StepKind::PackageOperation => exec.push("packages".to_string()),
                StepKind::ShellHook { .. } => {}
                StepKind::CalamaresModule { module, variant } => {
                    let config = match variant {
                        ModuleVariant::Apply => module,
                        ModuleVariant::Undo => format!("{}-undo", module),
                    };
                    exec.push(format!("shellprocess@{}", config));
                    instances.push(Instance {
                        id: config.clone(),
                        module: "shellprocess",
                        config: format!("{}.conf", config),
                    });
                }
            }
        }
        show.push("summary".to_string());

        let branding = self
            .options
            .theme
            .as_ref()
            .and_then(|t| t.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "liveforge".to_string());

        let settings = InstallerSettings {
            modules_search: vec!["local", "/usr/lib/calamares/modules"],
            instances,
            sequence: vec![
                BTreeMap::from([("show", show)]),
                BTreeMap::from([("exec", exec)]),
                BTreeMap::from([("show", vec!["finished".to_string()])]),
            ],
            branding,
            prompt_install: false,
            dont_chroot: false,
        };
        serde_yaml::to_string(&settings).map_err(|e| StepError::Render {
            module: SETTINGS_STEP.into(),
            message: e.to_string(),
        })
    }

    /// Read the manifest fresh and apply removals, then installs, inside the
    /// target root.
    fn apply_packages(&self) -> Result<(), StepError> {
        let root = self.options.target_root.as_path();
        let Some(manifest) = PackageManifest::load(root).map_err(|e| StepError::Manifest(e.to_string()))? else {
            info!("No package manifest in target, nothing to apply");
            return Ok(());
        };
        let set = manifest
            .operation_set()
            .map_err(|e| StepError::Manifest(e.to_string()))?;
        if set.is_empty() {
            debug!("Package manifest is empty");
            return Ok(());
        }

        info!(
            backend = %set.backend,
            remove = set.remove.len(),
            install = set.install.len(),
            "Applying package manifest"
        );
        let packages = PackageBackend::new(self.executor);
        packages.remove(set.backend, &set.remove, Some(root), self.options.echo)?;
        packages.install(set.backend, &set.install, Some(root), self.options.echo)?;
        Ok(())
    }
}

/// Probe the host and target for values the module templates need.
fn detect_context(executor: &dyn CommandExecutor, family: DistroFamily, options: &SequenceOptions) -> ModuleContext {
    let backend = family.backend();
    let packages = PackageBackend::new(executor);

    let filesystem = if packages.is_installed(backend, "btrfs-progs", None) {
        "btrfs"
    } else {
        "ext4"
    };

    let managers: Vec<&str> = DISPLAY_MANAGERS
        .iter()
        .copied()
        .filter(|dm| packages.is_installed(backend, dm, None))
        .collect();
    let managers = if managers.is_empty() {
        "  []".to_string()
    } else {
        managers
            .iter()
            .map(|dm| format!("  - {}", dm))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let (region, zone) = host_timezone(&options.target_root);

    let (groups, sudoers): (&[&str], &str) = match family {
        DistroFamily::Debian | DistroFamily::Ubuntu => {
            (&["adm", "cdrom", "sudo", "dip", "plugdev", "lpadmin", "audio", "video"], "sudo")
        }
        DistroFamily::Arch | DistroFamily::Fedora => (&["wheel", "audio", "video", "storage", "network"], "wheel"),
    };
    let groups = groups
        .iter()
        .map(|g| format!("  - {}", g))
        .collect::<Vec<_>>()
        .join("\n");

    let grub = if family == DistroFamily::Fedora { "grub2" } else { "grub" };

    let cleanup_extra = if options.release {
        "  - \"-rm -rf /usr/share/liveforge\"".to_string()
    } else {
        String::new()
    };

    ModuleContext::new()
        .with("default_filesystem", filesystem)
        .with("displaymanagers", managers)
        .with("squashfs", live_squashfs(family))
        .with("yolk_dir", YOLK_DIR)
        .with("region", region)
        .with("zone", zone)
        .with("user_groups", groups)
        .with("sudoers_group", sudoers)
        .with("grub_install", format!("{}-install", grub))
        .with("grub_mkconfig", format!("{}-mkconfig", grub))
        .with("grub_cfg", format!("/boot/{}/grub.cfg", grub))
        .with("grub_probe", format!("{}-probe", grub))
        .with("distributor", options.distributor.as_str())
        .with("live_user", options.live_user.as_str())
        .with("cleanup_extra", cleanup_extra)
}

/// Where the live medium exposes the image at install time.
fn live_squashfs(family: DistroFamily) -> &'static str {
    match family {
        DistroFamily::Debian | DistroFamily::Ubuntu => "/run/live/medium/live/filesystem.squashfs",
        DistroFamily::Arch => "/run/archiso/bootmnt/live/filesystem.squashfs",
        DistroFamily::Fedora => "/run/initramfs/live/live/filesystem.squashfs",
    }
}

/// `(region, zone)` from `/etc/timezone` or the `/etc/localtime` link.
pub fn host_timezone(root: &Path) -> (String, String) {
    let from_file = std::fs::read_to_string(root.join("etc/timezone"))
        .ok()
        .map(|s| s.trim().to_string());
    let from_link = || {
        std::fs::read_link(root.join("etc/localtime"))
            .ok()
            .and_then(|target| {
                let target = target.to_string_lossy().into_owned();
                target.split_once("zoneinfo/").map(|(_, tz)| tz.to_string())
            })
    };
    from_file
        .filter(|tz| tz.contains('/'))
        .or_else(from_link)
        .and_then(|tz| {
            tz.split_once('/')
                .map(|(region, zone)| (region.to_string(), zone.to_string()))
        })
        .unwrap_or_else(|| ("Etc".to_string(), "UTC".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;
    use tempfile::TempDir;

    #[test]
    fn test_mount_precedes_unpackfs_for_every_family() {
        for family in DistroFamily::iter() {
            let plan = SequencePlan::compose(family, false, &[]);
            assert!(plan.position("mount").unwrap() < plan.position("unpackfs").unwrap());
        }
    }

    #[test]
    fn test_family_differences() {
        let arch = SequencePlan::compose(DistroFamily::Arch, false, &[]);
        assert!(arch.position("add386arch").is_none());
        assert!(arch.position("sources-yolk").is_none());

        let ubuntu = SequencePlan::compose(DistroFamily::Ubuntu, false, &[]);
        let bug = ubuntu.position("bug-LP#1829805").unwrap();
        assert!(ubuntu.position("before_bootloader_mkdirs").unwrap() < bug);
        assert!(bug < ubuntu.position("initramfs").unwrap());

        let fedora = SequencePlan::compose(DistroFamily::Fedora, false, &[]);
        assert!(fedora.position("dracut").is_some());
        assert!(fedora.position("add386arch").is_none());
    }

    #[test]
    fn test_yolk_pair_ordering() {
        let plan = SequencePlan::compose(DistroFamily::Debian, false, &[]);
        let apply = plan.position("sources-yolk").unwrap();
        let undo = plan.position("sources-yolk-undo").unwrap();
        assert!(apply < plan.position("cleanup").unwrap());
        assert!(plan.position("packages").unwrap() < undo);
        assert!(undo < plan.position("cleanup").unwrap());
    }

    #[test]
    fn test_clone_drops_removeuser() {
        let plan = SequencePlan::compose(DistroFamily::Debian, true, &[]);
        assert!(plan.position("removeuser").is_none());
        let plan = SequencePlan::compose(DistroFamily::Debian, false, &[]);
        assert!(plan.position("removeuser").is_some());
    }

    #[test]
    fn test_phases_are_monotonic() {
        let cfs = vec!["step-a".to_string()];
        for family in DistroFamily::iter() {
            let plan = SequencePlan::compose(family, false, &cfs);
            let phases: Vec<_> = plan.steps().iter().map(|s| s.phase).collect();
            assert!(phases.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(plan.names().last(), Some(&"finished"));
        }
    }

    #[test]
    fn test_host_timezone_from_file_and_link() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        assert_eq!(host_timezone(dir.path()), ("Etc".into(), "UTC".into()));

        std::os::unix::fs::symlink("/usr/share/zoneinfo/Europe/Rome", dir.path().join("etc/localtime")).unwrap();
        assert_eq!(host_timezone(dir.path()), ("Europe".into(), "Rome".into()));

        std::fs::write(dir.path().join("etc/timezone"), "America/New_York\n").unwrap();
        assert_eq!(host_timezone(dir.path()), ("America".into(), "New_York".into()));
    }

    #[test]
    fn test_live_squashfs_paths_are_absolute() {
        for family in DistroFamily::iter() {
            assert!(live_squashfs(family).starts_with("/run/"));
        }
    }
}
