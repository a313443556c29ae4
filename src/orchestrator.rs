//! Production orchestrator
//!
//! `prepare` validates a request into an immutable build; nothing on the
//! host changes until `produce`. `produce` snapshots the source root into a
//! staged root, configures the installer in it and compresses the result, or
//! in script-only mode records the same commands as shell scripts.
//! `abort_cleanup` is the only path that unwinds staging mounts after a
//! failure.

use crate::command_executor::{shell_quote, CommandExecutor, EchoPolicy, ScriptRecorder};
use crate::config::{self, BuildConfiguration, BuildRequest, HostLayout};
use crate::error::{BuildError, ConfigError};
use crate::preflight::Prerequisite;
use crate::process_guard::CancelToken;
use crate::prompt::Confirm;
use crate::registry::StepRegistry;
use crate::sequencer::{DistroSequencer, SequenceOptions, SequencePlan};
use crate::snapshot::{self, SnapshotPlan};
use crate::types::{Compression, CompressionProfile, DistroFamily};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Filesystems bound into the staged root while the installer is configured.
const STAGING_BINDS: &[&str] = &["proc", "sys", "dev"];

/// Script sections written in script-only mode.
pub const SCRIPT_SECTIONS: &[&str] = &["snapshot", "installer", "mksquashfs"];

/// A validated build, ready for `produce`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBuild {
    pub config: BuildConfiguration,
    pub compression: Compression,
    /// `<prefix><basename>_<arch>`
    pub image_name: String,
    pub family: DistroFamily,
    pub custom_final_steps: Vec<String>,
    /// Unmet prerequisites the operator agreed to have remedied.
    pub confirmed_prerequisites: Vec<Prerequisite>,
}

impl PreparedBuild {
    /// Installer sequence this build will run, if it runs one.
    pub fn installer_plan(&self) -> SequencePlan {
        SequencePlan::compose(self.family, self.config.is_clone(), &self.custom_final_steps)
    }
}

/// What a successful `produce` left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Image { path: PathBuf, compression: Compression },
    Scripts { dir: PathBuf, files: Vec<PathBuf> },
}

impl Artifact {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Image { .. } => "image",
            Self::Scripts { .. } => "scripts",
        }
    }
}

/// UEFI-style name of the running architecture.
pub fn uefi_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "i386",
        "aarch64" => "arm64",
        "riscv64" => "riscv64",
        other => other,
    }
}

fn host_basename() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .map(|name| name.split('.').next().unwrap_or_default().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "liveforge".to_string())
}

/// Runs builds against one host layout.
pub struct Producer<'a> {
    executor: &'a dyn CommandExecutor,
    confirm: &'a dyn Confirm,
    layout: HostLayout,
    cancel: CancelToken,
    /// Active staging binds, in mount order.
    mounts: Vec<PathBuf>,
}

impl<'a> Producer<'a> {
    pub fn new(
        executor: &'a dyn CommandExecutor,
        confirm: &'a dyn Confirm,
        layout: HostLayout,
        cancel: CancelToken,
    ) -> Self {
        Self {
            executor,
            confirm,
            layout,
            cancel,
            mounts: Vec::new(),
        }
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    /// Staging binds still mounted.
    pub fn active_mounts(&self) -> &[PathBuf] {
        &self.mounts
    }

    /// Validate `request`. Never touches the host.
    pub fn prepare(&self, request: BuildRequest) -> Result<PreparedBuild, ConfigError> {
        let clone_mode = request.clone_mode()?;

        let addons = config::resolve_addons(&request.addons, &self.layout)?;
        let mut theme_ref = request.theme.clone();
        if let Some(themed) = addons.iter().find(|a| a.name == "theme") {
            debug!(vendor = themed.vendor.as_str(), "Theme taken from addon");
            theme_ref = Some(themed.vendor.clone());
        }
        let theme = theme_ref
            .as_deref()
            .map(|t| config::resolve_theme(t, &self.layout))
            .transpose()?;

        let desktop_links = config::validate_links(&request.links, &self.layout);

        // Steps given by the caller win over the theme's list.
        let custom_final_steps = match (&theme, request.custom_final_steps.is_empty()) {
            (Some(theme), true) => config::theme_custom_steps(theme)?,
            _ => request.custom_final_steps.clone(),
        };

        let compression = if request.release {
            CompressionProfile::Max
        } else {
            request.compression
        };

        let family = match request.distro {
            Some(family) => family,
            None => config::detect_distro(&self.layout.source_root)?,
        };

        config::check_name_part("prefix", &request.prefix)?;
        config::check_name_part("basename", request.basename.trim())?;
        config::check_user_name(&request.live_user)?;

        let basename = if request.basename.trim().is_empty() {
            host_basename()
        } else {
            request.basename.trim().to_string()
        };
        let image_name = format!("{}{}_{}", request.prefix, basename, uefi_arch());

        let unmet = Prerequisite::unmet(&self.layout, family, false);
        if !unmet.is_empty() {
            let names = unmet.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ");
            if !request.interactive {
                return Err(ConfigError::MissingPrerequisite(names));
            }
            let accepted = self
                .confirm
                .confirm(&format!("Missing prerequisites: {}. Install them now?", names))
                .unwrap_or_else(|e| {
                    warn!("Confirmation failed: {}", e);
                    false
                });
            if !accepted {
                return Err(ConfigError::MissingPrerequisite(names));
            }
        }
        let mut confirmed = unmet;
        for renewal in Prerequisite::unmet(&self.layout, family, request.yolk_renew) {
            if !confirmed.contains(&renewal) {
                info!(prerequisite = %renewal, "Renewal requested");
                confirmed.push(renewal);
            }
        }

        let config = BuildConfiguration {
            prefix: request.prefix,
            basename,
            theme,
            compression,
            clone_mode,
            excludes: request.excludes.into_iter().collect(),
            addons,
            desktop_links,
            interactive: request.interactive,
            unsecure: request.unsecure || clone_mode.is_clone(),
            release: request.release,
            script_only: request.script_only,
            verbose: request.verbose,
            live_user: request.live_user,
            yolk_renew: request.yolk_renew,
        };
        info!(
            image = image_name.as_str(),
            %family,
            compression = %config.compression,
            clone = %config.clone_mode,
            "Build prepared"
        );

        Ok(PreparedBuild {
            compression: config.compression.compression(),
            config,
            image_name,
            family,
            custom_final_steps,
            confirmed_prerequisites: confirmed,
        })
    }

    /// Run the build. Yields an image, or scripts in script-only mode.
    pub fn produce(&mut self, build: &PreparedBuild) -> Result<Artifact, BuildError> {
        if !build.config.script_only {
            let executor = self.executor;
            self.build(executor, None, build)?;
            let path = self.layout.image_path(&build.image_name);
            return Ok(Artifact::Image {
                path,
                compression: build.compression,
            });
        }

        let recorder = ScriptRecorder::new(self.executor);
        let recorded = self.build(&recorder, Some(&recorder), build);
        // Recorded binds were never mounted.
        self.mounts.clear();
        recorded?;

        let dir = self.layout.scripts_dir();
        std::fs::create_dir_all(&dir).map_err(|e| BuildError::io(&dir, e))?;
        let mut files = Vec::new();
        for (name, lines) in recorder.sections() {
            let path = dir.join(format!("{}.sh", name));
            std::fs::write(&path, ScriptRecorder::render(&name, &lines)).map_err(|e| BuildError::io(&path, e))?;
            set_executable(&path).map_err(|e| BuildError::io(&path, e))?;
            files.push(path);
        }
        Ok(Artifact::Scripts { dir, files })
    }

    fn build(
        &mut self,
        exec: &dyn CommandExecutor,
        recorder: Option<&ScriptRecorder<'_>>,
        build: &PreparedBuild,
    ) -> Result<(), BuildError> {
        let echo = EchoPolicy::from_verbose(build.config.verbose);
        let section = |name: &str| {
            if let Some(recorder) = recorder {
                recorder.section(name);
            }
        };
        let staged = self.layout.staged_root();

        self.check_cancelled()?;
        section("snapshot");
        for prerequisite in &build.confirmed_prerequisites {
            prerequisite.remedy(exec, &self.layout, echo)?;
        }

        let plan = SnapshotPlan::compute(&self.layout, &build.config.excludes, build.config.unsecure)
            .map_err(|e| BuildError::io(&self.layout.source_root, e))?;
        info!(sources = plan.sources.len(), "Copying snapshot into {}", staged.display());
        exec.run(&format!("mkdir -p {}", quote_path(&staged)), echo)?;
        exec.run(&plan.copy_command(&staged), echo)?;
        exec.run(&plan.skeleton_command(&staged), echo)?;
        self.install_links(exec, &staged, &build.config.desktop_links)?;

        if build.config.is_clone() {
            info!("Clone build: users and data kept, installer not configured");
        } else {
            self.check_cancelled()?;
            section("installer");
            self.bind_staging(exec, &staged, echo)?;

            let registry = match &build.config.theme {
                Some(theme) => StepRegistry::for_family(build.family)
                    .with_theme_modules(theme)
                    .map_err(|e| BuildError::io(theme, e))?,
                None => StepRegistry::for_family(build.family),
            };
            let options = SequenceOptions {
                target_root: staged.clone(),
                theme: build.config.theme.clone(),
                template_dir: Some(self.layout.template_dir.clone()),
                live_user: build.config.live_user.clone(),
                is_clone: false,
                release: build.config.release,
                custom_final_steps: build.custom_final_steps.clone(),
                distributor: build.config.basename.clone(),
                echo,
                ..SequenceOptions::new(&staged)
            };
            let mut sequencer = DistroSequencer::new(exec, registry, options, self.cancel.clone());
            sequencer.run()?;

            self.unbind_staging(exec, echo)?;
        }

        self.check_cancelled()?;
        section("mksquashfs");
        let image = self.layout.image_path(&build.image_name);
        if let Some(parent) = image.parent() {
            exec.run(&format!("mkdir -p {}", quote_path(parent)), echo)?;
        }
        info!(image = %image.display(), "Compressing with {}", build.compression.algorithm);
        exec.run(&snapshot::squash_command(&staged, &image, &build.compression), echo)?;
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), BuildError> {
        if self.cancel.is_cancelled() {
            warn!("Build cancelled");
            return Err(BuildError::Cancelled);
        }
        Ok(())
    }

    /// Copy the requested `.desktop` entries onto the live user's desktop.
    fn install_links(&self, exec: &dyn CommandExecutor, staged: &Path, links: &[String]) -> Result<(), BuildError> {
        if links.is_empty() {
            return Ok(());
        }
        let desktop = staged.join("etc/skel/Desktop");
        let sources: Vec<String> = links
            .iter()
            .map(|l| quote_path(&self.layout.applications_dir.join(format!("{}.desktop", l))))
            .collect();
        exec.run(
            &format!(
                "mkdir -p {desktop} && cp {} {desktop}/",
                sources.join(" "),
                desktop = quote_path(&desktop)
            ),
            EchoPolicy::Silent,
        )?;
        Ok(())
    }

    fn bind_staging(&mut self, exec: &dyn CommandExecutor, staged: &Path, echo: EchoPolicy) -> Result<(), BuildError> {
        for fs in STAGING_BINDS {
            let target = staged.join(fs);
            exec.run(
                &format!("mount --bind /{} {}", fs, quote_path(&target)),
                echo,
            )?;
            self.mounts.push(target);
        }
        Ok(())
    }

    fn unbind_staging(&mut self, exec: &dyn CommandExecutor, echo: EchoPolicy) -> Result<(), BuildError> {
        while let Some(target) = self.mounts.last() {
            exec.run(&format!("umount {}", quote_path(target)), echo)?;
            self.mounts.pop();
        }
        Ok(())
    }

    /// Report completion; the artifact must match the requested mode.
    pub fn finished(&self, artifact: &Artifact, script_only: bool) -> Result<(), BuildError> {
        let expected = if script_only { "scripts" } else { "image" };
        if artifact.kind() != expected {
            return Err(BuildError::ArtifactMismatch {
                expected,
                actual: artifact.kind(),
            });
        }
        match artifact {
            Artifact::Image { path, compression } => {
                info!(
                    image = %path.display(),
                    algorithm = compression.algorithm,
                    "Live image ready"
                );
            }
            Artifact::Scripts { dir, files } => {
                info!(dir = %dir.display(), scripts = files.len(), "Build scripts written");
            }
        }
        Ok(())
    }

    /// Lazily unmount every staging bind in reverse order. Failures are
    /// logged and the remaining binds are still attempted.
    pub fn abort_cleanup(&mut self) {
        if self.mounts.is_empty() {
            return;
        }
        warn!("Unwinding {} staging mount(s)", self.mounts.len());
        while let Some(target) = self.mounts.pop() {
            if let Err(e) = self.executor.run(&format!("umount -l {}", quote_path(&target)), EchoPolicy::Silent) {
                warn!(mount = %target.display(), "Lazy unmount failed: {}", e);
            }
        }
    }
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.display().to_string())
}

fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}
