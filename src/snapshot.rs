//! Snapshot planning
//!
//! Turns the requested exclusions into an explicit list of paths to copy.
//! An excluded path never appears in the source list, not even as an
//! ancestor: directories that contain an exclusion are expanded into their
//! children instead.

use crate::command_executor::shell_quote;
use crate::config::{ExcludeSet, HostLayout};
use crate::types::{Compression, ExcludeRegion};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Never copied: virtual filesystems, scratch space and mount points.
pub const ALWAYS_EXCLUDED: &[&str] = &["proc", "sys", "dev", "run", "tmp", "mnt", "media", "lost+found"];

/// Mount points recreated empty in the staged root.
const MOUNT_POINTS: &[&str] = &["proc", "sys", "dev", "run", "tmp", "mnt", "media"];

/// Excluded regions whose directory is kept, empty, in the image.
const EMPTY_WHEN_EXCLUDED: &[&str] = &["home", "usr", "var"];

/// Caches, logs and other state with no place in an image.
const STATIC_PATHS: &[&str] = &[
    "var/cache",
    "var/log",
    "var/tmp",
    "var/lib/apt/lists",
    "var/lib/dnf/repos",
    "var/lib/pacman/sync",
    "root/.cache",
];

/// What to copy, relative to the source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPlan {
    source_root: PathBuf,
    /// Relative paths copied whole.
    pub sources: Vec<PathBuf>,
    /// Relative paths left out.
    pub excluded: Vec<PathBuf>,
    /// Directories recreated empty with their host mode: expanded ancestors
    /// of an exclusion and excluded region roots.
    pub skeleton: Vec<(PathBuf, u32)>,
}

/// Relative paths covered by `region`.
fn region_paths(region: ExcludeRegion, user: Option<&str>) -> Vec<PathBuf> {
    match region {
        ExcludeRegion::Static => STATIC_PATHS.iter().map(PathBuf::from).collect(),
        ExcludeRegion::Home => vec![PathBuf::from("home")],
        ExcludeRegion::Mine => match user {
            Some(user) => vec![Path::new("home").join(user)],
            None => {
                warn!("No primary user known, `mine` excludes nothing");
                Vec::new()
            }
        },
        ExcludeRegion::Usr => vec![PathBuf::from("usr")],
        ExcludeRegion::Var => vec![PathBuf::from("var")],
    }
}

/// Express `path` relative to `root` when it lies inside it.
fn relative_to(path: &Path, root: &Path) -> Option<PathBuf> {
    let rel = path.strip_prefix(root).ok()?;
    let clean: PathBuf = rel
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    (!clean.as_os_str().is_empty()).then_some(clean)
}

impl SnapshotPlan {
    /// Plan a snapshot of `layout.source_root`. `/root` is left out unless
    /// `unsecure`; the working area is always left out.
    pub fn compute(layout: &HostLayout, excludes: &ExcludeSet, unsecure: bool) -> std::io::Result<Self> {
        let mut excluded: Vec<PathBuf> = ALWAYS_EXCLUDED.iter().map(PathBuf::from).collect();
        let work = relative_to(&layout.snapshot_dir, &layout.source_root);
        if let Some(work) = &work {
            excluded.push(work.clone());
        }
        if !unsecure {
            excluded.push(PathBuf::from("root"));
        }
        for region in excludes.iter() {
            excluded.extend(region_paths(region, layout.primary_user.as_deref()));
        }
        excluded.sort();
        excluded.dedup();

        // Only exclusions present on disk force their ancestors apart. The
        // working area counts even before it is created.
        let present: Vec<PathBuf> = excluded
            .iter()
            .filter(|ex| Some(*ex) == work.as_ref() || layout.source_root.join(ex).symlink_metadata().is_ok())
            .cloned()
            .collect();

        let mut sources = Vec::new();
        let mut skeleton = Vec::new();
        let walk = Walk {
            root: &layout.source_root,
            excluded: &excluded,
            present: &present,
        };
        walk.expand(Path::new(""), &mut sources, &mut skeleton)?;
        for region in EMPTY_WHEN_EXCLUDED {
            let rel = PathBuf::from(region);
            if excluded.contains(&rel) {
                if let Some(mode) = dir_mode(&layout.source_root.join(&rel)) {
                    skeleton.push((rel, mode));
                }
            }
        }
        sources.sort();
        skeleton.sort();
        debug!(
            sources = sources.len(),
            excluded = excluded.len(),
            skeleton = skeleton.len(),
            "Snapshot planned"
        );

        Ok(Self {
            source_root: layout.source_root.clone(),
            sources,
            excluded,
            skeleton,
        })
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn is_excluded(&self, rel: &Path) -> bool {
        self.excluded.iter().any(|ex| rel.starts_with(ex))
    }

    /// `rsync` invocation copying every source into `staged_root`, keeping
    /// paths relative to the source root.
    pub fn copy_command(&self, staged_root: &Path) -> String {
        let anchor = self.source_root.join(".");
        let sources: Vec<String> = self
            .sources
            .iter()
            .map(|rel| shell_quote(&anchor.join(rel).display().to_string()))
            .collect();
        format!(
            "rsync -aAXHR --one-file-system {} {}/",
            sources.join(" "),
            shell_quote(&staged_root.display().to_string())
        )
    }

    /// Recreate empty mount points, skeleton directories with their modes
    /// and a locked-down `/root` when it was left out, so the staged root
    /// can boot.
    pub fn skeleton_command(&self, staged_root: &Path) -> String {
        let staged = staged_root.display().to_string();
        let dirs: Vec<String> = MOUNT_POINTS
            .iter()
            .map(|d| shell_quote(&format!("{}/{}", staged, d)))
            .collect();
        let mut cmd = format!("mkdir -p {}", dirs.join(" "));
        for (rel, mode) in &self.skeleton {
            let dir = shell_quote(&format!("{}/{}", staged, rel.display()));
            cmd.push_str(&format!(" && mkdir -p {dir} && chmod {mode:o} {dir}"));
        }
        if self.excluded.iter().any(|p| p == Path::new("root")) {
            let root_home = shell_quote(&format!("{}/root", staged));
            cmd.push_str(&format!(" && mkdir -p {root_home} && chmod 700 {root_home}"));
        }
        cmd
    }
}

/// Permission bits of `path` when it is a real directory.
fn dir_mode(path: &Path) -> Option<u32> {
    let meta = std::fs::symlink_metadata(path).ok()?;
    meta.is_dir().then(|| meta.permissions().mode() & 0o7777)
}

/// Directory walk over the source root.
struct Walk<'a> {
    root: &'a Path,
    excluded: &'a [PathBuf],
    /// Exclusions that exist, or must be treated as existing.
    present: &'a [PathBuf],
}

impl Walk<'_> {
    /// Walk `rel`: excluded entries are dropped, directories holding a
    /// present exclusion are expanded and recorded in `skeleton`, everything
    /// else is taken whole.
    fn expand(&self, rel: &Path, out: &mut Vec<PathBuf>, skeleton: &mut Vec<(PathBuf, u32)>) -> std::io::Result<()> {
        let dir = self.root.join(rel);
        let mut entries: Vec<_> = std::fs::read_dir(&dir)?.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let child = rel.join(entry.file_name());
            if self.excluded.iter().any(|ex| child.starts_with(ex)) {
                continue;
            }
            let contains_exclusion = self.present.iter().any(|ex| ex.starts_with(&child) && ex != &child);
            let is_real_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if contains_exclusion && is_real_dir {
                if let Some(mode) = dir_mode(&self.root.join(&child)) {
                    skeleton.push((child.clone(), mode));
                }
                self.expand(&child, out, skeleton)?;
            } else {
                out.push(child);
            }
        }
        Ok(())
    }
}

/// `mksquashfs` invocation compressing `staged_root` into `image`.
pub fn squash_command(staged_root: &Path, image: &Path, compression: &Compression) -> String {
    format!(
        "mksquashfs {} {} {} -b 1M -noappend",
        shell_quote(&staged_root.display().to_string()),
        shell_quote(&image.display().to_string()),
        compression.mksquashfs_args().join(" ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CompressionProfile;
    use tempfile::TempDir;

    fn fake_root() -> TempDir {
        let dir = TempDir::new().unwrap();
        for d in [
            "etc",
            "usr/bin",
            "var/log",
            "var/lib",
            "home/alice/docs",
            "home/bob",
            "root/.cache",
            "root/.ssh",
            "proc",
            "tmp",
        ] {
            std::fs::create_dir_all(dir.path().join(d)).unwrap();
        }
        dir
    }

    #[test]
    fn test_virtual_filesystems_never_copied() {
        let dir = fake_root();
        let layout = HostLayout::under(dir.path(), None);
        let plan = SnapshotPlan::compute(&layout, &ExcludeSet::new(), true).unwrap();
        assert!(!plan.sources.contains(&PathBuf::from("proc")));
        assert!(!plan.sources.contains(&PathBuf::from("tmp")));
        assert!(plan.sources.contains(&PathBuf::from("etc")));
        assert!(plan.sources.contains(&PathBuf::from("root")));
    }

    #[test]
    fn test_root_left_out_unless_unsecure() {
        let dir = fake_root();
        let layout = HostLayout::under(dir.path(), None);
        let plan = SnapshotPlan::compute(&layout, &ExcludeSet::new(), false).unwrap();
        assert!(plan.sources.iter().all(|s| !s.starts_with("root")));
        assert!(plan.skeleton_command(Path::new("/stage")).contains("chmod 700 /stage/root"));
    }

    #[test]
    fn test_mine_expands_home() {
        let dir = fake_root();
        let layout = HostLayout::under(dir.path(), Some("alice".into()));
        let excludes: ExcludeSet = [ExcludeRegion::Mine].into_iter().collect();
        let plan = SnapshotPlan::compute(&layout, &excludes, true).unwrap();
        assert!(plan.sources.contains(&PathBuf::from("home/bob")));
        assert!(!plan.sources.contains(&PathBuf::from("home")));
        assert!(plan.sources.iter().all(|s| !s.starts_with("home/alice")));
    }

    #[test]
    fn test_working_area_is_never_copied() {
        let dir = fake_root();
        let layout = HostLayout::under(dir.path(), None);
        std::fs::create_dir_all(layout.staged_root()).unwrap();
        let plan = SnapshotPlan::compute(&layout, &ExcludeSet::new(), true).unwrap();
        assert!(plan.sources.iter().all(|s| !s.starts_with("home/liveforge")));
        assert!(plan.sources.contains(&PathBuf::from("home/alice")));
    }

    #[test]
    fn test_working_area_splits_home_before_it_exists() {
        let dir = fake_root();
        let layout = HostLayout::under(dir.path(), None);
        assert!(!layout.snapshot_dir.exists());
        let plan = SnapshotPlan::compute(&layout, &ExcludeSet::new(), true).unwrap();
        assert!(!plan.sources.contains(&PathBuf::from("home")));
        assert!(plan.sources.contains(&PathBuf::from("home/alice")));
    }

    #[test]
    fn test_static_excludes_logs() {
        let dir = fake_root();
        let layout = HostLayout::under(dir.path(), None);
        let excludes: ExcludeSet = [ExcludeRegion::Static].into_iter().collect();
        let plan = SnapshotPlan::compute(&layout, &excludes, true).unwrap();
        assert!(plan.sources.contains(&PathBuf::from("var/lib")));
        assert!(!plan.sources.contains(&PathBuf::from("var/log")));
        assert!(plan.sources.contains(&PathBuf::from("root/.ssh")));
    }

    #[test]
    fn test_directory_holding_only_exclusions_is_recreated() {
        let dir = fake_root();
        std::fs::create_dir_all(dir.path().join("var/lib/apt/lists")).unwrap();
        std::fs::set_permissions(dir.path().join("var/lib"), std::fs::Permissions::from_mode(0o751)).unwrap();
        let layout = HostLayout::under(dir.path(), None);
        let excludes: ExcludeSet = [ExcludeRegion::Static].into_iter().collect();
        let plan = SnapshotPlan::compute(&layout, &excludes, true).unwrap();

        assert!(plan.sources.iter().all(|s| !s.starts_with("var/lib/apt/lists")));
        assert!(plan.skeleton.contains(&(PathBuf::from("var/lib"), 0o751)));
        assert!(plan.skeleton.iter().any(|(p, _)| p == Path::new("var/lib/apt")));
        let skeleton = plan.skeleton_command(Path::new("/stage"));
        assert!(skeleton.contains("mkdir -p /stage/var/lib && chmod 751 /stage/var/lib"));
    }

    #[test]
    fn test_excluded_home_is_recreated_empty() {
        let dir = fake_root();
        let layout = HostLayout::under(dir.path(), None);
        let excludes: ExcludeSet = [ExcludeRegion::Home].into_iter().collect();
        let plan = SnapshotPlan::compute(&layout, &excludes, true).unwrap();

        assert!(plan.sources.iter().all(|s| !s.starts_with("home")));
        assert!(plan.skeleton.iter().any(|(p, _)| p == Path::new("home")));
        assert!(plan.skeleton_command(Path::new("/stage")).contains("mkdir -p /stage/home"));
    }

    #[test]
    fn test_commands() {
        let dir = fake_root();
        let layout = HostLayout::under(dir.path(), None);
        let plan = SnapshotPlan::compute(&layout, &ExcludeSet::new(), true).unwrap();
        let copy = plan.copy_command(Path::new("/stage"));
        assert!(copy.starts_with("rsync -aAXHR --one-file-system "));
        assert!(copy.contains("/./etc"));
        assert!(copy.ends_with(" /stage/"));

        let squash = squash_command(
            Path::new("/stage"),
            Path::new("/out/filesystem.squashfs"),
            &CompressionProfile::Standard.compression(),
        );
        assert_eq!(
            squash,
            "mksquashfs /stage /out/filesystem.squashfs -comp zstd -Xcompression-level 15 -b 1M -noappend"
        );
    }
}
