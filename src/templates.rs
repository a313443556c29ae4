//! Built-in installer module templates
//!
//! Each builder module renders one of these YAML documents into the target
//! root. Placeholders are written `{{key}}` and filled from a
//! `ModuleContext`. A theme may replace any template wholesale by shipping
//! `theme/calamares/modules/<name>.yml`.

use crate::command_executor::CommandExecutor;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Directory (relative to the target root) holding rendered module configs.
pub const MODULES_DIR: &str = "etc/calamares/modules";

/// Location of the installer's polkit policy relative to a root.
const POLICY_RELATIVE_PATH: &str = "usr/share/polkit-1/actions/com.github.calamares.calamares.policy";

/// Path of the installer's polkit policy under `root`.
pub fn installer_policy_path(root: &Path) -> PathBuf {
    root.join(POLICY_RELATIVE_PATH)
}

/// Key/value pairs substituted into templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleContext {
    values: BTreeMap<String, String>,
}

impl ModuleContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Replace every `{{key}}` whose key is known; unknown placeholders stay.
    pub fn render(&self, template: &str) -> String {
        let mut out = template.to_string();
        for (key, value) in &self.values {
            out = out.replace(&format!("{{{{{}}}}}", key), value);
        }
        out
    }
}

/// Built-in template for `module`, if one exists.
pub fn builtin(module: &str) -> Option<&'static str> {
    let template = match module {
        "welcome" => WELCOME,
        "partition" => PARTITION,
        "mount" => MOUNT,
        "unpackfs" => UNPACKFS,
        "sources-yolk" => SOURCES_YOLK,
        "sources-yolk-undo" => SOURCES_YOLK_UNDO,
        "machineid" => MACHINEID,
        "fstab" => FSTAB,
        "locale" => LOCALE,
        "keyboard" => KEYBOARD,
        "localecfg" => "---\n",
        "luksbootkeyfile" => "---\n",
        "users" => USERS,
        "displaymanager" => DISPLAYMANAGER,
        "networkcfg" => "---\n",
        "hwclock" => "---\n",
        "initramfs" => INITRAMFS,
        "grubcfg" => GRUBCFG,
        "bootloader" => BOOTLOADER,
        "removeuser" => REMOVEUSER,
        "cleanup" => CLEANUP,
        "umount" => UMOUNT,
        "finished" => FINISHED,
        _ => return None,
    };
    Some(template)
}

/// Every module with a built-in template.
pub const BUILTIN_MODULES: &[&str] = &[
    "welcome",
    "partition",
    "mount",
    "unpackfs",
    "sources-yolk",
    "sources-yolk-undo",
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
    "initramfs",
    "grubcfg",
    "bootloader",
    "removeuser",
    "cleanup",
    "umount",
    "finished",
];

/// Write every built-in template to `dir` as `<module>.yml`.
pub fn install_builtin(executor: &dyn CommandExecutor, dir: &Path) -> std::io::Result<()> {
    for module in BUILTIN_MODULES {
        if let Some(template) = builtin(module) {
            executor.write_file(&dir.join(format!("{}.yml", module)), template)?;
        }
    }
    Ok(())
}

/// True when `dir` holds a template for every built-in module.
pub fn templates_installed(dir: &Path) -> bool {
    BUILTIN_MODULES
        .iter()
        .all(|module| dir.join(format!("{}.yml", module)).is_file())
}

const WELCOME: &str = r#"---
showSupportUrl: false
showKnownIssuesUrl: false
showReleaseNotesUrl: false
requirements:
  requiredStorage: 5.5
  requiredRam: 1.0
  check:
    - storage
    - ram
    - root
  required:
    - storage
    - ram
    - root
"#;

const PARTITION: &str = r#"---
efiSystemPartition: "/boot/efi"
userSwapChoices:
  - none
  - small
  - suspend
  - file
drawNestedPartitions: false
alwaysShowPartitionLabels: true
initialPartitioningChoice: none
initialSwapChoice: small
defaultFileSystemType: "{{default_filesystem}}"
"#;

const MOUNT: &str = r#"---
extraMounts:
  - device: proc
    fs: proc
    mountPoint: /proc
  - device: sys
    fs: sysfs
    mountPoint: /sys
  - device: /dev
    mountPoint: /dev
    options: bind
  - device: tmpfs
    fs: tmpfs
    mountPoint: /run
  - device: /run/udev
    mountPoint: /run/udev
    options: bind
extraMountsEfi:
  - device: efivarfs
    fs: efivarfs
    mountPoint: /sys/firmware/efi/efivars
"#;

const UNPACKFS: &str = r#"---
unpack:
  - source: "{{squashfs}}"
    sourcefs: squashfs
    destination: ""
"#;

const SOURCES_YOLK: &str = r#"---
dontChroot: false
timeout: 10
script:
  - "echo 'deb [trusted=yes] file:{{yolk_dir}} ./' > /etc/apt/sources.list.d/yolk.list"
  - "-apt-get update"
"#;

const SOURCES_YOLK_UNDO: &str = r#"---
dontChroot: false
timeout: 10
script:
  - "rm -f /etc/apt/sources.list.d/yolk.list"
  - "-apt-get update"
"#;

const MACHINEID: &str = r#"---
systemd: true
dbus: true
symlink: true
"#;

const FSTAB: &str = r#"---
mountOptions:
  default: defaults,noatime
  btrfs: defaults,noatime,compress=zstd
  efi: umask=0077
ssdExtraMountOptions:
  ext4: discard
  btrfs: discard,compress=zstd
crypttabOptions: luks
"#;

const LOCALE: &str = r#"---
region: "{{region}}"
zone: "{{zone}}"
localeGenPath: /etc/locale.gen
geoip:
  style: none
"#;

const KEYBOARD: &str = r#"---
xOrgConfFileName: "/etc/X11/xorg.conf.d/00-keyboard.conf"
convertedKeymapPath: "/lib/kbd/keymaps/xkb"
writeEtcDefaultKeyboard: true
"#;

const USERS: &str = r#"---
defaultGroups:
{{user_groups}}
autologinGroup: autologin
doAutologin: false
sudoersGroup: {{sudoers_group}}
setRootPassword: true
doReusePassword: false
passwordRequirements:
  minLength: 1
  maxLength: -1
allowWeakPasswords: true
userShell: /bin/bash
"#;

const DISPLAYMANAGER: &str = r#"---
displaymanagers:
{{displaymanagers}}
basicSetup: false
sysconfigSetup: false
"#;

const INITRAMFS: &str = r#"---
kernel: all
"#;

const GRUBCFG: &str = r#"---
overwrite: false
keepDistributor: false
defaults:
  GRUB_TIMEOUT: 5
  GRUB_DEFAULT: "saved"
  GRUB_DISABLE_SUBMENU: true
  GRUB_TERMINAL_OUTPUT: "console"
  GRUB_DISABLE_RECOVERY: true
"#;

const BOOTLOADER: &str = r#"---
efiBootLoader: "grub"
kernel: "/vmlinuz"
img: "/initrd.img"
timeout: 10
grubInstall: "{{grub_install}}"
grubMkconfig: "{{grub_mkconfig}}"
grubCfg: "{{grub_cfg}}"
grubProbe: "{{grub_probe}}"
efiBootMgr: "efibootmgr"
efiBootloaderId: "{{distributor}}"
installEFIFallback: true
"#;

const REMOVEUSER: &str = r#"---
username: {{live_user}}
"#;

const CLEANUP: &str = r#"---
dontChroot: false
timeout: 60
script:
  - "-rm -f /etc/sudoers.d/live"
  - "-rm -rf /etc/calamares"
{{cleanup_extra}}
"#;

const UMOUNT: &str = r#"---
srcLog: "/root/.cache/calamares/session.log"
destLog: "/var/log/installation.log"
"#;

const FINISHED: &str = r#"---
restartNowEnabled: true
restartNowChecked: false
restartNowCommand: "systemctl -i reboot"
notifyOnFinished: false
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_fills_known_placeholders() {
        let ctx = ModuleContext::new().with("default_filesystem", "btrfs");
        let rendered = ctx.render(builtin("partition").unwrap());
        assert!(rendered.contains("defaultFileSystemType: \"btrfs\""));
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let ctx = ModuleContext::new();
        assert_eq!(ctx.render("a: {{missing}}"), "a: {{missing}}");
    }

    #[test]
    fn test_every_listed_module_has_a_template() {
        for module in BUILTIN_MODULES {
            assert!(builtin(module).is_some(), "{} has no template", module);
        }
        assert!(builtin("does-not-exist").is_none());
    }

    #[test]
    fn test_install_builtin_writes_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("templates");
        assert!(!templates_installed(&target));
        install_builtin(&crate::command_executor::ShellExecutor::new(), &target).unwrap();
        assert!(target.join("partition.yml").exists());
        assert!(templates_installed(&target));
    }

    #[test]
    fn test_policy_path() {
        let path = installer_policy_path(Path::new("/"));
        assert_eq!(
            path,
            PathBuf::from("/usr/share/polkit-1/actions/com.github.calamares.calamares.policy")
        );
    }
}
