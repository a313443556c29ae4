//! Configuration file handling for saving and loading produce configs.
//!
//! Files are YAML or JSON, chosen by extension (`.json` is JSON, anything
//! else YAML). Values use the same enums as the command line, so a typo in a
//! compression profile or exclude region fails at load time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::{self, AddonSpec, BuildRequest};
use crate::types::{CompressionProfile, DistroFamily, ExcludeRegion};

/// Produce configuration that can be saved/loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProduceConfig {
    // Naming
    pub prefix: String,
    pub basename: String,

    // Look
    pub theme: Option<String>,
    pub addons: Vec<String>,
    pub links: Vec<String>,

    // Image
    pub compression: CompressionProfile,
    pub excludes: Vec<ExcludeRegion>,
    pub clone: bool,
    pub crypted_clone: bool,
    pub unsecure: bool,
    pub release: bool,
    pub live_user: String,
    pub yolk_renew: bool,

    // Run
    pub interactive: bool,
    pub script_only: bool,
    pub verbose: bool,
    pub distro: Option<DistroFamily>,
    pub custom_final_steps: Vec<String>,
}

impl Default for ProduceConfig {
    fn default() -> Self {
        Self::from(&BuildRequest::default())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

impl ProduceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save configuration, as JSON or YAML depending on the extension
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = if is_json(path) {
            serde_json::to_string_pretty(self).context("Failed to serialize configuration to JSON")?
        } else {
            serde_yaml::to_string(self).context("Failed to serialize configuration to YAML")?
        };

        fs::write(path, content)
            .with_context(|| format!("Failed to write configuration to {:?}", path))?;

        Ok(())
    }

    /// Load configuration, as JSON or YAML depending on the extension
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration from {:?}", path))?;

        let config: Self = if is_json(path) {
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?
        } else {
            serde_yaml::from_str(&content).context("Failed to parse configuration YAML")?
        };

        Ok(config)
    }

    /// Checks that need no access to the host
    pub fn validate(&self) -> Result<()> {
        if self.clone && self.crypted_clone {
            anyhow::bail!("clone and crypted_clone are mutually exclusive");
        }

        config::check_name_part("prefix", &self.prefix)?;
        config::check_name_part("basename", &self.basename)?;
        config::check_user_name(&self.live_user)?;

        for addon in &self.addons {
            AddonSpec::parse(addon).with_context(|| format!("Invalid addon {:?}", addon))?;
        }

        if let Some(theme) = &self.theme {
            if theme.trim().is_empty() {
                anyhow::bail!("Theme cannot be empty when set");
            }
        }

        for step in &self.custom_final_steps {
            if step.trim().is_empty() || step.contains(char::is_whitespace) {
                anyhow::bail!("Invalid custom final step name: {:?}", step);
            }
        }

        Ok(())
    }

    pub fn into_request(self) -> BuildRequest {
        BuildRequest {
            prefix: self.prefix,
            basename: self.basename,
            theme: self.theme,
            compression: self.compression,
            clone: self.clone,
            crypted_clone: self.crypted_clone,
            excludes: self.excludes,
            addons: self.addons,
            links: self.links,
            interactive: self.interactive,
            unsecure: self.unsecure,
            release: self.release,
            script_only: self.script_only,
            verbose: self.verbose,
            custom_final_steps: self.custom_final_steps,
            distro: self.distro,
            live_user: self.live_user,
            yolk_renew: self.yolk_renew,
        }
    }
}

impl From<&BuildRequest> for ProduceConfig {
    fn from(request: &BuildRequest) -> Self {
        Self {
            prefix: request.prefix.clone(),
            basename: request.basename.clone(),
            theme: request.theme.clone(),
            addons: request.addons.clone(),
            links: request.links.clone(),
            compression: request.compression,
            excludes: request.excludes.clone(),
            clone: request.clone,
            crypted_clone: request.crypted_clone,
            unsecure: request.unsecure,
            release: request.release,
            interactive: request.interactive,
            script_only: request.script_only,
            verbose: request.verbose,
            distro: request.distro,
            custom_final_steps: request.custom_final_steps.clone(),
            live_user: request.live_user.clone(),
            yolk_renew: request.yolk_renew,
        }
    }
}

/// Read an ordered list of step names from a YAML sequence.
pub fn load_step_list<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read step list from {:?}", path))?;
    let steps: Vec<String> = serde_yaml::from_str(&content)
        .with_context(|| format!("Step list {:?} is not a YAML list of names", path))?;
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn create_test_config() -> ProduceConfig {
        ProduceConfig {
            prefix: "egg-of-".into(),
            basename: "colibri".into(),
            compression: CompressionProfile::Max,
            excludes: vec![ExcludeRegion::Var, ExcludeRegion::Static],
            addons: vec!["adapt".into()],
            custom_final_steps: vec!["step-a".into(), "step-b".into()],
            ..ProduceConfig::default()
        }
    }

    #[test]
    fn test_default_matches_request_default() {
        let config = ProduceConfig::default();
        assert!(config.interactive);
        assert_eq!(config.compression, CompressionProfile::Fast);
        assert_eq!(config.into_request(), BuildRequest::default());
    }

    #[test]
    fn test_save_and_load_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("produce.yaml");
        let config = create_test_config();
        config.save_to_file(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("compression: max"));

        let loaded = ProduceConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_save_and_load_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("produce.json");
        let config = create_test_config();
        config.save_to_file(&path).unwrap();
        assert_eq!(ProduceConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let mut file = NamedTempFile::with_suffix(".yml").unwrap();
        file.write_all(b"basename: colibri\nexcludes: [usr, var]\n").unwrap();
        file.flush().unwrap();

        let loaded = ProduceConfig::load_from_file(file.path()).unwrap();
        assert_eq!(loaded.basename, "colibri");
        assert_eq!(loaded.excludes, vec![ExcludeRegion::Usr, ExcludeRegion::Var]);
        assert!(loaded.interactive);
    }

    #[test]
    fn test_unknown_region_fails_to_load() {
        let mut file = NamedTempFile::with_suffix(".yml").unwrap();
        file.write_all(b"excludes: [custom]\n").unwrap();
        file.flush().unwrap();
        assert!(ProduceConfig::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_load_nonexistent_file() {
        assert!(ProduceConfig::load_from_file("/nonexistent/path.yml").is_err());
    }

    #[test]
    fn test_validation() {
        assert!(create_test_config().validate().is_ok());

        let both = ProduceConfig {
            clone: true,
            crypted_clone: true,
            ..create_test_config()
        };
        assert!(both.validate().is_err());

        let bad_name = ProduceConfig {
            basename: "my egg".into(),
            ..create_test_config()
        };
        assert!(bad_name.validate().is_err());

        let bad_addon = ProduceConfig {
            addons: vec!["a/b/c".into()],
            ..create_test_config()
        };
        assert!(bad_addon.validate().is_err());

        let bad_user = ProduceConfig {
            live_user: "root".into(),
            ..create_test_config()
        };
        assert!(bad_user.validate().is_err());
    }

    #[test]
    fn test_yolk_and_live_user_reach_request() {
        let mut file = NamedTempFile::with_suffix(".yml").unwrap();
        file.write_all(b"live_user: demo\nyolk_renew: true\n").unwrap();
        file.flush().unwrap();

        let request = ProduceConfig::load_from_file(file.path()).unwrap().into_request();
        assert_eq!(request.live_user, "demo");
        assert!(request.yolk_renew);
    }

    #[test]
    fn test_load_step_list() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"- step-a\n- step-b\n").unwrap();
        file.flush().unwrap();
        assert_eq!(load_step_list(file.path()).unwrap(), vec!["step-a", "step-b"]);

        let mut bad = NamedTempFile::new().unwrap();
        bad.write_all(b"steps: nope\n").unwrap();
        bad.flush().unwrap();
        assert!(load_step_list(bad.path()).is_err());
    }
}
