use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::BuildRequest;
use crate::types::{CompressionProfile, DistroFamily, ExcludeRegion};

/// liveforge - produce a live image of the running system
#[derive(Parser)]
#[command(name = "liveforge")]
#[command(about = "Snapshot the running system into a live image with a configured installer")]
#[command(version)]
pub struct Cli {
    /// Log at debug level and echo every command
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Snapshot the system and compress it into a live image
    Produce(ProduceArgs),
    /// Print the installer module sequence for a distro family
    Plan {
        /// Distro family (detected from os-release when omitted)
        #[arg(short, long)]
        distro: Option<DistroFamily>,
        /// Plan a clone build (keeps the live user)
        #[arg(long)]
        clone: bool,
        /// Custom final step, in order (repeatable)
        #[arg(long = "custom-step", value_name = "NAME")]
        custom_steps: Vec<String>,
    },
    /// Validate a produce configuration file
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
    /// Show host locations and unmet prerequisites
    Status {
        /// Distro family (detected from os-release when omitted)
        #[arg(short, long)]
        distro: Option<DistroFamily>,
    },
}

#[derive(Args, Debug, Default)]
pub struct ProduceArgs {
    /// Produce configuration file (YAML or JSON); flags given here win
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Save the effective configuration to file and exit
    #[arg(long)]
    pub save_config: Option<PathBuf>,

    /// Image name prefix
    #[arg(short, long)]
    pub prefix: Option<String>,

    /// Image basename (defaults to the host name)
    #[arg(short, long)]
    pub basename: Option<String>,

    /// Theme name in the wardrobe, or a path to a theme directory
    #[arg(long)]
    pub theme: Option<String>,

    /// Addon as vendor/name (repeatable)
    #[arg(long = "addons", value_name = "VENDOR/NAME")]
    pub addons: Vec<String>,

    /// Region left out of the snapshot (repeatable)
    #[arg(short, long = "excludes", value_name = "REGION")]
    pub excludes: Vec<ExcludeRegion>,

    /// Desktop entry to link on the live desktop (repeatable)
    #[arg(long = "links", value_name = "NAME")]
    pub links: Vec<String>,

    /// Compress with the max profile (xz)
    #[arg(short, long, conflicts_with = "standard")]
    pub max: bool,

    /// Compress with the standard profile (zstd 15)
    #[arg(short, long)]
    pub standard: bool,

    /// Keep user data in the image
    #[arg(long, conflicts_with = "cryptedclone")]
    pub clone: bool,

    /// Keep user data in an encrypted volume
    #[arg(long)]
    pub cryptedclone: bool,

    /// Never prompt; unmet prerequisites become errors
    #[arg(short, long)]
    pub nointeractive: bool,

    /// Release build: max compression, installer tooling removed on install
    #[arg(long)]
    pub release: bool,

    /// Write the build as shell scripts instead of running it
    #[arg(long)]
    pub script: bool,

    /// Keep /root and credentials in the image
    #[arg(short, long)]
    pub unsecure: bool,

    /// Rebuild the local package cache even when one exists
    #[arg(short = 'y', long = "yolk")]
    pub yolk_renew: bool,

    /// Live session account removed by the installer
    #[arg(long, value_name = "USER")]
    pub live_user: Option<String>,

    /// Custom final step, in order (repeatable)
    #[arg(long = "custom-step", value_name = "NAME")]
    pub custom_steps: Vec<String>,

    /// YAML list of custom final steps, appended after --custom-step
    #[arg(long, value_name = "FILE")]
    pub custom_steps_file: Option<PathBuf>,

    /// Distro family (detected from os-release when omitted)
    #[arg(short, long)]
    pub distro: Option<DistroFamily>,
}

impl ProduceArgs {
    /// Lay these flags over `base`, which comes from a config file or the
    /// defaults. Set flags replace values; list flags extend them.
    pub fn apply_to(&self, mut base: BuildRequest, verbose: bool, file_steps: Vec<String>) -> BuildRequest {
        if let Some(prefix) = &self.prefix {
            base.prefix = prefix.clone();
        }
        if let Some(basename) = &self.basename {
            base.basename = basename.clone();
        }
        if self.theme.is_some() {
            base.theme = self.theme.clone();
        }
        if self.max {
            base.compression = CompressionProfile::Max;
        } else if self.standard {
            base.compression = CompressionProfile::Standard;
        }
        if self.clone {
            base.clone = true;
        }
        if self.cryptedclone {
            base.crypted_clone = true;
        }
        for region in &self.excludes {
            if !base.excludes.contains(region) {
                base.excludes.push(*region);
            }
        }
        base.addons.extend(self.addons.iter().cloned());
        base.links.extend(self.links.iter().cloned());
        if self.nointeractive {
            base.interactive = false;
        }
        base.unsecure |= self.unsecure;
        base.release |= self.release;
        base.script_only |= self.script;
        base.yolk_renew |= self.yolk_renew;
        if let Some(user) = &self.live_user {
            base.live_user = user.clone();
        }
        base.verbose |= verbose;

        if !self.custom_steps.is_empty() || !file_steps.is_empty() {
            base.custom_final_steps = self.custom_steps.iter().cloned().chain(file_steps).collect();
        }
        if self.distro.is_some() {
            base.distro = self.distro;
        }
        base
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
