//! liveforge - main entry point

use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::{debug, error, info, warn};

use liveforge::cli::{Cli, Commands, ProduceArgs};
use liveforge::command_executor::ShellExecutor;
use liveforge::config::{self, BuildRequest, HostLayout};
use liveforge::config_file::{self, ProduceConfig};
use liveforge::logging::{init_logging, LoggingConfig};
use liveforge::orchestrator::Producer;
use liveforge::preflight::{self, Prerequisite};
use liveforge::process_guard::{self, CancelToken};
use liveforge::prompt::{Confirm, FixedAnswer, StdinConfirm};
use liveforge::sequencer::SequencePlan;
use liveforge::templates;
use liveforge::types::DistroFamily;

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(LoggingConfig::for_verbosity(cli.verbose));
    debug!("CLI arguments parsed");

    match cli.command {
        Commands::Produce(args) => run_produce(&args, cli.verbose),
        Commands::Plan {
            distro,
            clone,
            custom_steps,
        } => {
            let family = family_or_detected(distro, &HostLayout::system())?;
            print!("{}", SequencePlan::compose(family, clone, &custom_steps));
            Ok(())
        }
        Commands::Validate { config } => {
            info!("Validating configuration file: {:?}", config);
            let loaded = ProduceConfig::load_from_file(&config)?;
            if let Err(e) = loaded.validate() {
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
            println!("✓ Configuration file is valid: {}", config.display());
            Ok(())
        }
        Commands::Status { distro } => {
            let layout = HostLayout::system();
            let family = family_or_detected(distro, &layout)?;
            print_status(&layout, family);
            Ok(())
        }
    }
}

fn family_or_detected(distro: Option<DistroFamily>, layout: &HostLayout) -> Result<DistroFamily> {
    match distro {
        Some(family) => Ok(family),
        None => config::detect_distro(&layout.source_root).context("Cannot detect the distro family, pass --distro"),
    }
}

fn print_status(layout: &HostLayout, family: DistroFamily) {
    let show = |label: &str, path: &Path| {
        let mark = if path.exists() { "✓" } else { "✗" };
        println!("{} {:<20} {}", mark, label, path.display());
    };
    println!("Distro family: {}", family);
    show("addons", &layout.addons_dir);
    show("wardrobe", &layout.wardrobe_dir);
    show("snapshot dir", &layout.snapshot_dir);
    show("templates", &layout.template_dir);
    show("installer config", &layout.installer_config_dir);
    show("installer policy", &templates::installer_policy_path(&layout.source_root));

    let unmet = Prerequisite::unmet(layout, family, false);
    if unmet.is_empty() {
        println!("All prerequisites met");
    } else {
        for prerequisite in unmet {
            println!("Missing prerequisite: {}", prerequisite);
        }
    }
}

fn build_request(args: &ProduceArgs, verbose: bool) -> Result<BuildRequest> {
    let base = match &args.config {
        Some(path) => {
            let loaded = ProduceConfig::load_from_file(path)?;
            loaded.validate()?;
            loaded.into_request()
        }
        None => BuildRequest::default(),
    };
    let file_steps = match &args.custom_steps_file {
        Some(path) => config_file::load_step_list(path)?,
        None => Vec::new(),
    };
    Ok(args.apply_to(base, verbose, file_steps))
}

fn run_produce(args: &ProduceArgs, verbose: bool) -> Result<()> {
    let request = build_request(args, verbose)?;

    if let Some(path) = &args.save_config {
        ProduceConfig::from(&request).save_to_file(path)?;
        println!("✓ Configuration saved to {}", path.display());
        return Ok(());
    }

    let checks = preflight::verify_environment();
    if !checks.missing_binaries.is_empty() || (!checks.is_root && !preflight::should_skip_root_check()) {
        bail!("Pre-flight checks failed: {}", checks);
    }

    let cancel = CancelToken::new();
    if let Err(e) = process_guard::init_signal_handlers(cancel.clone()) {
        warn!("Failed to initialize signal handlers: {}", e);
    }

    let executor = ShellExecutor::new();
    let confirm: Box<dyn Confirm> = if request.interactive {
        Box::new(StdinConfirm)
    } else {
        Box::new(FixedAnswer(false))
    };
    let mut producer = Producer::new(&executor, confirm.as_ref(), HostLayout::system(), cancel);

    let build = producer.prepare(request)?;
    let script_only = build.config.script_only;
    let artifact = match producer.produce(&build) {
        Ok(artifact) => artifact,
        Err(e) => {
            error!("Build failed: {}", e);
            producer.abort_cleanup();
            return Err(e.into());
        }
    };
    producer.finished(&artifact, script_only)?;
    Ok(())
}
