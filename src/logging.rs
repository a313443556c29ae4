//! Structured logging setup
//!
//! Logs go to stderr through a `tracing` subscriber so stdout stays free for
//! plans and status output. `RUST_LOG` overrides the level chosen here.

use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    /// Include file and line number information
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            include_location: false,
        }
    }
}

impl LoggingConfig {
    /// `--verbose` switches to debug level with source locations.
    pub fn for_verbosity(verbose: bool) -> Self {
        if verbose {
            Self {
                level: Level::DEBUG,
                include_location: true,
            }
        } else {
            Self::default()
        }
    }

    /// Filter directive used when `RUST_LOG` is unset.
    pub fn default_directive(&self) -> String {
        format!("liveforge={}", self.level.to_string().to_lowercase())
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init_logging(config: LoggingConfig) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.default_directive()));

        let result = tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(config.include_location)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init();
        if let Err(e) = result {
            eprintln!("Logging already initialized: {}", e);
        }
    });
}
