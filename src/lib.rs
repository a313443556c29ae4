//! liveforge library
//!
//! Snapshots a running system into a compressed live image and configures the
//! installer that ships inside it.

pub mod cli;
pub mod command_executor;
pub mod config;
pub mod config_file;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod package_backend;
pub mod package_manifest;
pub mod preflight;
pub mod process_guard;
pub mod prompt;
pub mod registry;
pub mod sequence_state;
pub mod sequencer;
pub mod snapshot;
pub mod templates;
pub mod types;

// Re-export main types for convenience
pub use command_executor::{CommandExecutor, CommandOutput, EchoPolicy, ScriptRecorder, ShellExecutor};
pub use config::{BuildConfiguration, BuildRequest, HostLayout};
pub use config_file::ProduceConfig;
pub use error::{BuildError, CommandFailure, ConfigError, LiveforgeError, StepError};
pub use orchestrator::{Artifact, PreparedBuild, Producer};
pub use package_manifest::{PackageManifest, PackageOperation};
pub use process_guard::{CancelToken, ChildRegistry, CommandProcessGroup};
pub use registry::{FailurePolicy, ModuleStep, StepKind, StepRegistry};
pub use sequence_state::{SequencePhase, SequenceState, SequenceTracker};
pub use sequencer::{DistroSequencer, SequenceOptions, SequencePlan};
pub use types::{Backend, CloneMode, Compression, CompressionProfile, DistroFamily, ExcludeRegion};
