//! Error handling for liveforge
//!
//! Each boundary of the pipeline has its own error type so callers can tell a
//! bad request (`ConfigError`, raised before anything destructive runs) apart
//! from a failed build (`BuildError`). `LiveforgeError` unifies them for the
//! binary.

use std::path::PathBuf;
use thiserror::Error;

/// A single external command returned non-zero (or could not be spawned).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("command `{command}` failed (exit code {exit_code}): {}", stderr.trim())]
pub struct CommandFailure {
    pub command: String,
    pub exit_code: i32,
    pub stderr: String,
    /// Package names the command was operating on, when it was a package operation.
    pub packages: Vec<String>,
}

impl CommandFailure {
    pub fn new(command: impl Into<String>, exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
            packages: Vec::new(),
        }
    }

    /// Attach the package names the failing command was working on.
    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages = packages.into_iter().map(Into::into).collect();
        self
    }
}

/// Bad or missing configuration. Always raised before irreversible work and
/// always recoverable by correcting the input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cannot find theme: {0} (expected a `theme` entry inside it)")]
    ThemeNotFound(PathBuf),

    #[error("addon `{name}` not found at {}", path.display())]
    AddonNotFound { name: String, path: PathBuf },

    #[error("unknown addon `{0}`")]
    UnknownAddon(String),

    #[error("clone and crypted clone are mutually exclusive")]
    ConflictingCloneModes,

    #[error("missing prerequisite: {0}")]
    MissingPrerequisite(String),

    #[error("unknown distro family `{0}`")]
    UnknownDistro(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Why a sequencer step did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error(transparent)]
    Command(#[from] CommandFailure),

    #[error("cancelled before the step started")]
    Cancelled,

    #[error("step `{0}` is not registered for this distro")]
    Unresolved(String),

    #[error("package manifest: {0}")]
    Manifest(String),

    #[error("no template for module `{0}`")]
    MissingTemplate(String),

    #[error("cannot render `{module}`: {message}")]
    Render { module: String, message: String },

    #[error("step reached out of order: {0}")]
    OutOfOrder(String),

    #[error("I/O error on {}: {message}", path.display())]
    Io { path: PathBuf, message: String },
}

impl StepError {
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Fatal failure of `produce`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("installer step `{step}` failed: {cause}")]
    SequencerFailed { step: String, cause: StepError },

    #[error(transparent)]
    Command(#[from] CommandFailure),

    #[error("build cancelled")]
    Cancelled,

    #[error("I/O error on {}: {message}", path.display())]
    Io { path: PathBuf, message: String },

    #[error("expected {expected} but the build produced {actual}")]
    ArtifactMismatch {
        expected: &'static str,
        actual: &'static str,
    },
}

impl BuildError {
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Name of the installer step that halted the build, if any.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::SequencerFailed { step, .. } => Some(step),
            _ => None,
        }
    }
}

/// Top-level error type for the liveforge binary and library consumers.
#[derive(Error, Debug)]
pub enum LiveforgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Sequence transition error: {0}")]
    Transition(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for liveforge operations
pub type Result<T> = std::result::Result<T, LiveforgeError>;
