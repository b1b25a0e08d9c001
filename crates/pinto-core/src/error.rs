use core::result::Result as CoreResult;
use std::io::Error as IoError;
use std::path::PathBuf;

use glob::PatternError;
use regex::Error as RegexError;
use serde_yaml::Error as YamlError;
use thiserror::Error;
use toml::de::Error as TomlError;

/// Result type for pinto operations.
pub type Result<T> = CoreResult<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing configuration, detected before anything runs.
    Config,
    /// The backend for an environment could not be determined.
    Resolution,
    /// Extras were requested that the project does not declare.
    Extras,
    /// An external process failed.
    Execution,
}

/// Errors that can occur while managing projects, environments and pipelines.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// A project or pipeline directory does not exist.
    #[error("{kind} {path} does not exist")]
    NotFound {
        /// What was being opened, `Project` or `Pipeline`.
        kind: &'static str,
        /// Path that was given.
        path: PathBuf,
    },

    /// The directory has no `pyproject.toml`.
    #[error("{kind} {dir} has no associated 'pyproject.toml' at location {manifest}")]
    MissingManifest {
        /// What was being opened, `Project` or `Pipeline`.
        kind: &'static str,
        /// Directory that was opened.
        dir: PathBuf,
        /// Expected manifest location.
        manifest: PathBuf,
    },

    /// A manifest file could not be parsed.
    #[error("Failed to parse {path}: {source}")]
    ManifestParse {
        /// File that failed to parse.
        path: PathBuf,
        /// Underlying TOML error.
        source: TomlError,
    },

    /// A required table or key is absent from a manifest.
    #[error("Config '{manifest}' has no '{table}' table")]
    MissingTable {
        /// Dotted name of the missing table or key.
        table: &'static str,
        /// Manifest that was inspected.
        manifest: PathBuf,
    },

    /// A pipeline step does not follow `component:command[:subcommand]`.
    #[error("Can't parse pipeline step '{0}'")]
    InvalidStep(String),

    /// A variable file has a line that is not `KEY=VALUE`.
    #[error("Malformed environment file {path}: line {line} is not KEY=VALUE")]
    MalformedEnvFile {
        /// Offending file.
        path: PathBuf,
        /// One-based line number.
        line: usize,
    },

    /// A Conda declaration file could not be read as YAML.
    #[error("Environment file {path} is invalid: {source}")]
    DeclarationParse {
        /// Offending file.
        path: PathBuf,
        /// Underlying YAML error.
        source: YamlError,
    },

    /// A package name could not be turned into a listing pattern.
    #[error("Invalid package pattern: {0}")]
    Pattern(#[from] RegexError),

    /// A site-packages lookup pattern is invalid.
    #[error("Invalid glob pattern: {0}")]
    Glob(#[from] PatternError),

    /// A variable name or value cannot be placed in the process environment.
    #[error("Invalid environment variable '{0}'")]
    InvalidVariable(String),

    /// A variable scope is already active on this thread.
    #[error("A variable scope is already active on this thread")]
    ScopeActive,

    /// Conda was selected but no declaration file could be found.
    #[error("No environment file for Conda project {0}")]
    MissingDeclaration(PathBuf),

    /// The Conda environment to clone from does not exist.
    #[error("No base Conda environment {0} to clone")]
    MissingCloneSource(String),

    /// Extras were requested that the manifest does not declare.
    #[error("Project {project} does not declare extras: {}", .extras.join(", "))]
    UndeclaredExtras {
        /// Project the extras were requested for.
        project: String,
        /// The undeclared extras, sorted.
        extras: Vec<String>,
    },

    /// A process could not be started.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying OS error.
        source: IoError,
    },

    /// A process exited unsuccessfully.
    #[error("Command '{command}' failed with exit code {}:\n{stderr}", .code.map_or_else(|| "none".to_owned(), |code| code.to_string()))]
    Execution {
        /// Rendered command line.
        command: String,
        /// Exit code, absent when killed by a signal.
        code: Option<i32>,
        /// Captured standard error, verbatim.
        stderr: String,
    },
}

impl Error {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingDeclaration(_) | Self::MissingCloneSource(_) => ErrorKind::Resolution,
            Self::UndeclaredExtras { .. } => ErrorKind::Extras,
            Self::Spawn { .. } | Self::Execution { .. } => ErrorKind::Execution,
            Self::Io(_)
            | Self::NotFound { .. }
            | Self::MissingManifest { .. }
            | Self::ManifestParse { .. }
            | Self::MissingTable { .. }
            | Self::InvalidStep(_)
            | Self::MalformedEnvFile { .. }
            | Self::DeclarationParse { .. }
            | Self::Pattern(_)
            | Self::Glob(_)
            | Self::InvalidVariable(_)
            | Self::ScopeActive => ErrorKind::Config,
        }
    }

    /// Exit code of the failed process, if this is an execution failure.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Execution { code, .. } => *code,
            _ => None,
        }
    }
}
