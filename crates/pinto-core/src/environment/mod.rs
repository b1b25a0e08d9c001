//! Per-project isolated environments.
//!
//! A project's environment is owned by exactly one backend, chosen once from
//! evidence in the project directory:
//! - `tool.pinto.base_env` in the manifest, or an `environment.yaml` /
//!   `environment.yml` in the project or its parent, selects Conda.
//! - a `poetry.toml` that disables virtualenv creation asks for Conda too, and
//!   is an error when nothing declares the Conda environment.
//! - anything else is a plain Poetry project.
//!
//! Both backends expose the same lifecycle through [`EnvironmentBackend`].

mod conda;
mod poetry;

use std::collections::BTreeSet;
use std::fmt::{self, Debug, Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::process::CommandRunner;

pub use conda::{BASE_SENTINEL, CondaBackend, DECLARATION_FILES, ENV_PREFIX};
pub use poetry::{PoetryBackend, env_name};

/// Which tool manages an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// A Poetry-managed virtualenv.
    Poetry,
    /// A Conda environment with the project installed through Poetry.
    Conda,
}

impl Display for BackendKind {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::Poetry => "poetry",
            Self::Conda => "conda",
        })
    }
}

/// An environment as it exists on disk after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentHandle {
    /// Logical name of the environment.
    pub name: String,
    /// Filesystem location of the environment.
    pub path: PathBuf,
}

/// What a backend needs to know about the project it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectInfo {
    /// Canonical project directory.
    pub dir: PathBuf,
    /// `tool.poetry.name`.
    pub name: String,
    /// Extras declared by the project.
    pub extras: BTreeSet<String>,
    /// `tool.pinto.base_env`, if set.
    pub base_env: Option<String>,
}

impl ProjectInfo {
    /// Collects project facts from its manifest.
    ///
    /// # Errors
    /// Returns an error if the manifest has no project name.
    pub fn from_manifest(dir: &Path, manifest: &Manifest) -> Result<Self> {
        Ok(Self {
            dir: dir.to_path_buf(),
            name: manifest.project_name()?.to_owned(),
            extras: manifest.extras(),
            base_env: manifest.base_env().map(str::to_owned),
        })
    }

    /// Rejects extras the project does not declare.
    ///
    /// # Errors
    /// Returns [`Error::UndeclaredExtras`] listing every unknown extra.
    pub fn check_extras(&self, requested: &BTreeSet<String>) -> Result<()> {
        let unknown: Vec<String> = requested.difference(&self.extras).cloned().collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(Error::UndeclaredExtras {
                project: self.name.clone(),
                extras: unknown,
            })
        }
    }
}

/// Uniform lifecycle over an environment backend.
pub trait EnvironmentBackend: Debug {
    /// Backend managing this environment.
    fn kind(&self) -> BackendKind;

    /// Resolved logical name.
    fn name(&self) -> &str;

    /// Resolved location. It need not exist yet.
    fn path(&self) -> &Path;

    /// Whether the environment has been created.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be queried.
    fn exists(&self) -> Result<bool>;

    /// Creates the environment. Does nothing if it already exists.
    ///
    /// # Errors
    /// Returns an error if the backend's creation command fails.
    fn create(&self) -> Result<EnvironmentHandle>;

    /// Whether the named project is installed in the environment, at any version.
    ///
    /// # Errors
    /// Returns an error if the package registry cannot be read.
    fn contains(&self, project: &str) -> Result<bool>;

    /// Installs the project, along with the requested extras.
    ///
    /// # Errors
    /// Returns [`Error::UndeclaredExtras`] before spawning anything if an
    /// extra is not declared, or an execution error if installation fails.
    fn install(&self, extras: &BTreeSet<String>) -> Result<()>;

    /// Runs `args` as a single command inside the environment and returns its stdout.
    ///
    /// # Errors
    /// Returns an execution error carrying the command's stderr if it fails.
    fn run(&self, args: &[String]) -> Result<String>;
}

/// The backend selected for a project.
#[derive(Debug)]
pub enum Backend {
    /// Poetry-managed virtualenv.
    Poetry(PoetryBackend),
    /// Conda environment.
    Conda(CondaBackend),
}

impl Backend {
    fn inner(&self) -> &dyn EnvironmentBackend {
        match self {
            Self::Poetry(backend) => backend,
            Self::Conda(backend) => backend,
        }
    }
}

/// Locates the Conda declaration file for a project directory.
///
/// The project directory is searched before its parent, and `.yaml` before
/// `.yml`. The flag is `true` when the file came from the parent.
pub fn find_declaration(dir: &Path) -> Option<(PathBuf, bool)> {
    let candidates = [Some((dir, false)), dir.parent().map(|parent| (parent, true))];
    candidates.into_iter().flatten().find_map(|(root, nested)| {
        DECLARATION_FILES
            .iter()
            .map(|file| root.join(file))
            .find(|candidate| candidate.is_file())
            .map(|found| (found, nested))
    })
}

/// Decides which backend owns `project` and resolves its identity.
///
/// Nothing is created; this only inspects the filesystem.
///
/// # Errors
/// Returns a resolution error if Conda is requested but undeclared, or a
/// configuration error if a declaration or `poetry.toml` cannot be read.
pub fn resolve_backend(project: &ProjectInfo, runner: Arc<dyn CommandRunner>) -> Result<Backend> {
    if let Some(base_env) = &project.base_env {
        return CondaBackend::from_base_env(project, base_env, runner).map(Backend::Conda);
    }

    if let Some((file, nested)) = find_declaration(&project.dir) {
        return CondaBackend::from_declaration(project, &file, nested, runner).map(Backend::Conda);
    }

    let settings = poetry::Settings::load(&project.dir)?;
    if !settings.creates_virtualenvs() {
        return Err(Error::MissingDeclaration(project.dir.clone()));
    }
    PoetryBackend::new(project, &settings, runner).map(Backend::Poetry)
}

/// A project's environment, bound to its backend at construction.
#[derive(Debug)]
pub struct Environment {
    /// Resolved backend.
    backend: Backend,
}

impl Environment {
    /// Resolves the environment for `project`.
    ///
    /// # Errors
    /// See [`resolve_backend`].
    pub fn resolve(project: &ProjectInfo, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let backend = resolve_backend(project, runner)?;
        Ok(Self { backend })
    }

    /// The selected backend.
    pub fn backend(&self) -> &Backend {
        &self.backend
    }
}

impl EnvironmentBackend for Environment {
    fn kind(&self) -> BackendKind {
        self.backend.inner().kind()
    }

    fn name(&self) -> &str {
        self.backend.inner().name()
    }

    fn path(&self) -> &Path {
        self.backend.inner().path()
    }

    fn exists(&self) -> Result<bool> {
        self.backend.inner().exists()
    }

    fn create(&self) -> Result<EnvironmentHandle> {
        self.backend.inner().create()
    }

    fn contains(&self, project: &str) -> Result<bool> {
        self.backend.inner().contains(project)
    }

    fn install(&self, extras: &BTreeSet<String>) -> Result<()> {
        self.backend.inner().install(extras)
    }

    fn run(&self, args: &[String]) -> Result<String> {
        self.backend.inner().run(args)
    }
}
