//! A Python project and its isolated environment.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::environment::{Environment, EnvironmentBackend as _, ProjectInfo};
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::process::{CommandRunner, SystemRunner};
use crate::scope::{ScopeSource, with_variables};

/// A directory holding a Poetry-managed `pyproject.toml`.
#[derive(Debug)]
pub struct Project {
    /// Canonical project directory.
    path: PathBuf,
    /// Parsed manifest.
    manifest: Manifest,
    /// Facts the environment backends need.
    info: ProjectInfo,
    /// Environment resolved at construction.
    environment: Environment,
}

impl Project {
    /// Opens the project at `path`, driving real `poetry` and `conda` binaries.
    ///
    /// # Errors
    /// See [`Project::with_runner`].
    pub fn new(path: &Path) -> Result<Self> {
        Self::with_runner(path, Arc::new(SystemRunner))
    }

    /// Opens the project at `path`, sending every external command through `runner`.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if `path` does not exist, an error if its
    /// manifest is missing or has no `tool.poetry.name`, or a resolution
    /// error if its environment backend cannot be determined.
    pub fn with_runner(path: &Path, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let dir = path
            .canonicalize()
            .map_err(|_| Error::NotFound {
                kind: "Project",
                path: path.to_path_buf(),
            })?;
        let manifest = Manifest::open(&dir, "Project")?;
        let info = ProjectInfo::from_manifest(&dir, &manifest)?;
        let environment = Environment::resolve(&info, runner)?;

        Ok(Self {
            path: dir,
            manifest,
            info,
            environment,
        })
    }

    /// Canonical project directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `tool.poetry.name`.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Parsed manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// The project's environment.
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Console scripts the project declares.
    pub fn scripts(&self) -> Vec<&str> {
        self.manifest.scripts()
    }

    /// Makes sure the project is installed in its environment, creating the
    /// environment first if needed.
    ///
    /// An installed project is only reinstalled when `force` is set.
    ///
    /// # Errors
    /// Returns [`Error::UndeclaredExtras`] before anything runs if `extras`
    /// names an extra the project does not declare, or the backend's error if
    /// creation or installation fails.
    pub fn install(&self, force: bool, extras: &BTreeSet<String>) -> Result<()> {
        self.info.check_extras(extras)?;

        let environment = &self.environment;
        if !environment.exists()? {
            environment.create()?;
        }

        if !environment.contains(self.name())? {
            info!(
                "Installing project '{}' from '{}' into environment '{}'",
                self.name(),
                self.path.display(),
                environment.name()
            );
            environment.install(extras)?;
        } else if force {
            info!(
                "Updating project '{}' from '{}' in environment '{}'",
                self.name(),
                self.path.display(),
                environment.name()
            );
            environment.install(extras)?;
        } else {
            info!(
                "Project '{}' at '{}' already installed in environment '{}', skipping installation",
                self.name(),
                self.path.display(),
                environment.name()
            );
        }
        Ok(())
    }

    /// Runs `args` inside the project's environment and returns its stdout.
    ///
    /// The project is installed first if it is not already. The command sees
    /// the variables from `scope`, resolved against the project directory.
    ///
    /// # Errors
    /// Returns an error if installation fails, the variable source cannot be
    /// read, or the command fails.
    pub fn run(&self, args: &[String], scope: &ScopeSource) -> Result<String> {
        let environment = &self.environment;
        if !environment.exists()? || !environment.contains(self.name())? {
            self.install(false, &BTreeSet::new())?;
        }

        let overlay = scope.resolve(&self.path)?;
        with_variables(&overlay, || environment.run(args))
    }
}
