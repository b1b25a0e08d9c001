use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{BackendKind, EnvironmentBackend, EnvironmentHandle, ProjectInfo};
use crate::error::{Error, Result};
use crate::process::{CommandRunner, Invocation, find_executable};

/// Conda declaration file names, in lookup order.
pub const DECLARATION_FILES: [&str; 2] = ["environment.yaml", "environment.yml"];

/// Declared name that stands for "a per-project environment".
pub const BASE_SENTINEL: &str = "base";

/// Prefix of per-project environment names derived from [`BASE_SENTINEL`].
pub const ENV_PREFIX: &str = "pinto-";

#[derive(Debug, Deserialize)]
struct DeclarationDocument {
    name: String,
}

/// A Conda `environment.yaml` and the name it declares.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Declaration {
    file: PathBuf,
    declared: String,
}

impl Declaration {
    fn load(file: &Path) -> Result<Self> {
        let contents = fs::read_to_string(file)?;
        let document: DeclarationDocument =
            serde_yaml::from_str(&contents).map_err(|source| Error::DeclarationParse {
                path: file.to_path_buf(),
                source,
            })?;
        Ok(Self {
            file: file.to_path_buf(),
            declared: document.name,
        })
    }
}

/// Where the environment's packages come from when it is created.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Origin {
    /// Built from a declaration file, then cloned if the names differ.
    File(Declaration),
    /// Cloned from an existing named environment.
    Clone(String),
}

fn is_yaml(value: &str) -> bool {
    Path::new(value)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}

/// Applies the naming rules for a declared environment name.
fn conda_name(declared: &str, project: &str, nested: bool) -> String {
    if declared == BASE_SENTINEL {
        format!("{ENV_PREFIX}{project}")
    } else if nested {
        project.to_owned()
    } else {
        declared.to_owned()
    }
}

/// Matches a package listing row for `project`, with `-` and `_` treated alike.
fn listing_pattern(project: &str) -> Result<Regex> {
    let name = project
        .split(['-', '_'])
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("[-_]");
    Regex::new(&format!(r"(?mi)^{name}\s")).map_err(Error::from)
}

/// Appends the active Conda prefix's `lib` directory to an existing
/// `LD_LIBRARY_PATH`, so native libraries resolve inside `conda run`.
fn library_path(current: Option<&str>, prefix: Option<&str>) -> Option<String> {
    Some(format!("{}:{}/lib", current?, prefix?))
}

/// Environment managed by Conda, with the project itself installed via Poetry.
#[derive(Debug)]
pub struct CondaBackend {
    project: ProjectInfo,
    name: String,
    path: PathBuf,
    origin: Origin,
    conda: String,
    runner: Arc<dyn CommandRunner>,
}

impl CondaBackend {
    fn build(
        project: &ProjectInfo,
        name: String,
        path: PathBuf,
        origin: Origin,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let conda = env::var("CONDA_EXE").unwrap_or_else(|_| "conda".to_owned());
        debug!(
            "Resolved conda environment {name} at {} for project {}",
            path.display(),
            project.name
        );
        Self {
            project: project.clone(),
            name,
            path,
            origin,
            conda,
            runner,
        }
    }

    /// Resolves from a declaration file found next to or above the project.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or has no `name`.
    pub fn from_declaration(
        project: &ProjectInfo,
        file: &Path,
        nested: bool,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let path = file
            .parent()
            .map_or_else(|| project.dir.clone(), Path::to_path_buf);
        Self::declared(project, file, nested, path, runner)
    }

    /// Resolves from `tool.pinto.base_env`, which is either a declaration
    /// file relative to the project or the name of an environment to clone.
    ///
    /// Either way the environment is rooted at the project directory.
    ///
    /// # Errors
    /// Returns [`Error::MissingDeclaration`] if a declaration file is named
    /// but absent.
    pub fn from_base_env(
        project: &ProjectInfo,
        base_env: &str,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        if is_yaml(base_env) {
            let file = project.dir.join(base_env);
            if !file.is_file() {
                return Err(Error::MissingDeclaration(file));
            }
            return Self::declared(project, &file, false, project.dir.clone(), runner);
        }

        let name = conda_name(base_env, &project.name, false);
        Ok(Self::build(
            project,
            name,
            project.dir.clone(),
            Origin::Clone(base_env.to_owned()),
            runner,
        ))
    }

    fn declared(
        project: &ProjectInfo,
        file: &Path,
        nested: bool,
        path: PathBuf,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let declaration = Declaration::load(file)?;
        let name = conda_name(&declaration.declared, &project.name, nested);
        Ok(Self::build(project, name, path, Origin::File(declaration), runner))
    }

    fn handle(&self) -> EnvironmentHandle {
        EnvironmentHandle {
            name: self.name.clone(),
            path: self.path.clone(),
        }
    }

    fn conda<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runner.run(&Invocation::new(self.conda.as_str()).args(args))
    }

    fn env_exists(&self, name: &str) -> Result<bool> {
        let listing = self.conda(["env", "list"])?;
        Ok(listing
            .lines()
            .filter(|row| !row.trim().is_empty() && !row.starts_with('#'))
            .filter_map(|row| row.split_whitespace().next())
            .any(|env_name| env_name == name))
    }
}

impl EnvironmentBackend for CondaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Conda
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn exists(&self) -> Result<bool> {
        self.env_exists(&self.name)
    }

    fn create(&self) -> Result<EnvironmentHandle> {
        if self.exists()? {
            warn!("Environment {} already exists", self.name);
            return Ok(self.handle());
        }

        let source = match &self.origin {
            Origin::File(declaration) => {
                if !self.env_exists(&declaration.declared)? {
                    info!(
                        "Creating conda environment {} from environment file {}",
                        declaration.declared,
                        declaration.file.display()
                    );
                    let file = declaration.file.display().to_string();
                    let stdout = self.conda(["env", "create", "-f", file.as_str()])?;
                    debug!("{stdout}");
                }

                // the declaration describes this very environment
                if declaration.declared == self.name {
                    return Ok(self.handle());
                }
                declaration.declared.clone()
            }
            Origin::Clone(source) => source.clone(),
        };

        if source == self.name || !self.env_exists(&source)? {
            return Err(Error::MissingCloneSource(source));
        }

        info!(
            "Creating environment {} by cloning from environment {source}",
            self.name
        );
        self.conda(["create", "-y", "-n", self.name.as_str(), "--clone", source.as_str()])?;
        Ok(self.handle())
    }

    fn contains(&self, project: &str) -> Result<bool> {
        let pattern = listing_pattern(project)?;
        let listing = self.conda(["list", "-n", self.name.as_str()])?;
        Ok(pattern.is_match(&listing))
    }

    fn install(&self, extras: &BTreeSet<String>) -> Result<()> {
        self.project.check_extras(extras)?;

        // activation may drop poetry from PATH, so pin its location first
        let poetry = find_executable("poetry")
            .map_or_else(|| "poetry".to_owned(), |path| path.display().to_string());
        let dir = self.project.dir.display().to_string();

        let mut invocation = Invocation::new(self.conda.as_str())
            .args(["run", "-n", self.name.as_str(), "--no-capture-output"])
            .arg(poetry)
            .args(["--directory", dir.as_str(), "install"]);
        for extra in extras {
            invocation = invocation.args(["-E", extra.as_str()]);
        }

        let stdout = self.runner.run(&invocation)?;
        debug!("{stdout}");
        Ok(())
    }

    fn run(&self, args: &[String]) -> Result<String> {
        let mut invocation = Invocation::new(self.conda.as_str())
            .args(["run", "-n", self.name.as_str(), "--no-capture-output"])
            .args(args.iter().map(String::as_str));
        let current = env::var("LD_LIBRARY_PATH").ok();
        let prefix = env::var("CONDA_PREFIX").ok();
        if let Some(value) = library_path(current.as_deref(), prefix.as_deref()) {
            invocation = invocation.env("LD_LIBRARY_PATH", value);
        }
        self.runner.run(&invocation)
    }
}
