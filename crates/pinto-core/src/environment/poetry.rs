use std::collections::BTreeSet;
use std::env;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::prelude::{BASE64_URL_SAFE, Engine as _};
use glob::{MatchOptions, Pattern};
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use tracing::{debug, info, warn};

use super::{BackendKind, EnvironmentBackend, EnvironmentHandle, ProjectInfo};
use crate::error::Result;
use crate::manifest::load_toml;
use crate::process::{CommandRunner, Invocation};

/// Per-project Poetry settings file.
const SETTINGS_FILE: &str = "poetry.toml";

/// Directory name of an in-project virtualenv.
const IN_PROJECT_DIR: &str = ".venv";

/// Characters Poetry replaces with `_` in environment names.
const UNSAFE_CHARS: [char; 11] = [' ', '$', '`', '!', '*', '@', '"', '\\', '\r', '\n', '\t'];

/// Runs of these collapse to `-` in canonical package names.
const SEPARATOR_PATTERN: &str = "[-_.]+";

const MAX_NAME_LEN: usize = 42;
const HASH_LEN: usize = 8;

/// The `[virtualenvs]` table of `poetry.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct VirtualenvSettings {
    create: Option<bool>,
    in_project: Option<bool>,
    path: Option<String>,
}

/// Project-local Poetry configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct Settings {
    #[serde(default)]
    virtualenvs: VirtualenvSettings,
}

impl Settings {
    /// Reads `poetry.toml` from `dir`. A missing file means defaults.
    pub(crate) fn load(dir: &Path) -> Result<Self> {
        let file = dir.join(SETTINGS_FILE);
        if file.is_file() {
            load_toml(&file)
        } else {
            Ok(Self::default())
        }
    }

    /// Whether Poetry manages a virtualenv for the project at all.
    pub(crate) fn creates_virtualenvs(&self) -> bool {
        self.virtualenvs.create != Some(false)
    }
}

/// Poetry's name for the virtualenv of project `project_name` living in `dir`.
///
/// The package name is canonicalized first: each run of `-`, `_` or `.`
/// collapses to one `-`.
///
/// # Errors
/// Returns [`crate::Error::Pattern`] if the separator pattern fails to compile.
pub fn env_name(project_name: &str, dir: &Path) -> Result<String> {
    let separators = Regex::new(SEPARATOR_PATTERN)?;
    let sanitized: String = separators
        .replace_all(project_name, "-")
        .to_lowercase()
        .chars()
        .map(|ch| if UNSAFE_CHARS.contains(&ch) { '_' } else { ch })
        .take(MAX_NAME_LEN)
        .collect();

    let digest = Sha256::digest(dir.to_string_lossy().as_bytes());
    let hash: String = BASE64_URL_SAFE.encode(digest).chars().take(HASH_LEN).collect();
    Ok(format!("{sanitized}-{hash}"))
}

fn env_flag(name: &str) -> Option<bool> {
    let value = env::var(name).ok()?;
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn cache_dir() -> PathBuf {
    env::var_os("POETRY_CACHE_DIR").map_or_else(
        || dirs::cache_dir().unwrap_or_else(env::temp_dir).join("pypoetry"),
        PathBuf::from,
    )
}

/// Where the virtualenv lives.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Layout {
    /// `<project>/.venv`.
    InProject(PathBuf),
    /// A directory under a shared virtualenvs root.
    Shared(PathBuf),
}

impl Layout {
    fn resolve(dir: &Path, settings: &Settings) -> Self {
        let venv = dir.join(IN_PROJECT_DIR);
        let in_project = settings
            .virtualenvs
            .in_project
            .or_else(|| env_flag("POETRY_VIRTUALENVS_IN_PROJECT"));
        if in_project == Some(true) || (in_project.is_none() && venv.is_dir()) {
            return Self::InProject(venv);
        }

        let root = settings.virtualenvs.path.as_ref().map_or_else(
            || {
                env::var_os("POETRY_VIRTUALENVS_PATH")
                    .map_or_else(|| cache_dir().join("virtualenvs"), PathBuf::from)
            },
            |configured| {
                let expanded = configured.replace("{cache-dir}", &cache_dir().to_string_lossy());
                dir.join(expanded)
            },
        );
        Self::Shared(root)
    }
}

/// First directory under `root` that belongs to `name`, by sorted file name.
fn find_venv(root: &Path, name: &str) -> Option<PathBuf> {
    let belongs = |file_name: &str| {
        file_name == name
            || file_name
                .strip_prefix(name)
                .is_some_and(|rest| rest.starts_with("-py"))
    };
    let mut candidates: Vec<PathBuf> = fs::read_dir(root)
        .ok()?
        .filter_map(|entry| entry.ok().map(|found| found.path()))
        .filter(|path| {
            path.is_dir() && path.file_name().and_then(OsStr::to_str).is_some_and(belongs)
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// Virtualenv managed by Poetry.
#[derive(Debug)]
pub struct PoetryBackend {
    project: ProjectInfo,
    name: String,
    layout: Layout,
    path: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl PoetryBackend {
    pub(crate) fn new(
        project: &ProjectInfo,
        settings: &Settings,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let name = env_name(&project.name, &project.dir)?;
        let layout = Layout::resolve(&project.dir, settings);
        let mut backend = Self {
            project: project.clone(),
            name,
            path: PathBuf::new(),
            layout,
            runner,
        };
        backend.path = backend.locate().unwrap_or_else(|| backend.default_path());
        debug!(
            "Resolved poetry environment {} at {} for project {}",
            backend.name,
            backend.path.display(),
            project.name
        );
        Ok(backend)
    }

    fn default_path(&self) -> PathBuf {
        match &self.layout {
            Layout::InProject(venv) => venv.clone(),
            Layout::Shared(root) => root.join(&self.name),
        }
    }

    /// Probes the disk for the virtualenv.
    ///
    /// Poetry appends the interpreter version to the directory name, so the
    /// location is only known once the environment exists.
    fn locate(&self) -> Option<PathBuf> {
        match &self.layout {
            Layout::InProject(venv) => venv.is_dir().then(|| venv.clone()),
            Layout::Shared(root) => find_venv(root, &self.name),
        }
    }

    fn handle(&self) -> EnvironmentHandle {
        EnvironmentHandle {
            name: self.name.clone(),
            path: self.locate().unwrap_or_else(|| self.path.clone()),
        }
    }

    fn poetry(&self) -> Invocation {
        Invocation::new("poetry").args(["--directory".to_owned(), self.project.dir.display().to_string()])
    }
}

impl EnvironmentBackend for PoetryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Poetry
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn exists(&self) -> Result<bool> {
        Ok(self.locate().is_some())
    }

    fn create(&self) -> Result<EnvironmentHandle> {
        if self.exists()? {
            warn!("Poetry environment {} already exists", self.name);
            return Ok(self.handle());
        }

        info!("Creating poetry environment {}", self.name);
        let stdout = self.runner.run(&self.poetry().args(["env", "use", "python"]))?;
        debug!("{stdout}");
        Ok(self.handle())
    }

    fn contains(&self, project: &str) -> Result<bool> {
        let Some(venv) = self.locate() else {
            return Ok(false);
        };

        let root = Pattern::escape(&venv.to_string_lossy());
        let package = Pattern::escape(&project.replace(['-', '.'], "_"));
        let options = MatchOptions {
            case_sensitive: false,
            ..MatchOptions::new()
        };

        for layout in ["lib/python*/site-packages", "Lib/site-packages"] {
            let pattern = format!("{root}/{layout}/{package}-*.dist-info");
            if glob::glob_with(&pattern, options)?.any(|found| found.is_ok()) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn install(&self, extras: &BTreeSet<String>) -> Result<()> {
        self.project.check_extras(extras)?;

        let mut invocation = self.poetry().arg("install");
        for extra in extras {
            invocation = invocation.args(["-E", extra.as_str()]);
        }
        let stdout = self.runner.run(&invocation)?;
        debug!("{stdout}");
        Ok(())
    }

    fn run(&self, args: &[String]) -> Result<String> {
        let invocation = self.poetry().arg("run").args(args.iter().map(String::as_str));
        self.runner.run(&invocation)
    }
}
