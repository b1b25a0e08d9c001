//! Shared fixtures for unit tests.

use std::fmt::{self, Debug, Formatter};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Result;
use crate::manifest::MANIFEST_FILE;
use crate::process::{CommandRunner, Invocation};

type Responder = Box<dyn FnMut(&Invocation) -> Result<String> + Send>;

/// Runner that records invocations and answers them from a closure.
pub struct MockRunner {
    calls: Mutex<Vec<Invocation>>,
    responder: Mutex<Responder>,
}

impl MockRunner {
    /// Runner that answers every invocation with empty stdout.
    pub fn shared() -> Arc<Self> {
        Self::with_responder(|_| Ok(String::new()))
    }

    /// Runner that answers with `responder`.
    pub fn with_responder<F>(responder: F) -> Arc<Self>
    where
        F: FnMut(&Invocation) -> Result<String> + Send + 'static,
    {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responder: Mutex::new(Box::new(responder)),
        })
    }

    /// Every invocation so far, in order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every invocation so far, rendered as command lines.
    pub fn rendered(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }
}

impl Debug for MockRunner {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("MockRunner")
            .field("calls", &self.calls)
            .finish_non_exhaustive()
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, invocation: &Invocation) -> Result<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(invocation.clone());
        let mut responder = self.responder.lock().unwrap_or_else(PoisonError::into_inner);
        responder(invocation)
    }
}

/// Writes a Poetry project manifest named `name` into `dir`.
pub fn write_project(dir: &Path, name: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(
        dir.join(MANIFEST_FILE),
        format!(
            "[tool.poetry]\nname = \"{name}\"\nversion = \"0.0.1\"\n\n\
             [tool.poetry.scripts]\ntestme = \"{name}:main\"\n\n\
             [tool.poetry.extras]\nextra = [\"attrs\"]\n"
        ),
    )
    .unwrap();
    // keep the environment inside the fixture
    fs::write(dir.join("poetry.toml"), "[virtualenvs]\nin-project = true\n").unwrap();
}

/// Writes a pipeline manifest with the given steps and typeo scripts into `dir`.
pub fn write_pipeline(dir: &Path, steps: &[&str], typeo_scripts: &[&str]) {
    fs::create_dir_all(dir).unwrap();
    let steps = steps
        .iter()
        .map(|step| format!("\"{step}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let mut contents = format!("[tool.pinto]\nsteps = [{steps}]\n\n[tool.typeo]\nverbose = false\n");
    for script in typeo_scripts {
        contents.push_str(&format!("\n[tool.typeo.scripts.{script}]\nepochs = 1\n"));
    }
    fs::write(dir.join(MANIFEST_FILE), contents).unwrap();
}

/// Responds to `poetry --directory <dir> ...` the way Poetry would for a
/// fixture written by [`write_project`]: `env use` creates `.venv`, `install`
/// registers the package and `run` echoes its arguments.
pub fn poetry_responder() -> impl FnMut(&Invocation) -> Result<String> + Send + 'static {
    |invocation: &Invocation| {
        let args = invocation.arguments();
        let dir = Path::new(&args[1]);
        let venv = dir.join(".venv");
        match args[2].as_str() {
            "env" => fs::create_dir_all(&venv)?,
            "install" => {
                let name = dir.file_name().unwrap().to_string_lossy();
                fs::create_dir_all(
                    venv.join(format!("lib/python3.11/site-packages/{name}-0.0.1.dist-info")),
                )?;
            }
            _ => return Ok(args[3..].join(" ")),
        }
        Ok(String::new())
    }
}
