//! Multi-project pipelines.
//!
//! A pipeline directory lists steps as `component:command[:subcommand]` in
//! `tool.pinto.steps`. Each step runs `command` inside the environment of the
//! project at `<pipeline>/<component>`, pointed back at the pipeline's
//! `tool.typeo` configuration through [`CONFIG_REF_FLAG`].

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::process::{CommandRunner, SystemRunner};
use crate::project::Project;
use crate::scope::{DEFAULT_ENV_FILE, ScopeSource, read_env_file};

/// Flag that hands a step its configuration descriptor.
pub const CONFIG_REF_FLAG: &str = "--typeo";

/// One parsed pipeline step.
///
/// Parsed from `component:command` or `component:command:subcommand`. Every
/// segment must be non-empty, so `lib::unit` and `lib:build:` are rejected
/// along with any other number of `:`-separated parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Project directory, relative to the pipeline.
    pub component: String,
    /// Command to run inside the component's environment.
    pub command: String,
    /// Optional subcommand, forwarded through the descriptor.
    pub subcommand: Option<String>,
}

impl FromStr for Step {
    type Err = Error;

    fn from_str(step: &str) -> Result<Self> {
        let invalid = || Error::InvalidStep(step.to_owned());
        let parts: Vec<&str> = step.split(':').collect();
        if parts.iter().any(|part| part.is_empty()) {
            return Err(invalid());
        }

        match parts.as_slice() {
            [component, command] => Ok(Self {
                component: (*component).to_owned(),
                command: (*command).to_owned(),
                subcommand: None,
            }),
            [component, command, subcommand] => Ok(Self {
                component: (*component).to_owned(),
                command: (*command).to_owned(),
                subcommand: Some((*subcommand).to_owned()),
            }),
            _ => Err(invalid()),
        }
    }
}

impl Display for Step {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}", self.component, self.command)?;
        if let Some(subcommand) = &self.subcommand {
            write!(formatter, ":{subcommand}")?;
        }
        Ok(())
    }
}

/// Captured result of a step that ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    /// The step.
    pub step: Step,
    /// Its standard output.
    pub stdout: String,
}

/// A directory whose manifest sequences steps across projects.
#[derive(Debug)]
pub struct Pipeline {
    path: PathBuf,
    manifest: Manifest,
    steps: Vec<Step>,
    typeo_scripts: BTreeSet<String>,
    runner: Arc<dyn CommandRunner>,
}

impl Pipeline {
    /// Opens the pipeline at `path`, driving real `poetry` and `conda` binaries.
    ///
    /// # Errors
    /// See [`Pipeline::with_runner`].
    pub fn new(path: &Path) -> Result<Self> {
        Self::with_runner(path, Arc::new(SystemRunner))
    }

    /// Opens the pipeline at `path`, sending every external command through `runner`.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if `path` does not exist, a configuration
    /// error if the manifest is missing or lacks `tool.pinto.steps` or
    /// `tool.typeo`, and [`Error::InvalidStep`] for the first malformed step.
    pub fn with_runner(path: &Path, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let dir = path
            .canonicalize()
            .map_err(|_| Error::NotFound {
                kind: "Pipeline",
                path: path.to_path_buf(),
            })?;
        let manifest = Manifest::open(&dir, "Pipeline")?;
        let steps = manifest
            .steps()?
            .iter()
            .map(|step| step.parse())
            .collect::<Result<Vec<Step>>>()?;
        let typeo_scripts = manifest.typeo_scripts()?;

        Ok(Self {
            path: dir,
            manifest,
            steps,
            typeo_scripts,
            runner,
        })
    }

    /// Canonical pipeline directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parsed manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Opens the project for `component`.
    ///
    /// # Errors
    /// Returns any error [`Project::with_runner`] does.
    pub fn create_project(&self, component: &str) -> Result<Project> {
        Project::with_runner(&self.path.join(component), Arc::clone(&self.runner))
    }

    /// Descriptor locating the configuration for `step`.
    ///
    /// Commands registered under `tool.typeo.scripts` get `:command` and then
    /// `:subcommand`. Other commands only forward a subcommand, as `::subcommand`.
    pub fn config_ref(&self, step: &Step) -> String {
        let mut descriptor = self.path.display().to_string();
        if self.typeo_scripts.contains(&step.command) {
            descriptor.push(':');
            descriptor.push_str(&step.command);
            if let Some(subcommand) = &step.subcommand {
                descriptor.push(':');
                descriptor.push_str(subcommand);
            }
        } else if let Some(subcommand) = &step.subcommand {
            descriptor.push_str("::");
            descriptor.push_str(subcommand);
        }
        descriptor
    }

    /// Runs one step inside its component's environment.
    ///
    /// # Errors
    /// Returns an error if the component cannot be opened or the command fails.
    pub fn run_step(&self, step: &Step, scope: &ScopeSource) -> Result<String> {
        let project = self.create_project(&step.component)?;
        let args = [
            step.command.clone(),
            CONFIG_REF_FLAG.to_owned(),
            self.config_ref(step),
        ];
        project.run(&args, scope)
    }

    /// Runs every step in order, stopping at the first failure.
    ///
    /// Variables come from `env_file` (relative to the pipeline, `.env` when
    /// `None`) and apply to every step. When that file does not exist, each
    /// step falls back to its own project's `.env`.
    ///
    /// # Errors
    /// Returns the first error any step produces.
    pub fn run(&self, env_file: Option<&Path>) -> Result<Vec<StepOutput>> {
        let file = self
            .path
            .join(env_file.unwrap_or_else(|| Path::new(DEFAULT_ENV_FILE)));
        let scope = if file.is_file() {
            ScopeSource::Map(read_env_file(&file)?)
        } else {
            if env_file.is_some() {
                warn!(
                    "Environment file {} does not exist, using project defaults",
                    file.display()
                );
            }
            ScopeSource::Default
        };

        let mut outputs = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            debug!("Executing pipeline step {step}");
            let stdout = self.run_step(step, &scope)?;
            info!("{stdout}");
            outputs.push(StepOutput {
                step: step.clone(),
                stdout,
            });
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockRunner, poetry_responder, write_pipeline, write_project};
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    fn step(component: &str, command: &str, subcommand: Option<&str>) -> Step {
        Step {
            component: component.to_owned(),
            command: command.to_owned(),
            subcommand: subcommand.map(str::to_owned),
        }
    }

    fn fixture(steps: &[&str], typeo_scripts: &[&str]) -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("pipeline");
        write_pipeline(&dir, steps, typeo_scripts);
        write_project(&dir.join("lib"), "lib");
        write_project(&dir.join("app"), "app");
        (temp, dir)
    }

    #[test]
    fn test_step_grammar() {
        assert_eq!("lib:build".parse::<Step>().unwrap(), step("lib", "build", None));
        assert_eq!(
            "lib:test:unit".parse::<Step>().unwrap(),
            step("lib", "test", Some("unit"))
        );
        assert_eq!(step("lib", "test", Some("unit")).to_string(), "lib:test:unit");

        for bad in ["lib", "a:b:c:d", "lib::unit", "lib:build:", ":build", ""] {
            match bad.parse::<Step>() {
                Err(Error::InvalidStep(raw)) => assert_eq!(raw, bad),
                other => panic!("expected invalid step for {bad:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_config_ref_shapes() {
        let (_temp, dir) = fixture(&["lib:build"], &["test"]);
        let pipeline = Pipeline::with_runner(&dir, MockRunner::shared()).unwrap();
        let root = pipeline.path().display().to_string();

        assert_eq!(pipeline.config_ref(&step("lib", "test", None)), format!("{root}:test"));
        assert_eq!(
            pipeline.config_ref(&step("lib", "test", Some("unit"))),
            format!("{root}:test:unit")
        );
        assert_eq!(pipeline.config_ref(&step("lib", "build", None)), root);
        assert_eq!(
            pipeline.config_ref(&step("lib", "build", Some("fast"))),
            format!("{root}::fast")
        );
    }

    #[test]
    fn test_config_ref_with_listed_scripts() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("pipeline");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("pyproject.toml"),
            "[tool.pinto]\nsteps = [\"lib:train\"]\n\n[tool.typeo]\nscripts = [\"train\"]\n",
        )
        .unwrap();

        let pipeline = Pipeline::with_runner(&dir, MockRunner::shared()).unwrap();
        let root = pipeline.path().display().to_string();
        assert_eq!(
            pipeline.config_ref(&step("lib", "train", Some("fast"))),
            format!("{root}:train:fast")
        );
        assert_eq!(pipeline.config_ref(&step("lib", "build", None)), root);
    }

    #[test]
    fn test_construction_errors() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path();

        match Pipeline::new(&dir.join("nope")) {
            Err(error @ Error::NotFound { kind: "Pipeline", .. }) => {
                assert!(error.to_string().starts_with("Pipeline "));
            }
            other => panic!("expected missing pipeline, got {other:?}"),
        }
        assert!(matches!(
            Pipeline::new(dir),
            Err(Error::MissingManifest {
                kind: "Pipeline",
                ..
            })
        ));

        fs::write(dir.join("pyproject.toml"), "[tool.typeo]\n").unwrap();
        assert!(matches!(
            Pipeline::new(dir),
            Err(Error::MissingTable { table: "tool.pinto", .. })
        ));

        fs::write(dir.join("pyproject.toml"), "[tool.pinto]\n[tool.typeo]\n").unwrap();
        assert!(matches!(
            Pipeline::new(dir),
            Err(Error::MissingTable {
                table: "tool.pinto.steps",
                ..
            })
        ));

        fs::write(dir.join("pyproject.toml"), "[tool.pinto]\nsteps = [\"lib:build\"]\n").unwrap();
        assert!(matches!(
            Pipeline::new(dir),
            Err(Error::MissingTable { table: "tool.typeo", .. })
        ));

        write_pipeline(dir, &["lib:build", "lib:a:b:c"], &[]);
        match Pipeline::new(dir) {
            Err(Error::InvalidStep(raw)) => assert_eq!(raw, "lib:a:b:c"),
            other => panic!("expected invalid step, got {other:?}"),
        }
    }

    #[test]
    fn test_run_executes_steps_in_order() {
        let (_temp, dir) = fixture(&["lib:build", "lib:test:unit", "app:serve"], &["test"]);
        let runner = MockRunner::with_responder(poetry_responder());
        let shared = Arc::clone(&runner);
        let pipeline = Pipeline::with_runner(&dir, shared).unwrap();
        let root = pipeline.path().display().to_string();

        let outputs = pipeline.run(None).unwrap();
        let stdouts: Vec<&str> = outputs.iter().map(|output| output.stdout.as_str()).collect();
        assert_eq!(
            stdouts,
            vec![
                format!("build --typeo {root}"),
                format!("test --typeo {root}:test:unit"),
                format!("serve --typeo {root}"),
            ]
        );
        assert_eq!(outputs[1].step, step("lib", "test", Some("unit")));

        let commands: Vec<String> = runner
            .calls()
            .iter()
            .map(|call| call.arguments()[2..].join(" "))
            .collect();
        assert_eq!(
            commands,
            vec![
                "env use python".to_owned(),
                "install".to_owned(),
                format!("run build --typeo {root}"),
                format!("run test --typeo {root}:test:unit"),
                "env use python".to_owned(),
                "install".to_owned(),
                format!("run serve --typeo {root}"),
            ]
        );
    }

    #[test]
    fn test_run_aborts_on_first_failure() {
        let (_temp, dir) = fixture(&["lib:build", "lib:test", "app:serve"], &[]);
        let mut poetry = poetry_responder();
        let runner = MockRunner::with_responder(move |invocation| {
            if invocation.arguments().get(3).is_some_and(|arg| arg == "test") {
                return Err(Error::Execution {
                    command: invocation.to_string(),
                    code: Some(4),
                    stderr: "tests failed\n".to_owned(),
                });
            }
            poetry(invocation)
        });
        let shared = Arc::clone(&runner);
        let pipeline = Pipeline::with_runner(&dir, shared).unwrap();

        let result = pipeline.run(None);
        assert!(matches!(result, Err(Error::Execution { code: Some(4), .. })));
        assert!(
            runner
                .calls()
                .iter()
                .all(|call| !call.arguments().iter().any(|arg| arg == "serve"))
        );
    }

    #[test]
    fn test_pipeline_env_file_applies_to_every_step() {
        let (_temp, dir) = fixture(&["lib:build", "app:build"], &[]);
        fs::write(dir.join(".env"), "PINTO_PIPELINE_VAR=pipeline\n").unwrap();
        fs::write(dir.join("custom.env"), "PINTO_PIPELINE_VAR=custom\n").unwrap();
        fs::write(dir.join("lib/.env"), "PINTO_PIPELINE_VAR=project\n").unwrap();

        let mut poetry = poetry_responder();
        let runner = MockRunner::with_responder(move |invocation| {
            if invocation.arguments()[2] == "run" {
                Ok(env::var("PINTO_PIPELINE_VAR").unwrap_or_default())
            } else {
                poetry(invocation)
            }
        });
        let pipeline = Pipeline::with_runner(&dir, runner).unwrap();

        let default_run = pipeline.run(None).unwrap();
        assert!(default_run.iter().all(|output| output.stdout == "pipeline"));
        assert!(env::var_os("PINTO_PIPELINE_VAR").is_none());

        let custom_run = pipeline.run(Some(Path::new("custom.env"))).unwrap();
        assert!(custom_run.iter().all(|output| output.stdout == "custom"));

        // a missing explicit file falls back to each project's own .env
        let fallback_run = pipeline.run(Some(Path::new("missing.env"))).unwrap();
        assert_eq!(fallback_run[0].stdout, "project");
        assert_eq!(fallback_run[1].stdout, "");
        assert!(env::var_os("PINTO_PIPELINE_VAR").is_none());
    }
}
