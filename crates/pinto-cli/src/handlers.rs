//! Command handlers for CLI operations

use anyhow::{Result, bail};
use pinto_core::{Error, Pipeline, Project, ScopeSource};
use std::collections::BTreeSet;
use std::io::{self, Write as _};
use std::path::Path;
use tracing::info;

use crate::cli::{Cli, Commands};

/// Runs the parsed command line.
///
/// # Errors
/// Returns whatever the selected command fails with.
pub fn dispatch(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Build { force, extras } => handle_build(&cli.project, *force, extras),
        Commands::Run { environment, args } => {
            handle_run(&cli.project, environment.as_deref(), args)
        }
    }
}

/// Builds the project's environment.
///
/// # Errors
/// Returns an error if the project cannot be opened or installed.
pub fn handle_build(path: &Path, force: bool, extras: &[String]) -> Result<()> {
    let project = Project::new(path)?;
    let extras: BTreeSet<String> = extras.iter().cloned().collect();
    project.install(force, &extras)?;
    Ok(())
}

/// Runs a command in a project, or executes the pipeline at `path`.
///
/// `path` is opened as a project first and only treated as a pipeline when
/// its manifest has no `tool.poetry` table.
///
/// # Errors
/// Returns an error if neither a project nor a pipeline can be opened, if the
/// arguments do not fit the target, or if execution fails.
pub fn handle_run(path: &Path, env_file: Option<&Path>, args: &[String]) -> Result<()> {
    match Project::new(path) {
        Ok(project) => run_project(&project, env_file, args),
        Err(Error::MissingTable {
            table: "tool.poetry",
            ..
        }) => run_pipeline(&Pipeline::new(path)?, env_file, args),
        Err(error) => Err(error.into()),
    }
}

fn run_project(project: &Project, env_file: Option<&Path>, args: &[String]) -> Result<()> {
    if args.is_empty() {
        bail!(
            "Must provide a command to run! Available scripts: {}",
            project.scripts().join(", ")
        );
    }

    let scope = env_file.map_or(ScopeSource::Default, |file| {
        ScopeSource::File(file.to_path_buf())
    });
    let stdout = project.run(args, &scope)?;
    io::stdout().lock().write_all(stdout.as_bytes())?;
    Ok(())
}

fn run_pipeline(pipeline: &Pipeline, env_file: Option<&Path>, args: &[String]) -> Result<()> {
    if !args.is_empty() {
        bail!(
            "Unknown arguments {args:?} passed for executing pipeline at path {}",
            pipeline.path().display()
        );
    }

    let outputs = pipeline.run(env_file)?;
    info!(
        "Pipeline at {} finished {} steps",
        pipeline.path().display(),
        outputs.len()
    );
    Ok(())
}
