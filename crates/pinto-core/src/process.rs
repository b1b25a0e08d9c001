//! Process invocation.
//!
//! `CommandRunner` is the seam every backend goes through to reach an external
//! tool. `SystemRunner` is the production implementation; it passes each
//! argument to the child verbatim and never goes through a shell.

use std::env;
use std::fmt::{self, Debug, Display, Formatter};
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::{Error, Result};

/// A program plus its argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program to execute, looked up on `PATH` when not a path.
    program: String,
    /// Arguments, each handed to the child as a single argv entry.
    args: Vec<String>,
    /// Working directory; inherits the caller's when unset.
    cwd: Option<PathBuf>,
    /// Variables set for the child on top of the inherited environment.
    envs: Vec<(String, String)>,
}

impl Invocation {
    /// Creates an invocation of `program` with no arguments.
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Runs the child in `dir`.
    #[must_use]
    pub fn current_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Sets `key` to `value` for the child only.
    #[must_use]
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Program to execute.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Argument vector.
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Working directory, if one was set.
    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Variables set for the child, in the order they were added.
    pub fn variables(&self) -> &[(String, String)] {
        &self.envs
    }
}

impl Display for Invocation {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(formatter, " {arg:?}")?;
            } else {
                write!(formatter, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Executes invocations and captures their standard output.
pub trait CommandRunner: Debug + Send + Sync {
    /// Runs `invocation` to completion.
    ///
    /// The child inherits the current process environment, plus the
    /// invocation's own variables.
    ///
    /// # Errors
    /// Returns [`Error::Spawn`] if the program cannot be started and
    /// [`Error::Execution`], carrying the child's stderr, if it exits
    /// unsuccessfully.
    fn run(&self, invocation: &Invocation) -> Result<String>;
}

/// Runner that spawns real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<String> {
        debug!("Executing command: {invocation}");

        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args);
        if let Some(dir) = &invocation.cwd {
            command.current_dir(dir);
        }
        command.envs(invocation.envs.iter().map(|(key, value)| (key, value)));

        let output = command.output().map_err(|source| Error::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        let exit_code = output.status.code();
        debug!("Command finished with exit code {exit_code:?}: {invocation}");

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(Error::Execution {
                command: invocation.to_string(),
                code: exit_code,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}

/// Finds `name` on `PATH`.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
