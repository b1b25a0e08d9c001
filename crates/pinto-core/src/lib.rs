//! Core of pinto, a build and run tool for Python projects.
//!
//! A [`Project`] owns a `pyproject.toml` and an isolated environment managed
//! by either Poetry or Conda. A [`Pipeline`] runs a sequence of commands across
//! several projects, each inside its own environment, sharing one set of
//! variables from a `.env` file.
#![cfg_attr(
    test,
    allow(
        dead_code,
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::missing_errors_doc,
        clippy::print_stdout,
        clippy::print_stderr,
        reason = "Allow for tests"
    )
)]

/// Environment backends and their resolution.
pub mod environment;
/// Error types and result definitions.
pub mod error;
/// Typed `pyproject.toml` access.
pub mod manifest;
/// Pipelines of steps across projects.
pub mod pipeline;
/// External process execution.
pub mod process;
/// Projects and their lifecycle.
pub mod project;
/// Scoped process environment overlays.
pub mod scope;

#[cfg(test)]
mod test_support;

pub use environment::{BackendKind, Environment, EnvironmentBackend, EnvironmentHandle};
pub use error::{Error, ErrorKind, Result};
pub use manifest::Manifest;
pub use pipeline::{CONFIG_REF_FLAG, Pipeline, Step, StepOutput};
pub use process::{CommandRunner, Invocation, SystemRunner};
pub use project::Project;
pub use scope::{ScopeSource, VariableScope, Variables, with_variables};
