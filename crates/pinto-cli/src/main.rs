//! pinto - build and run Python projects and pipelines in isolated environments
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

use clap::Parser as _;
use cli::Cli;
use std::process::ExitCode;
use tracing::error;

mod cli;
mod handlers;
mod logging;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = logging::init(cli.verbose, cli.log_file.as_deref()) {
        error!("Failed to open log file: {err:#}");
        return ExitCode::FAILURE;
    }

    match handlers::dispatch(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            child_code(&err).map_or(ExitCode::FAILURE, ExitCode::from)
        }
    }
}

/// Exit code of the failed child process behind `err`, when it has a usable one.
fn child_code(err: &anyhow::Error) -> Option<u8> {
    err.downcast_ref::<pinto_core::Error>()
        .and_then(pinto_core::Error::exit_code)
        .and_then(|code| u8::try_from(code).ok())
        .filter(|code| *code != 0)
}
