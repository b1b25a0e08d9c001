//! Tracing setup.

use anyhow::Result;
use std::fs::File;
use std::io::{self, IsTerminal as _};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

/// Installs the global subscriber: stderr always, plus `log_file` when given.
///
/// Stderr logging is installed even when the log file cannot be created.
///
/// # Errors
/// Returns an error if `log_file` cannot be created.
pub fn init(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default_filter = if verbose {
        "pinto=debug,pinto_core=debug"
    } else {
        "pinto=info,pinto_core=info"
    };

    let (file, file_error) = match log_file.map(File::create).transpose() {
        Ok(file) => (file, None),
        Err(error) => (None, Some(error)),
    };

    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(io::stderr().is_terminal())
                .with_target(false),
        )
        .with(file.map(|writer| {
            fmt::layer()
                .with_writer(Arc::new(writer))
                .with_ansi(false)
                .with_target(true)
                .with_level(true)
        }))
        .init();

    file_error.map_or(Ok(()), |error| Err(error.into()))
}
