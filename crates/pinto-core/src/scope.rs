//! Scoped overlays on the process environment.
//!
//! A [`VariableScope`] installs a set of variables into the ambient process
//! environment and puts every touched key back the way it was when dropped,
//! whether the scoped block returned, failed or panicked. Child processes
//! spawned while the scope is alive inherit the overlay.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Name of the variable file looked up when none is given explicitly.
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Variable name to value mapping.
pub type Variables = BTreeMap<String, String>;

/// Serializes every scope in the process.
static SCOPE_LOCK: Mutex<()> = Mutex::new(());

thread_local! {
    static ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Where the variables for a scope come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ScopeSource {
    /// `.env` in the target directory, if present.
    #[default]
    Default,
    /// A variable file. Relative paths are resolved against the target directory.
    File(PathBuf),
    /// Explicit variables.
    Map(Variables),
}

impl ScopeSource {
    /// Produces the overlay for a scope rooted at `dir`.
    ///
    /// A file that does not exist yields an empty overlay.
    ///
    /// # Errors
    /// Returns an error if the variable file cannot be read or is malformed.
    pub fn resolve(&self, dir: &Path) -> Result<Variables> {
        match self {
            Self::Map(variables) => Ok(variables.clone()),
            Self::File(path) => {
                let file = dir.join(path);
                if file.is_file() {
                    read_env_file(&file)
                } else {
                    warn!("Environment file {} does not exist, ignoring", file.display());
                    Ok(Variables::new())
                }
            }
            Self::Default => {
                let file = dir.join(DEFAULT_ENV_FILE);
                if file.is_file() {
                    read_env_file(&file)
                } else {
                    Ok(Variables::new())
                }
            }
        }
    }
}

/// Reads a `KEY=VALUE` per line variable file. Blank lines are skipped.
///
/// # Errors
/// Returns an error if the file cannot be read, or if a non-blank line holds
/// zero or more than one `=`.
pub fn read_env_file(path: &Path) -> Result<Variables> {
    let contents = fs::read_to_string(path)?;
    let mut variables = Variables::new();
    for (index, row) in contents.lines().enumerate() {
        if row.trim().is_empty() {
            continue;
        }

        let mut parts = row.split('=');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(key), Some(value), None) if !key.is_empty() => {
                variables.insert(key.to_owned(), value.to_owned());
            }
            _ => {
                return Err(Error::MalformedEnvFile {
                    path: path.to_path_buf(),
                    line: index + 1,
                });
            }
        }
    }
    Ok(variables)
}

/// Guard over an overlay applied to the process environment.
///
/// Only one scope can be alive in the process at a time. Scopes entered from
/// other threads block until the current one is dropped.
#[derive(Debug)]
pub struct VariableScope {
    /// Touched keys with the value each had before the scope, in insertion order.
    previous: Vec<(String, Option<OsString>)>,
    /// Held for the lifetime of the scope.
    _lock: MutexGuard<'static, ()>,
}

impl VariableScope {
    /// Installs `overlay` into the process environment.
    ///
    /// # Errors
    /// Returns [`Error::ScopeActive`] if this thread already holds a scope, and
    /// [`Error::InvalidVariable`] if a key or value cannot be stored in the
    /// environment.
    pub fn enter(overlay: &Variables) -> Result<Self> {
        if ACTIVE.get() {
            return Err(Error::ScopeActive);
        }
        for (key, value) in overlay {
            if key.is_empty() || key.contains(['=', '\0']) || value.contains('\0') {
                return Err(Error::InvalidVariable(key.clone()));
            }
        }

        let lock = SCOPE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        ACTIVE.set(true);

        let mut previous = Vec::with_capacity(overlay.len());
        for (key, value) in overlay {
            let prior = env::var_os(key);
            match &prior {
                Some(old) => debug!(
                    "Setting environment variable {key} from {} to {value}",
                    old.to_string_lossy()
                ),
                None => debug!("Setting environment variable {key} to {value}"),
            }
            previous.push((key.clone(), prior));
            set_variable(key, OsStr::new(value));
        }

        Ok(Self {
            previous,
            _lock: lock,
        })
    }

    /// Keys installed by this scope.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.previous.iter().map(|(key, _)| key.as_str())
    }
}

impl Drop for VariableScope {
    fn drop(&mut self) {
        for (key, prior) in self.previous.drain(..).rev() {
            match prior {
                Some(old) => {
                    debug!("Resetting environment variable {key}");
                    set_variable(&key, &old);
                }
                None => {
                    debug!("Removing environment variable {key}");
                    remove_variable(&key);
                }
            }
        }
        ACTIVE.set(false);
    }
}

/// Runs `block` with `overlay` installed, restoring the environment afterwards.
///
/// # Errors
/// Returns an error if the scope cannot be entered, or whatever `block` returns.
pub fn with_variables<T, F>(overlay: &Variables, block: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let _scope = VariableScope::enter(overlay)?;
    block()
}

#[allow(unsafe_code, reason = "environment writes happen only under SCOPE_LOCK")]
fn set_variable(key: &str, value: &OsStr) {
    // SAFETY: the caller holds SCOPE_LOCK, and nothing else in the crate writes the environment.
    unsafe { env::set_var(key, value) };
}

#[allow(unsafe_code, reason = "environment writes happen only under SCOPE_LOCK")]
fn remove_variable(key: &str) {
    // SAFETY: the caller holds SCOPE_LOCK, and nothing else in the crate writes the environment.
    unsafe { env::remove_var(key) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::catch_unwind;
    use tempfile::TempDir;

    fn overlay(pairs: &[(&str, &str)]) -> Variables {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    fn preset(key: &str, value: &str) {
        let _lock = SCOPE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        set_variable(key, OsStr::new(value));
    }

    #[test]
    fn test_scope_round_trip() {
        preset("PINTO_SCOPE_RT_EXISTING", "old");

        let vars = overlay(&[
            ("PINTO_SCOPE_RT_EXISTING", "new"),
            ("PINTO_SCOPE_RT_FRESH", "fresh"),
        ]);
        {
            let scope = VariableScope::enter(&vars).unwrap();
            assert_eq!(env::var("PINTO_SCOPE_RT_EXISTING").unwrap(), "new");
            assert_eq!(env::var("PINTO_SCOPE_RT_FRESH").unwrap(), "fresh");
            assert_eq!(scope.keys().count(), 2);
        }

        assert_eq!(env::var("PINTO_SCOPE_RT_EXISTING").unwrap(), "old");
        assert!(env::var_os("PINTO_SCOPE_RT_FRESH").is_none());
    }

    #[test]
    fn test_scope_restores_after_error() {
        preset("PINTO_SCOPE_ERR_EXISTING", "kept");
        let vars = overlay(&[
            ("PINTO_SCOPE_ERR_EXISTING", "clobbered"),
            ("PINTO_SCOPE_ERR_FRESH", "1"),
        ]);

        let result: Result<()> = with_variables(&vars, || {
            assert_eq!(env::var("PINTO_SCOPE_ERR_EXISTING").unwrap(), "clobbered");
            Err(Error::InvalidStep("boom".to_owned()))
        });

        assert!(matches!(result, Err(Error::InvalidStep(_))));
        assert_eq!(env::var("PINTO_SCOPE_ERR_EXISTING").unwrap(), "kept");
        assert!(env::var_os("PINTO_SCOPE_ERR_FRESH").is_none());
    }

    #[test]
    fn test_scope_restores_after_panic() {
        let vars = overlay(&[("PINTO_SCOPE_PANIC_FRESH", "1")]);
        let outcome = catch_unwind(|| {
            let _scope = VariableScope::enter(&vars).unwrap();
            panic!("step exploded");
        });

        assert!(outcome.is_err());
        assert!(env::var_os("PINTO_SCOPE_PANIC_FRESH").is_none());

        // the lock must still be usable after being poisoned
        let again = VariableScope::enter(&vars).unwrap();
        assert_eq!(env::var("PINTO_SCOPE_PANIC_FRESH").unwrap(), "1");
        drop(again);
    }

    #[test]
    fn test_nested_scope_rejected() {
        let outer = VariableScope::enter(&overlay(&[("PINTO_SCOPE_NEST_A", "a")])).unwrap();
        let inner = VariableScope::enter(&overlay(&[("PINTO_SCOPE_NEST_B", "b")]));
        assert!(matches!(inner, Err(Error::ScopeActive)));
        assert!(env::var_os("PINTO_SCOPE_NEST_B").is_none());
        drop(outer);

        let retry = VariableScope::enter(&overlay(&[("PINTO_SCOPE_NEST_B", "b")]));
        assert!(retry.is_ok());
    }

    #[test]
    fn test_invalid_key_rejected() {
        let result = VariableScope::enter(&overlay(&[("BAD=KEY", "x")]));
        assert!(matches!(result, Err(Error::InvalidVariable(_))));
    }

    #[test]
    fn test_read_env_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".env");
        fs::write(&path, "ENVARG1=thom\n\nENVARG2=thom-yorke\n").unwrap();

        let vars = read_env_file(&path).unwrap();
        assert_eq!(vars, overlay(&[("ENVARG1", "thom"), ("ENVARG2", "thom-yorke")]));
    }

    #[test]
    fn test_read_env_file_malformed() {
        let temp = TempDir::new().unwrap();
        let no_separator = temp.path().join("missing");
        fs::write(&no_separator, "GOOD=1\nBAD\n").unwrap();
        match read_env_file(&no_separator) {
            Err(Error::MalformedEnvFile { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected malformed file error, got {other:?}"),
        }

        let two_separators = temp.path().join("double");
        fs::write(&two_separators, "A=b=c\n").unwrap();
        assert!(matches!(
            read_env_file(&two_separators),
            Err(Error::MalformedEnvFile { line: 1, .. })
        ));
    }

    #[test]
    fn test_source_resolution() {
        let temp = TempDir::new().unwrap();

        // nothing to load yet
        assert!(ScopeSource::Default.resolve(temp.path()).unwrap().is_empty());

        fs::write(temp.path().join(".env"), "KEY=default\n").unwrap();
        fs::write(temp.path().join("other.env"), "KEY=explicit\n").unwrap();

        let from_default = ScopeSource::Default.resolve(temp.path()).unwrap();
        assert_eq!(from_default, overlay(&[("KEY", "default")]));

        let from_file = ScopeSource::File(PathBuf::from("other.env"))
            .resolve(temp.path())
            .unwrap();
        assert_eq!(from_file, overlay(&[("KEY", "explicit")]));

        let missing = ScopeSource::File(PathBuf::from("nope.env"))
            .resolve(temp.path())
            .unwrap();
        assert!(missing.is_empty());

        let explicit = ScopeSource::Map(overlay(&[("KEY", "map")]))
            .resolve(temp.path())
            .unwrap();
        assert_eq!(explicit, overlay(&[("KEY", "map")]));
    }
}
