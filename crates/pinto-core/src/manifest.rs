//! Typed view over a project's `pyproject.toml`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::{Table, Value};

use crate::error::{Error, Result};

/// File name of the manifest inside a project or pipeline directory.
pub const MANIFEST_FILE: &str = "pyproject.toml";

/// Parsed `pyproject.toml`, restricted to the tables pinto reads.
#[derive(Debug, Clone, Default, Deserialize)]
struct Document {
    #[serde(default)]
    tool: ToolTables,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ToolTables {
    poetry: Option<PoetryTable>,
    pinto: Option<PintoTable>,
    typeo: Option<TypeoTable>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PoetryTable {
    name: Option<String>,
    #[serde(default)]
    extras: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    scripts: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PintoTable {
    steps: Option<Vec<String>>,
    base_env: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TypeoTable {
    scripts: Option<ScriptNames>,
}

/// `tool.typeo.scripts`: a table keyed by script name, or a bare list of names.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ScriptNames {
    Table(Table),
    List(Vec<String>),
}

impl ScriptNames {
    fn names(&self) -> BTreeSet<String> {
        match self {
            Self::Table(table) => table.keys().cloned().collect(),
            Self::List(names) => names.iter().cloned().collect(),
        }
    }
}

/// Read-only manifest of a project or pipeline.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Location the manifest was read from.
    path: PathBuf,
    /// Parsed contents.
    document: Document,
}

impl Manifest {
    /// Opens the manifest inside `dir`.
    ///
    /// `kind` names what is being opened and only shows up in errors.
    ///
    /// # Errors
    /// Returns [`Error::MissingManifest`] if there is no manifest in `dir`, or a
    /// parse error if it is not valid TOML.
    pub fn open(dir: &Path, kind: &'static str) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        if !path.is_file() {
            return Err(Error::MissingManifest {
                kind,
                dir: dir.to_path_buf(),
                manifest: path,
            });
        }
        Self::load(&path)
    }

    /// Loads a manifest from an explicit file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let document = load_toml(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            document,
        })
    }

    /// Location of the manifest file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn missing(&self, table: &'static str) -> Error {
        Error::MissingTable {
            table,
            manifest: self.path.clone(),
        }
    }

    fn poetry(&self) -> Result<&PoetryTable> {
        self.document
            .tool
            .poetry
            .as_ref()
            .ok_or_else(|| self.missing("tool.poetry"))
    }

    /// `tool.poetry.name`.
    ///
    /// # Errors
    /// Returns [`Error::MissingTable`] naming `tool.poetry` or
    /// `tool.poetry.name`, whichever is absent.
    pub fn project_name(&self) -> Result<&str> {
        self.poetry()?
            .name
            .as_deref()
            .ok_or_else(|| self.missing("tool.poetry.name"))
    }

    /// Names of the extras declared in `tool.poetry.extras`.
    pub fn extras(&self) -> BTreeSet<String> {
        self.document
            .tool
            .poetry
            .as_ref()
            .map(|poetry| poetry.extras.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of the console scripts declared in `tool.poetry.scripts`.
    pub fn scripts(&self) -> Vec<&str> {
        self.document
            .tool
            .poetry
            .as_ref()
            .map(|poetry| poetry.scripts.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// `tool.pinto.steps`, in declaration order.
    ///
    /// # Errors
    /// Returns [`Error::MissingTable`] if the table or key is absent.
    pub fn steps(&self) -> Result<&[String]> {
        let pinto = self
            .document
            .tool
            .pinto
            .as_ref()
            .ok_or_else(|| self.missing("tool.pinto"))?;
        pinto
            .steps
            .as_deref()
            .ok_or_else(|| self.missing("tool.pinto.steps"))
    }

    /// `tool.pinto.base_env`, if set.
    pub fn base_env(&self) -> Option<&str> {
        self.document
            .tool
            .pinto
            .as_ref()
            .and_then(|pinto| pinto.base_env.as_deref())
    }

    /// Script names registered in `tool.typeo.scripts`.
    ///
    /// `scripts` may be a table or an array of names. A `tool.typeo` table
    /// without `scripts` yields an empty set.
    ///
    /// # Errors
    /// Returns [`Error::MissingTable`] if there is no `tool.typeo` table.
    pub fn typeo_scripts(&self) -> Result<BTreeSet<String>> {
        let typeo = self
            .document
            .tool
            .typeo
            .as_ref()
            .ok_or_else(|| self.missing("tool.typeo"))?;
        Ok(typeo
            .scripts
            .as_ref()
            .map(ScriptNames::names)
            .unwrap_or_default())
    }
}

/// Reads and deserializes a TOML file.
///
/// # Errors
/// Returns an error if the file cannot be read or does not match `T`.
pub(crate) fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)?;
    toml::from_str(&contents).map_err(|source| Error::ManifestParse {
        path: path.to_path_buf(),
        source,
    })
}
