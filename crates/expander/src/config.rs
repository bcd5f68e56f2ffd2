//! Layered configuration.
//!
//! Layers are applied in order, later ones overriding scalar values and
//! extending list values:
//! 1. built-in defaults
//! 2. user config (`<config dir>/expander/expander.toml`)
//! 3. project config (`expander.toml`, or `[tool.expander]` in `pyproject.toml`)
//! 4. an explicit `--config` file
//! 5. environment variables (`EXPANDER_MARKER`, `EXPANDER_PYTHON`,
//!    `EXPANDER_PYTHON_VERSION`)
//!
//! Command line flags are applied on top by the binary.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use indexmap::IndexSet;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::dirs::{CONFIG_FILE_NAME, user_config_file};

/// Packages whose import machinery defeats static discovery.
pub const DEFAULT_EXCLUDES: [&str; 3] = ["networkx", "numba", "sklearn"];

/// Trailing argument the judge passes when compiling a submission.
pub const DEFAULT_MARKER: &str = "ONLINE_JUDGE";

/// Source suffix expected next to a compiled extension module.
pub const DEFAULT_EXTENSION_SOURCE_SUFFIX: &str = ".pyx";

/// Interpreter asked for its import path when no virtual environment is found.
pub const DEFAULT_PYTHON: &str = if cfg!(windows) { "python" } else { "python3" };

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Extra first-party source roots
    pub src: Vec<PathBuf>,
    /// Explicit installed-package roots, searched after `src`
    pub site_packages: Vec<PathBuf>,
    /// Top-level packages skipped during import discovery
    pub exclude: IndexSet<String>,
    /// Default set of top-level packages to embed
    pub modules: IndexSet<String>,
    /// Guard marker checked against `sys.argv[-1]`
    pub marker: String,
    pub extension_source_suffix: String,
    /// Interpreter whose `sys.path` supplies installed-package roots when no
    /// virtual environment is found; empty disables the lookup
    pub python: String,
    /// Python 3 minor version used for stdlib classification
    pub python_version: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            src: Vec::new(),
            site_packages: Vec::new(),
            exclude: DEFAULT_EXCLUDES.iter().map(|s| (*s).to_owned()).collect(),
            modules: IndexSet::new(),
            marker: DEFAULT_MARKER.to_owned(),
            extension_source_suffix: DEFAULT_EXTENSION_SOURCE_SUFFIX.to_owned(),
            python: DEFAULT_PYTHON.to_owned(),
            python_version: 11,
        }
    }
}

/// One configuration layer as it appears on disk. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
struct ConfigFile {
    src: Option<Vec<PathBuf>>,
    site_packages: Option<Vec<PathBuf>>,
    exclude: Option<Vec<String>>,
    modules: Option<Vec<String>>,
    marker: Option<String>,
    extension_source_suffix: Option<String>,
    python: Option<String>,
    python_version: Option<u8>,
}

impl Config {
    /// Load every configuration layer, starting from the current directory.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let cwd = std::env::current_dir().context("failed to determine current directory")?;
        let mut config = Self::load_from(user_config_file().as_deref(), &cwd, explicit)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load file layers only; environment variables are not consulted.
    pub fn load_from(
        user_file: Option<&Path>,
        project_dir: &Path,
        explicit: Option<&Path>,
    ) -> Result<Self> {
        let mut config = Self::default();

        if let Some(user_file) = user_file
            && user_file.is_file()
        {
            config.merge(read_config_file(user_file)?);
        }

        let project_file = project_dir.join(CONFIG_FILE_NAME);
        let pyproject = project_dir.join("pyproject.toml");
        if project_file.is_file() {
            config.merge(read_config_file(&project_file)?);
        } else if pyproject.is_file()
            && let Some(layer) = read_pyproject_section(&pyproject)?
        {
            config.merge(layer);
        }

        if let Some(explicit) = explicit {
            if !explicit.is_file() {
                return Err(anyhow!("config file {} does not exist", explicit.display()));
            }
            config.merge(read_config_file(explicit)?);
        }

        Ok(config)
    }

    /// Apply `EXPANDER_*` overrides using the given variable lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(marker) = lookup("EXPANDER_MARKER").filter(|m| !m.is_empty()) {
            self.marker = marker;
        }
        if let Some(python) = lookup("EXPANDER_PYTHON") {
            self.python = python;
        }
        if let Some(version) = lookup("EXPANDER_PYTHON_VERSION") {
            self.python_version = parse_python_version(&version)?;
        }
        Ok(())
    }

    fn merge(&mut self, layer: ConfigFile) {
        if let Some(src) = layer.src {
            self.src.extend(src);
        }
        if let Some(site_packages) = layer.site_packages {
            self.site_packages.extend(site_packages);
        }
        if let Some(exclude) = layer.exclude {
            self.exclude.extend(exclude);
        }
        if let Some(modules) = layer.modules {
            self.modules.extend(modules);
        }
        if let Some(marker) = layer.marker {
            self.marker = marker;
        }
        if let Some(suffix) = layer.extension_source_suffix {
            self.extension_source_suffix = suffix;
        }
        if let Some(python) = layer.python {
            self.python = python;
        }
        if let Some(version) = layer.python_version {
            self.python_version = version;
        }
    }
}

/// Accepts `11`, `3.11` and `311`.
fn parse_python_version(value: &str) -> Result<u8> {
    let value = value.trim();
    let minor = value
        .strip_prefix("3.")
        .or_else(|| value.strip_prefix('3').filter(|rest| rest.len() == 2))
        .unwrap_or(value);
    minor
        .parse::<u8>()
        .with_context(|| format!("invalid python version `{value}`"))
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    debug!("Loading configuration from {}", path.display());
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("invalid config file {}", path.display()))
}

fn read_pyproject_section(path: &Path) -> Result<Option<ConfigFile>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let document: toml::Table =
        toml::from_str(&content).with_context(|| format!("invalid TOML in {}", path.display()))?;

    let Some(section) = document
        .get("tool")
        .and_then(|tool| tool.get("expander"))
        .cloned()
    else {
        return Ok(None);
    };

    debug!("Loading [tool.expander] from {}", path.display());
    let layer: ConfigFile = section
        .try_into()
        .with_context(|| format!("invalid [tool.expander] section in {}", path.display()))?;
    Ok(Some(layer))
}
