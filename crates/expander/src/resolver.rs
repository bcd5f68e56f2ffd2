use std::{
    collections::VecDeque,
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result, bail};
use indexmap::{IndexMap, IndexSet};
use log::{debug, info, warn};
use ruff_python_parser::parse_module;
use ruff_python_stdlib::sys;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    config::Config,
    error::ExpandError,
    graph::{
        ArtifactKind, ENTRY_MODULE, ModuleGraph, ModuleRecord, Resolution, top_level_package,
    },
    visitors::{DiscoveredImport, ImportDiscoveryVisitor},
};

/// Check if a module is part of the Python standard library using ruff_python_stdlib
fn is_stdlib_module(module_name: &str, python_version: u8) -> bool {
    let top_level = top_level_package(module_name);
    top_level == "__future__" || sys::is_known_standard_library(python_version, top_level)
}

/// Ordered search roots, split the way the interpreter's `sys.path` is: the
/// standard library sits between the project roots and installed packages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchRoots {
    /// Entry directory, `PYTHONPATH` and configured `src` directories
    pub project: Vec<PathBuf>,
    /// Configured and discovered site-packages directories
    pub site: Vec<PathBuf>,
}

impl SearchRoots {
    /// All roots in lookup order.
    pub fn all(&self) -> Vec<PathBuf> {
        self.project.iter().chain(&self.site).cloned().collect()
    }
}

/// What a single directory offers for a module name.
#[derive(Debug)]
struct Located {
    /// File backing the module; `None` for namespace portions
    artifact: Option<PathBuf>,
    /// Directory searched for submodules when the module is a package
    package_dir: Option<PathBuf>,
}

#[derive(Debug)]
struct PendingModule {
    name: String,
    path: PathBuf,
    is_package: bool,
}

#[derive(Debug)]
pub struct ModuleResolver {
    config: Config,
    /// Entry file's directory (first in search path)
    entry_dir: Option<PathBuf>,
    /// PYTHONPATH override for testing
    pythonpath_override: Option<String>,
    /// VIRTUAL_ENV override for testing
    virtualenv_override: Option<String>,
    /// Newline-separated interpreter import path, for testing
    interpreter_path_override: Option<String>,
    /// Packages skipped during discovery
    excluded: IndexSet<String>,
    /// Cache of search roots, cleared when the entry file changes
    roots_cache: Option<SearchRoots>,
    /// Cache of lookups by dotted name
    module_cache: IndexMap<String, Resolution>,
    /// `__path__` of every resolved package
    package_dirs: FxHashMap<String, Vec<PathBuf>>,
    /// Modules classified as standard library
    stdlib_modules: FxHashSet<String>,
}

impl ModuleResolver {
    pub fn new(config: Config) -> Self {
        Self::new_with_overrides(config, None, None, None)
    }

    /// Create a new ModuleResolver with optional PYTHONPATH, VIRTUAL_ENV and
    /// interpreter import path overrides for testing
    pub fn new_with_overrides(
        config: Config,
        pythonpath_override: Option<&str>,
        virtualenv_override: Option<&str>,
        interpreter_path_override: Option<&str>,
    ) -> Self {
        let excluded = config.exclude.clone();
        Self {
            config,
            entry_dir: None,
            pythonpath_override: pythonpath_override.map(str::to_owned),
            virtualenv_override: virtualenv_override.map(str::to_owned),
            interpreter_path_override: interpreter_path_override.map(str::to_owned),
            excluded,
            roots_cache: None,
            module_cache: IndexMap::new(),
            package_dirs: FxHashMap::default(),
            stdlib_modules: FxHashSet::default(),
        }
    }

    /// Set the entry file for the resolver
    /// This establishes the first search path directory
    pub fn set_entry_file(&mut self, entry_path: &Path) {
        if let Some(parent) = entry_path.parent() {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            self.entry_dir = Some(parent.to_path_buf());
            self.roots_cache = None;
            self.module_cache.clear();
            self.package_dirs.clear();
            debug!("Set entry directory to: {:?}", self.entry_dir);
        }
    }

    /// Get the configured search roots, deduplicated and canonicalized.
    pub fn search_roots(&mut self) -> &SearchRoots {
        if self.roots_cache.is_none() {
            self.roots_cache = Some(self.compute_search_roots());
        }
        self.roots_cache.get_or_insert_with(SearchRoots::default)
    }

    fn compute_search_roots(&self) -> SearchRoots {
        let mut seen = IndexSet::new();
        let mut project = Vec::new();
        let mut site = Vec::new();

        // 1. Entry file's directory is ALWAYS first
        if let Some(entry_dir) = &self.entry_dir {
            push_root(&mut seen, &mut project, entry_dir);
        }

        // 2. PYTHONPATH directories
        let pythonpath = self
            .pythonpath_override
            .clone()
            .or_else(|| std::env::var("PYTHONPATH").ok());
        if let Some(pythonpath) = pythonpath {
            let separator = if cfg!(windows) { ';' } else { ':' };
            for path_str in pythonpath.split(separator).filter(|p| !p.is_empty()) {
                push_root(&mut seen, &mut project, Path::new(path_str));
            }
        }

        // 3. Configured src directories
        for dir in &self.config.src {
            push_root(&mut seen, &mut project, dir);
        }

        // 4. Installed packages: explicit first, then virtual environments,
        //    or the interpreter's own import path when there is none
        for dir in &self.config.site_packages {
            push_root(&mut seen, &mut site, dir);
        }
        let venvs = self.virtualenv_paths();
        if venvs.is_empty() {
            for dir in self.interpreter_paths() {
                push_root(&mut seen, &mut site, &dir);
            }
        }
        for venv in venvs {
            for dir in virtualenv_site_packages(&venv) {
                push_root(&mut seen, &mut site, &dir);
            }
        }

        SearchRoots { project, site }
    }

    /// Virtual environments to scan. An empty override disables discovery.
    fn virtualenv_paths(&self) -> Vec<PathBuf> {
        if let Some(explicit) = &self.virtualenv_override {
            if explicit.is_empty() {
                return Vec::new();
            }
            return vec![PathBuf::from(explicit)];
        }
        match std::env::var("VIRTUAL_ENV") {
            Ok(venv) if !venv.is_empty() => vec![PathBuf::from(venv)],
            _ => detect_fallback_virtualenv_paths(),
        }
    }

    /// `sys.path` of the configured interpreter, minus the script directory.
    /// An empty override or interpreter name disables the lookup.
    fn interpreter_paths(&self) -> Vec<PathBuf> {
        let listing = match &self.interpreter_path_override {
            Some(explicit) => explicit.clone(),
            None if self.config.python.is_empty() => return Vec::new(),
            None => match query_interpreter_path(&self.config.python) {
                Ok(listing) => {
                    info!(
                        "No virtual environment found; searching the import path of `{}`",
                        self.config.python
                    );
                    listing
                }
                Err(err) => {
                    warn!(
                        "{err:#}; installed packages outside a virtual environment are not searched"
                    );
                    return Vec::new();
                }
            },
        };
        listing
            .lines()
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect()
    }

    /// Discover every module reachable from `entry_path`.
    ///
    /// Top-level packages in `excluded` are never looked up; they are listed
    /// in [`ModuleGraph::excluded`] instead.
    pub fn resolve(&mut self, entry_path: &Path, excluded: &IndexSet<String>) -> Result<ModuleGraph> {
        self.set_entry_file(entry_path);
        self.excluded.extend(excluded.iter().cloned());

        let entry_path = canonicalize_path(entry_path.to_path_buf());
        let mut graph = ModuleGraph::new();
        graph.add_module(ModuleRecord::new(ENTRY_MODULE, Some(entry_path.clone())));

        let mut queue = VecDeque::from([PendingModule {
            name: ENTRY_MODULE.to_owned(),
            path: entry_path,
            is_package: false,
        }]);

        while let Some(pending) = queue.pop_front() {
            let Some(imports) = self.scan_module(&pending)? else {
                continue;
            };
            for import in imports {
                self.process_import(&mut graph, &mut queue, &pending, &import)?;
            }
        }

        debug!(
            "Resolved {} modules ({} excluded, {} missing)",
            graph.modules().len(),
            graph.excluded().len(),
            graph.missing().len()
        );
        Ok(graph)
    }

    /// Read and parse a module. Failures are fatal for the entry file only.
    fn scan_module(&self, pending: &PendingModule) -> Result<Option<Vec<DiscoveredImport>>> {
        let is_entry = pending.name == ENTRY_MODULE;
        let source = match fs::read_to_string(&pending.path) {
            Ok(source) => source,
            Err(source) if is_entry => {
                return Err(ExpandError::MissingEntry {
                    path: pending.path.clone(),
                    source,
                }
                .into());
            }
            Err(err) => {
                warn!("Failed to read {}: {err}", pending.path.display());
                return Ok(None);
            }
        };

        match parse_module(&source) {
            Ok(parsed) => Ok(Some(ImportDiscoveryVisitor::discover(&parsed.syntax().body))),
            Err(err) if is_entry => Err(ExpandError::Parse {
                path: pending.path.clone(),
                message: err.to_string(),
            }
            .into()),
            Err(err) => {
                warn!(
                    "Failed to parse `{}` ({}): {err}; its imports are not followed",
                    pending.name,
                    pending.path.display()
                );
                Ok(None)
            }
        }
    }

    fn process_import(
        &mut self,
        graph: &mut ModuleGraph,
        queue: &mut VecDeque<PendingModule>,
        importer: &PendingModule,
        import: &DiscoveredImport,
    ) -> Result<()> {
        if import.is_type_checking_only {
            debug!("Following TYPE_CHECKING import in `{}`", importer.name);
        }

        let target = if import.level == 0 {
            let Some(module_name) = &import.module_name else {
                return Ok(());
            };
            module_name.clone()
        } else {
            let Some(target) = relative_target(importer, import) else {
                warn!(
                    "Cannot resolve relative import (level {}) in `{}`",
                    import.level, importer.name
                );
                return Ok(());
            };
            target
        };

        if target.is_empty() {
            return Ok(());
        }

        // `import a.b.c` and `from a.b import c` both import every parent package
        let mut parent: Option<String> = None;
        for part in target.split('.') {
            let name = match &parent {
                Some(parent) => format!("{parent}.{part}"),
                None => part.to_owned(),
            };
            if !self.load(graph, queue, &importer.name, &name, true)? {
                return Ok(());
            }
            parent = Some(name);
        }

        // `from package import name` may name a submodule
        if import.module_name.is_none() || !import.names.is_empty() {
            if self.package_dirs.contains_key(&target) {
                for name in &import.names {
                    let submodule = format!("{target}.{name}");
                    self.load(graph, queue, &importer.name, &submodule, false)?;
                }
            }
        }

        Ok(())
    }

    /// Add `name` to the graph. Returns whether the module exists.
    fn load(
        &mut self,
        graph: &mut ModuleGraph,
        queue: &mut VecDeque<PendingModule>,
        importer: &str,
        name: &str,
        required: bool,
    ) -> Result<bool> {
        match self.resolve_module(name)? {
            Resolution::Resolved(record) => {
                graph.add_dependency(importer, name);
                if graph.contains(name) {
                    return Ok(true);
                }
                if let Some(path) = &record.artifact {
                    debug!("Found `{name}` at {}", path.display());
                    if record.kind == ArtifactKind::Source {
                        queue.push_back(PendingModule {
                            name: name.to_owned(),
                            path: path.clone(),
                            is_package: self.package_dirs.contains_key(name),
                        });
                    }
                } else {
                    debug!("`{name}` has no single-file artifact");
                }
                graph.add_module(record);
                Ok(true)
            }
            Resolution::Excluded(reason) => {
                if !graph.excluded().contains(name) {
                    info!("skip `{name}`: {reason}");
                }
                graph.mark_excluded(name);
                Ok(false)
            }
            Resolution::Unresolved => {
                if required {
                    debug!("`{name}` imported by `{importer}` was not found");
                    graph.mark_missing(name);
                }
                Ok(false)
            }
        }
    }

    /// Locate a single module by absolute dotted name.
    pub fn resolve_module(&mut self, module_name: &str) -> Result<Resolution> {
        let top_level = top_level_package(module_name);
        if self.excluded.contains(top_level) {
            return Ok(Resolution::Excluded(format!(
                "package `{top_level}` is excluded from static analysis"
            )));
        }

        if let Some(cached) = self.module_cache.get(module_name) {
            return Ok(cached.clone());
        }

        let resolution = match module_name.rsplit_once('.') {
            None => self.resolve_top_level(module_name),
            Some((parent, child)) => self.resolve_submodule(parent, child, module_name)?,
        };

        self.module_cache
            .insert(module_name.to_owned(), resolution.clone());
        Ok(resolution)
    }

    fn resolve_top_level(&mut self, name: &str) -> Resolution {
        let python_version = self.config.python_version;
        let roots = self.search_roots().clone();

        if let Some(resolution) = self.resolve_in_directories(name, name, &roots.project) {
            return resolution;
        }
        if is_stdlib_module(name, python_version) {
            self.stdlib_modules.insert(name.to_owned());
            return Resolution::Resolved(ModuleRecord::unresolved(name));
        }
        self.resolve_in_directories(name, name, &roots.site)
            .unwrap_or(Resolution::Unresolved)
    }

    fn resolve_submodule(&mut self, parent: &str, child: &str, full_name: &str) -> Result<Resolution> {
        if !matches!(self.resolve_module(parent)?, Resolution::Resolved(_)) {
            return Ok(Resolution::Unresolved);
        }
        if self.stdlib_modules.contains(parent) {
            self.stdlib_modules.insert(full_name.to_owned());
            return Ok(Resolution::Resolved(ModuleRecord::unresolved(full_name)));
        }
        let Some(dirs) = self.package_dirs.get(parent).cloned() else {
            // Parent is a plain module, not a package
            return Ok(Resolution::Unresolved);
        };
        Ok(self
            .resolve_in_directories(full_name, child, &dirs)
            .unwrap_or(Resolution::Unresolved))
    }

    /// Resolve `part` in the given directories using the interpreter's
    /// precedence: any regular package or module wins over namespace portions,
    /// which are merged across every directory.
    fn resolve_in_directories(
        &mut self,
        full_name: &str,
        part: &str,
        dirs: &[PathBuf],
    ) -> Option<Resolution> {
        let mut namespace_dirs = Vec::new();

        for dir in dirs {
            match locate_in_directory(dir, part) {
                Some(Located {
                    artifact: Some(artifact),
                    package_dir,
                }) => {
                    if let Some(package_dir) = package_dir {
                        self.package_dirs
                            .insert(full_name.to_owned(), vec![package_dir]);
                    }
                    return Some(Resolution::Resolved(ModuleRecord::new(
                        full_name,
                        Some(artifact),
                    )));
                }
                Some(Located {
                    artifact: None,
                    package_dir: Some(package_dir),
                }) => namespace_dirs.push(package_dir),
                _ => {}
            }
        }

        if namespace_dirs.is_empty() {
            return None;
        }
        debug!("Found namespace package `{full_name}` in {namespace_dirs:?}");
        self.package_dirs
            .insert(full_name.to_owned(), namespace_dirs);
        Some(Resolution::Resolved(ModuleRecord::unresolved(full_name)))
    }
}

fn query_interpreter_path(python: &str) -> Result<String> {
    let output = Command::new(python)
        .arg("-c")
        .arg("import sys; print('\\n'.join(sys.path[1:]))")
        .env_remove("PYTHONPATH")
        .output()
        .with_context(|| format!("failed to run `{python}`"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("`{python}` could not report its import path: {}", stderr.trim());
    }
    String::from_utf8(output.stdout)
        .with_context(|| format!("`{python}` reported a non UTF-8 import path"))
}

/// Dotted name targeted by a relative import, or `None` when it escapes the
/// top-level package or the importer is not inside a package.
fn relative_target(importer: &PendingModule, import: &DiscoveredImport) -> Option<String> {
    if importer.name == ENTRY_MODULE {
        return None;
    }
    let package = if importer.is_package {
        importer.name.as_str()
    } else {
        importer.name.rsplit_once('.')?.0
    };

    let mut parts: Vec<&str> = package.split('.').collect();
    let up = import.level as usize - 1;
    if up >= parts.len() {
        return None;
    }
    parts.truncate(parts.len() - up);

    let mut target = parts.join(".");
    if let Some(module_name) = &import.module_name {
        target.push('.');
        target.push_str(module_name);
    }
    Some(target)
}

/// Resolve a module within a specific directory in the interpreter's loader
/// order:
/// 1. package (`foo/__init__`, found like a module file)
/// 2. module file: compiled extension (`foo.cpython-311-x86_64-linux-gnu.so`,
///    `foo.pyd`, ...), then source (`foo.py`), then bytecode (`foo.pyc`)
/// 3. namespace portion (`foo/` without `__init__`)
fn locate_in_directory(dir: &Path, part: &str) -> Option<Located> {
    let package_dir = dir.join(part);
    if package_dir.is_dir()
        && let Some(init) = find_module_file(&package_dir, "__init__")
    {
        debug!("Found package at: {init:?}");
        return Some(Located {
            artifact: Some(canonicalize_path(init)),
            package_dir: Some(canonicalize_path(package_dir)),
        });
    }

    if let Some(artifact) = find_module_file(dir, part) {
        debug!("Found module file at: {artifact:?}");
        return Some(Located {
            artifact: Some(canonicalize_path(artifact)),
            package_dir: None,
        });
    }

    package_dir.is_dir().then(|| Located {
        artifact: None,
        package_dir: Some(canonicalize_path(package_dir)),
    })
}

fn find_module_file(dir: &Path, stem: &str) -> Option<PathBuf> {
    find_extension(dir, stem).or_else(|| {
        ["py", "pyc"]
            .iter()
            .map(|suffix| dir.join(format!("{stem}.{suffix}")))
            .find(|path| path.is_file())
    })
}

/// Find a native extension for `stem` in `dir`, either untagged (`stem.so`)
/// or with a single platform tag (`stem.abi3.so`).
fn find_extension(dir: &Path, stem: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    let mut candidates: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(OsStr::to_str)
                    .and_then(|name| name.strip_prefix(stem))
                    .and_then(|rest| rest.strip_prefix('.'))
                    .is_some_and(is_extension_suffix)
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

fn is_extension_suffix(suffix: &str) -> bool {
    let mut parts = suffix.rsplit('.');
    let Some(extension) = parts.next() else {
        return false;
    };
    let tags = parts.count();
    matches!(extension, "so" | "pyd") && tags <= 1
}

/// Get site-packages directories for a virtual environment
fn virtualenv_site_packages(venv_path: &Path) -> Vec<PathBuf> {
    let mut site_packages_dirs = Vec::new();

    // Unix-style virtual environment
    let lib_dir = venv_path.join("lib");
    if let Ok(entries) = fs::read_dir(&lib_dir) {
        let mut found: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path().join("site-packages"))
            .filter(|site_packages| site_packages.is_dir())
            .collect();
        found.sort();
        site_packages_dirs.extend(found);
    }

    // Windows-style virtual environment
    let lib_site_packages = venv_path.join("Lib").join("site-packages");
    if lib_site_packages.is_dir() {
        site_packages_dirs.push(lib_site_packages);
    }

    site_packages_dirs
}

/// Detect common virtual environment directory names
fn detect_fallback_virtualenv_paths() -> Vec<PathBuf> {
    let Ok(current_dir) = std::env::current_dir() else {
        return Vec::new();
    };

    [".venv", "venv", "env", ".virtualenv", "virtualenv"]
        .iter()
        .map(|name| current_dir.join(name))
        .filter(|venv_path| {
            venv_path.is_dir()
                && (venv_path.join("bin").is_dir()
                    || venv_path.join("Scripts").is_dir()
                    || venv_path.join("lib").is_dir())
        })
        .collect()
}

fn push_root(seen: &mut IndexSet<PathBuf>, roots: &mut Vec<PathBuf>, dir: &Path) {
    if !dir.is_dir() {
        debug!("Ignoring missing search root {}", dir.display());
        return;
    }
    let canonical = canonicalize_path(dir.to_path_buf());
    if seen.insert(canonical.clone()) {
        roots.push(canonical);
    }
}

/// Canonicalize a path, handling errors gracefully
fn canonicalize_path(path: PathBuf) -> PathBuf {
    match path.canonicalize() {
        Ok(canonical) => canonical,
        Err(e) => {
            // Log warning but don't fail - keep the path as given
            warn!("Failed to canonicalize path {}: {}", path.display(), e);
            path
        }
    }
}
