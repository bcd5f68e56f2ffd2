//! Installed-package metadata used for the attribution footer.
//!
//! Importable top-level names rarely match distribution names (`sklearn` is
//! shipped by `scikit-learn`), so every `*.dist-info` and `*.egg-info`
//! directory on the search roots is indexed by the top-level names it
//! provides. The index is built at most once per run.

use std::{
    fmt::Write,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use indexmap::IndexMap;
use log::{debug, trace};
use once_cell::unsync::OnceCell;
use pep508_rs::PackageName;
use rustc_hash::{FxHashMap, FxHashSet};

const METADATA_FILES: [&str; 2] = ["METADATA", "PKG-INFO"];
const LICENSE_PREFIXES: [&str; 3] = ["LICENSE", "LICENCE", "COPYING"];
const HOMEPAGE_LABELS: [&str; 3] = ["homepage", "home-page", "home"];

/// Attribution for one bundled package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataBlock {
    pub name: String,
    pub version: Option<String>,
    pub author: Option<String>,
    pub home_page: Option<String>,
    pub license: Option<String>,
    pub license_text: Option<String>,
}

impl MetadataBlock {
    /// Whether the declared license waives attribution, so no license text
    /// is reproduced.
    pub fn is_public_domain(&self) -> bool {
        self.license.as_deref().is_some_and(|license| {
            let license = license.trim();
            license.eq_ignore_ascii_case("CC0")
                || license
                    .get(..4)
                    .is_some_and(|prefix| prefix.eq_ignore_ascii_case("CC0-"))
        })
    }

    /// Render the block as Python comment lines.
    pub fn render(&self) -> String {
        let mut out = format!("# {}\n", self.name);
        let fields = [
            ("Version", &self.version),
            ("Author", &self.author),
            ("Home-page", &self.home_page),
            ("License", &self.license),
        ];
        for (field, value) in fields {
            let Some(value) = value else { continue };
            let mut lines = value.lines();
            let _ = writeln!(out, "#   {field:<9}: {}", lines.next().unwrap_or_default());
            for line in lines {
                let _ = writeln!(out, "#   {:<9}  {line}", "");
            }
        }

        if let Some(text) = self.license_text.as_deref().filter(|_| !self.is_public_domain()) {
            out.push_str("#\n");
            for line in text.lines() {
                if line.trim().is_empty() {
                    out.push_str("#\n");
                } else {
                    let _ = writeln!(out, "#   {line}");
                }
            }
        }
        out
    }
}

/// Source of attribution blocks for bundled top-level packages.
pub trait MetadataProvider {
    /// Metadata for the distribution providing `package`, if any. Lookup
    /// failures are never errors.
    fn describe(&self, package: &str) -> Option<MetadataBlock>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    pub name: PackageName,
    pub metadata_dir: PathBuf,
}

/// Map from importable top-level name to the distribution providing it.
#[derive(Debug, Default)]
pub struct PackageIndex {
    modules: FxHashMap<String, Distribution>,
    distributions: FxHashSet<PackageName>,
}

impl PackageIndex {
    /// Index every metadata directory directly below `roots`. The first root
    /// providing a distribution wins.
    pub fn scan(roots: &[PathBuf]) -> Self {
        let mut index = Self::default();
        for root in roots {
            let Ok(entries) = fs::read_dir(root) else {
                continue;
            };
            let mut metadata_dirs: Vec<PathBuf> = entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| path.is_dir() && is_metadata_dir(path))
                .collect();
            metadata_dirs.sort();
            for metadata_dir in metadata_dirs {
                index.add_distribution(&metadata_dir);
            }
        }
        debug!(
            "Indexed {} distributions providing {} top-level names",
            index.distributions.len(),
            index.modules.len()
        );
        index
    }

    fn add_distribution(&mut self, metadata_dir: &Path) {
        let Some(name) = distribution_name(metadata_dir) else {
            debug!("Ignoring unnamed distribution at {}", metadata_dir.display());
            return;
        };
        if !self.distributions.insert(name.clone()) {
            trace!("`{name}` at {} is shadowed", metadata_dir.display());
            return;
        }
        for module in provided_top_level_names(metadata_dir) {
            self.insert(&module, name.clone(), metadata_dir.to_path_buf());
        }
    }

    /// Register `module` as provided by a distribution; the first
    /// registration wins.
    pub fn insert(&mut self, module: &str, name: PackageName, metadata_dir: PathBuf) {
        self.distributions.insert(name.clone());
        self.modules
            .entry(module.to_owned())
            .or_insert(Distribution { name, metadata_dir });
    }

    pub fn distribution_for(&self, module: &str) -> Option<&Distribution> {
        self.modules.get(module)
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Holds the package index for the duration of one run.
#[derive(Debug, Default)]
pub struct PackageIndexCache {
    cell: OnceCell<PackageIndex>,
}

impl PackageIndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache that never scans.
    pub fn with_index(index: PackageIndex) -> Self {
        Self {
            cell: OnceCell::with_value(index),
        }
    }

    pub fn get_or_scan(&self, roots: &[PathBuf]) -> &PackageIndex {
        self.cell.get_or_init(|| PackageIndex::scan(roots))
    }
}

/// Metadata read from the installed distributions on the search roots.
#[derive(Debug)]
pub struct SitePackagesMetadata<'a> {
    roots: Vec<PathBuf>,
    cache: &'a PackageIndexCache,
}

impl<'a> SitePackagesMetadata<'a> {
    pub fn new(roots: Vec<PathBuf>, cache: &'a PackageIndexCache) -> Self {
        Self { roots, cache }
    }
}

impl MetadataProvider for SitePackagesMetadata<'_> {
    fn describe(&self, package: &str) -> Option<MetadataBlock> {
        let index = self.cache.get_or_scan(&self.roots);
        let Some(distribution) = index.distribution_for(package) else {
            debug!("No installed distribution provides `{package}`");
            return None;
        };
        match read_metadata_block(&distribution.metadata_dir) {
            Ok(block) => Some(block),
            Err(err) => {
                debug!("Skipping metadata for `{package}`: {err:#}");
                None
            }
        }
    }
}

fn is_metadata_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(".dist-info") || name.ends_with(".egg-info"))
}

fn metadata_file(metadata_dir: &Path) -> Option<PathBuf> {
    METADATA_FILES
        .iter()
        .map(|name| metadata_dir.join(name))
        .find(|path| path.is_file())
}

fn distribution_name(metadata_dir: &Path) -> Option<PackageName> {
    let declared = metadata_file(metadata_dir)
        .and_then(|path| fs::read_to_string(path).ok())
        .and_then(|text| Headers::parse(&text).first("name").map(str::to_owned));
    let name = match declared {
        Some(name) => name,
        None => {
            let dir_name = metadata_dir.file_name()?.to_str()?;
            let stem = dir_name
                .strip_suffix(".dist-info")
                .or_else(|| dir_name.strip_suffix(".egg-info"))?;
            stem.split('-').next()?.to_owned()
        }
    };
    PackageName::new(name).ok()
}

/// Top-level import names a distribution installs, from `top_level.txt` or,
/// failing that, from the paths listed in `RECORD`.
fn provided_top_level_names(metadata_dir: &Path) -> Vec<String> {
    if let Ok(text) = fs::read_to_string(metadata_dir.join("top_level.txt")) {
        let names: Vec<String> = text
            .lines()
            .filter_map(|line| line.trim().split('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect();
        if !names.is_empty() {
            return names;
        }
    }

    let Ok(record) = fs::read_to_string(metadata_dir.join("RECORD")) else {
        return Vec::new();
    };
    let mut names: Vec<String> = Vec::new();
    for line in record.lines() {
        let path = line.split(',').next().unwrap_or_default();
        let Some(name) = record_top_level_name(path) else {
            continue;
        };
        if !names.iter().any(|existing| existing == name) {
            names.push(name.to_owned());
        }
    }
    names
}

fn record_top_level_name(path: &str) -> Option<&str> {
    let (first, nested) = match path.split_once('/') {
        Some((first, _)) => (first, true),
        None => (path, false),
    };
    if first.is_empty()
        || first == ".."
        || first == "__pycache__"
        || first.ends_with(".dist-info")
        || first.ends_with(".egg-info")
        || first.ends_with(".data")
        || first.ends_with(".pth")
    {
        return None;
    }
    if nested {
        return Some(first);
    }
    let is_module = [".py", ".so", ".pyd"]
        .iter()
        .any(|suffix| first.ends_with(suffix));
    is_module.then(|| first.split('.').next()).flatten()
}

/// Read and assemble the attribution block for one distribution.
pub fn read_metadata_block(metadata_dir: &Path) -> Result<MetadataBlock> {
    let path = metadata_file(metadata_dir)
        .ok_or_else(|| anyhow!("no METADATA or PKG-INFO in {}", metadata_dir.display()))?;
    let text =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let headers = Headers::parse(&text);

    let name = headers
        .first("name")
        .ok_or_else(|| anyhow!("{} declares no Name", path.display()))?
        .to_owned();
    let owned = |value: Option<&str>| value.map(str::to_owned);

    Ok(MetadataBlock {
        name,
        version: owned(headers.first("version")),
        author: owned(headers.first("author").or_else(|| headers.first("author-email"))),
        home_page: owned(headers.first("home-page").or_else(|| headers.homepage_url())),
        license: owned(
            headers
                .first("license")
                .or_else(|| headers.first("license-expression")),
        ),
        license_text: read_license_text(metadata_dir),
    })
}

fn read_license_text(metadata_dir: &Path) -> Option<String> {
    [metadata_dir.to_path_buf(), metadata_dir.join("licenses")]
        .iter()
        .find_map(|dir| find_license_file(dir))
        .and_then(|path| fs::read_to_string(path).ok())
}

fn find_license_file(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    let mut candidates: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| {
                        let upper = name.to_ascii_uppercase();
                        LICENSE_PREFIXES.iter().any(|prefix| upper.starts_with(prefix))
                    })
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// Core metadata headers (RFC 822 style), keyed by lowercase field name.
#[derive(Debug, Default)]
struct Headers(IndexMap<String, Vec<String>>);

impl Headers {
    fn parse(text: &str) -> Self {
        let mut headers = Self::default();
        let mut current: Option<(String, String)> = None;

        for line in text.lines() {
            // The body (long description) starts after the first blank line
            if line.trim().is_empty() {
                break;
            }
            if line.starts_with([' ', '\t']) {
                if let Some((_, value)) = &mut current {
                    value.push('\n');
                    value.push_str(line.trim());
                }
                continue;
            }
            if let Some((key, value)) = current.take() {
                headers.push(key, value);
            }
            current = line
                .split_once(':')
                .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_owned()));
        }
        if let Some((key, value)) = current {
            headers.push(key, value);
        }
        headers
    }

    fn push(&mut self, key: String, value: String) {
        self.0.entry(key).or_default().push(value);
    }

    /// First meaningful value of a field. Legacy tools write `UNKNOWN` for
    /// fields that were never set.
    fn first(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)?
            .iter()
            .map(|value| value.trim())
            .find(|value| !value.is_empty() && *value != "UNKNOWN")
    }

    fn homepage_url(&self) -> Option<&str> {
        self.0.get("project-url")?.iter().find_map(|entry| {
            let (label, url) = entry.split_once(',')?;
            let label = label.trim().to_ascii_lowercase();
            HOMEPAGE_LABELS
                .contains(&label.as_str())
                .then(|| url.trim())
        })
    }
}
