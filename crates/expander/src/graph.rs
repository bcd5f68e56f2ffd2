//! The module graph produced by import discovery.
//!
//! Nodes are module records keyed by dotted name; edges point from the
//! importing module to the imported one. Discovery order is preserved so that
//! everything derived from the graph is deterministic.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use indexmap::{IndexMap, IndexSet};
use petgraph::{
    Direction,
    graph::{DiGraph, NodeIndex},
};
use rustc_hash::FxHashMap;

/// Name the entry file is registered under, as the interpreter would.
pub const ENTRY_MODULE: &str = "__main__";

/// How a module's on-disk artifact can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Plain Python source (`.py`)
    Source,
    /// Native extension module (`.so`, `.pyd`)
    CompiledExtension,
    /// A file that is neither, e.g. sourceless bytecode
    Unknown,
    /// Built-in, standard library or namespace module without a single file
    Unresolved,
}

impl ArtifactKind {
    /// Classify an artifact by its file name suffix family.
    pub fn from_path(path: &Path) -> Self {
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            return Self::Unknown;
        };
        if file_name.ends_with(".py") {
            Self::Source
        } else if file_name.ends_with(".so") || file_name.ends_with(".pyd") {
            Self::CompiledExtension
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::CompiledExtension => write!(f, "compiled-extension"),
            Self::Unknown => write!(f, "unknown"),
            Self::Unresolved => write!(f, "unresolved"),
        }
    }
}

/// One node of the module graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    pub name: String,
    pub top_level: String,
    pub artifact: Option<PathBuf>,
    pub kind: ArtifactKind,
}

impl ModuleRecord {
    pub fn new(name: &str, artifact: Option<PathBuf>) -> Self {
        let kind = artifact
            .as_deref()
            .map_or(ArtifactKind::Unresolved, ArtifactKind::from_path);
        Self {
            name: name.to_owned(),
            top_level: top_level_package(name).to_owned(),
            artifact,
            kind,
        }
    }

    /// Record for a module that exists but has no single-file artifact.
    pub fn unresolved(name: &str) -> Self {
        Self::new(name, None)
    }
}

/// First dotted component of a module name.
pub fn top_level_package(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

/// Outcome of looking up one module name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(ModuleRecord),
    /// Skipped on purpose; the reason names the rule that excluded it
    Excluded(String),
    /// Not found on any search root
    Unresolved,
}

#[derive(Debug, Default)]
pub struct ModuleGraph {
    modules: IndexMap<String, ModuleRecord>,
    excluded: IndexSet<String>,
    missing: IndexSet<String>,
    graph: DiGraph<String, ()>,
    node_indices: FxHashMap<String, NodeIndex>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record; the first record for a name wins.
    pub fn add_module(&mut self, record: ModuleRecord) -> bool {
        if self.modules.contains_key(&record.name) {
            return false;
        }
        self.node_for(&record.name);
        self.modules.insert(record.name.clone(), record);
        true
    }

    pub fn add_dependency(&mut self, importer: &str, imported: &str) {
        let from = self.node_for(importer);
        let to = self.node_for(imported);
        if from != to && !self.graph.contains_edge(from, to) {
            self.graph.add_edge(from, to, ());
        }
    }

    pub fn mark_excluded(&mut self, name: &str) {
        self.excluded.insert(name.to_owned());
    }

    pub fn mark_missing(&mut self, name: &str) {
        if !self.modules.contains_key(name) {
            self.missing.insert(name.to_owned());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Every reachable module in discovery order.
    pub fn modules(&self) -> &IndexMap<String, ModuleRecord> {
        &self.modules
    }

    /// Names skipped because their top-level package is excluded.
    pub fn excluded(&self) -> &IndexSet<String> {
        &self.excluded
    }

    /// Names imported somewhere but not found on any search root.
    pub fn missing(&self) -> &IndexSet<String> {
        &self.missing
    }

    /// Modules that import `name` directly.
    pub fn importers_of(&self, name: &str) -> Vec<&str> {
        let Some(&node) = self.node_indices.get(name) else {
            return Vec::new();
        };
        let mut importers: Vec<&str> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|idx| self.graph[idx].as_str())
            .collect();
        importers.sort_unstable();
        importers
    }

    fn node_for(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.node_indices.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.to_owned());
        self.node_indices.insert(name.to_owned(), idx);
        idx
    }
}
