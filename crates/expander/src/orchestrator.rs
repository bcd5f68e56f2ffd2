use std::{collections::BTreeSet, path::Path};

use anyhow::Result;
use indexmap::IndexSet;
use log::{debug, info, warn};

use crate::{
    analyzer::EntrySource,
    config::Config,
    graph::ModuleGraph,
    metadata::{PackageIndexCache, SitePackagesMetadata},
    payload::{EmbedSpec, PayloadBuilder},
    resolver::ModuleResolver,
    splicer::Splicer,
};

/// Result of expanding one entry file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    pub text: String,
    /// Top-level packages whose modules were embedded
    pub bundled: BTreeSet<String>,
    pub needs_build_step: bool,
}

/// Runs resolution, payload construction and splicing for an entry file.
#[derive(Debug)]
pub struct Expander {
    config: Config,
    pythonpath_override: Option<String>,
    virtualenv_override: Option<String>,
    interpreter_path_override: Option<String>,
}

impl Expander {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            pythonpath_override: None,
            virtualenv_override: None,
            interpreter_path_override: None,
        }
    }

    /// Use fixed `PYTHONPATH`, `VIRTUAL_ENV` and interpreter import path
    /// values (the last one newline-separated) instead of querying the
    /// process environment. An empty value disables the source.
    #[must_use]
    pub fn with_environment(
        mut self,
        pythonpath: Option<&str>,
        virtualenv: Option<&str>,
        interpreter_path: Option<&str>,
    ) -> Self {
        self.pythonpath_override = pythonpath.map(str::to_owned);
        self.virtualenv_override = virtualenv.map(str::to_owned);
        self.interpreter_path_override = interpreter_path.map(str::to_owned);
        self
    }

    /// Expand `entry`, embedding every reachable module of the packages in
    /// `embed`.
    pub fn expand(&self, entry: &Path, embed: &EmbedSpec) -> Result<Expansion> {
        let source = EntrySource::read(entry)?;
        let unchanged = |source: EntrySource| Expansion {
            text: source.text().to_owned(),
            bundled: BTreeSet::new(),
            needs_build_step: false,
        };

        if source.existing_guard(&self.config.marker) {
            warn!(
                "{} already contains an `{}` block; leaving it unchanged",
                entry.display(),
                self.config.marker
            );
            return Ok(unchanged(source));
        }
        if embed.is_empty() {
            debug!("Nothing to embed");
            return Ok(unchanged(source));
        }

        let mut resolver = self.resolver_for(embed);
        let graph = resolver.resolve(entry, &IndexSet::new())?;
        let roots = resolver.search_roots().all();

        for package in embed.iter() {
            if graph.missing().contains(package) {
                warn!("`{package}` is imported but was not found on any search root");
            } else if !graph.modules().values().any(|record| record.top_level == package) {
                warn!("`{package}` is not imported by {}", entry.display());
            }
        }
        log_importers(&graph, embed);

        let payload = PayloadBuilder::new(&self.config.extension_source_suffix).build(
            graph.modules(),
            embed,
            &roots,
        )?;
        info!(
            "embedded {} modules from {} packages",
            payload.artifacts.len(),
            payload.bundled.len()
        );

        let cache = PackageIndexCache::new();
        let metadata = SitePackagesMetadata::new(roots, &cache);
        let text = Splicer::new(&self.config.marker, &metadata).splice(
            source.text(),
            source.insertion_point(),
            &payload,
        );

        Ok(Expansion {
            text,
            bundled: payload.bundled,
            needs_build_step: payload.needs_build_step,
        })
    }

    /// Resolve the module graph of `entry` without expanding it.
    pub fn module_graph(&self, entry: &Path, embed: &EmbedSpec) -> Result<ModuleGraph> {
        self.resolver_for(embed).resolve(entry, &IndexSet::new())
    }

    /// Packages requested for embedding are never excluded from discovery.
    fn resolver_for(&self, embed: &EmbedSpec) -> ModuleResolver {
        let mut config = self.config.clone();
        config.exclude.retain(|package| {
            let requested = embed.contains(package);
            if requested {
                info!("`{package}` is embedded, so it is analyzed despite being excluded");
            }
            !requested
        });
        ModuleResolver::new_with_overrides(
            config,
            self.pythonpath_override.as_deref(),
            self.virtualenv_override.as_deref(),
            self.interpreter_path_override.as_deref(),
        )
    }
}

fn log_importers(graph: &ModuleGraph, embed: &EmbedSpec) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    for record in graph.modules().values() {
        if embed.contains(&record.top_level) {
            debug!(
                "`{}` is imported by {:?}",
                record.name,
                graph.importers_of(&record.name)
            );
        }
    }
}
