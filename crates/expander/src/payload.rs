//! Selection of embeddable artifacts and generation of the code that writes
//! them back to disk on the judge.

use std::{
    collections::BTreeSet,
    fmt::Write,
    fs,
    path::{Component, Path, PathBuf},
};

use anyhow::{Context, Result};
use indexmap::{IndexMap, IndexSet};
use log::{info, warn};

use crate::{
    error::ExpandError,
    graph::{ArtifactKind, ModuleRecord},
    literal::{escape_triple_quoted, quote_string},
};

const PRELUDE: &str = "import textwrap\nimport pathlib\n\n";

const IMPORT_CYTHON: &str = "\
import numpy as np
from Cython.Build import cythonize
from setuptools import Extension, setup

";

const BUILD_CYTHON: &str = r#"extensions = Extension(
    "*",
    ["./**/*.pyx"],
    include_dirs=[np.get_include()],
    extra_compile_args=["-O3"],
)
setup(
    ext_modules=cythonize([extensions]),
    script_args=["build_ext", "--inplace"],
)

"#;

/// Top-level package names whose modules are embedded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbedSpec {
    packages: IndexSet<String>,
}

impl EmbedSpec {
    pub fn new<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            packages: packages.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, top_level: &str) -> bool {
        self.packages.contains(top_level)
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.packages.iter().map(String::as_str)
    }
}

/// Source text of one module and where it lives below its search root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub module: String,
    pub source_path: PathBuf,
    /// Path relative to the search root, written with `/` separators
    pub relative_path: String,
    pub text: String,
    /// The module is a compiled extension rebuilt from `text`
    pub needs_build: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    /// Unindented body of the guard block
    pub snippet: String,
    pub bundled: BTreeSet<String>,
    pub needs_build_step: bool,
    pub artifacts: Vec<Artifact>,
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        self.bundled.is_empty()
    }
}

#[derive(Debug)]
pub struct PayloadBuilder<'a> {
    extension_source_suffix: &'a str,
}

impl<'a> PayloadBuilder<'a> {
    pub fn new(extension_source_suffix: &'a str) -> Self {
        Self {
            extension_source_suffix,
        }
    }

    pub fn build(
        &self,
        records: &IndexMap<String, ModuleRecord>,
        embed_spec: &EmbedSpec,
        search_roots: &[PathBuf],
    ) -> Result<Payload> {
        let mut payload = Payload::default();

        for record in records.values() {
            if !embed_spec.contains(&record.top_level) {
                continue;
            }
            let Some(artifact_path) = &record.artifact else {
                info!("skip `{}`: no file to embed ({})", record.name, record.kind);
                continue;
            };
            payload.bundled.insert(record.top_level.clone());

            let artifact = self.load_artifact(record, artifact_path, search_roots)?;
            payload.needs_build_step |= artifact.needs_build;
            payload.artifacts.push(artifact);
        }

        if payload.artifacts.is_empty() {
            return Ok(payload);
        }

        let mut snippet = String::from(PRELUDE);
        if payload.needs_build_step {
            info!("add setup for cythonize");
            snippet.push_str(IMPORT_CYTHON);
        }
        for artifact in &payload.artifacts {
            write_stanza(&mut snippet, artifact);
        }
        if payload.needs_build_step {
            snippet.push_str(BUILD_CYTHON);
        }
        payload.snippet = snippet;

        Ok(payload)
    }

    fn load_artifact(
        &self,
        record: &ModuleRecord,
        artifact_path: &Path,
        search_roots: &[PathBuf],
    ) -> Result<Artifact> {
        let (source_path, needs_build) = match record.kind {
            ArtifactKind::Source => (artifact_path.to_path_buf(), false),
            ArtifactKind::CompiledExtension => {
                let expected = self.extension_source_path(artifact_path);
                if !expected.is_file() {
                    return Err(ExpandError::UnreconstructableArtifact {
                        module: record.name.clone(),
                        extension: artifact_path.to_path_buf(),
                        expected,
                    }
                    .into());
                }
                (expected, true)
            }
            ArtifactKind::Unknown | ArtifactKind::Unresolved => {
                return Err(ExpandError::UnknownFileType {
                    module: record.name.clone(),
                    path: artifact_path.to_path_buf(),
                }
                .into());
            }
        };

        let relative = relative_site_path(&source_path, &record.name, search_roots)?;
        info!("load `{}` from {}", record.name, source_path.display());
        let text = fs::read_to_string(&source_path)
            .with_context(|| format!("failed to read {}", source_path.display()))?;

        Ok(Artifact {
            module: record.name.clone(),
            source_path,
            relative_path: to_posix(&relative),
            text,
            needs_build,
        })
    }

    /// `pkg/fast.cpython-311-x86_64-linux-gnu.so` -> `pkg/fast.pyx`
    pub fn extension_source_path(&self, extension: &Path) -> PathBuf {
        let file_name = extension
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        let stem = file_name.split('.').next().unwrap_or(file_name);
        extension.with_file_name(format!("{stem}{}", self.extension_source_suffix))
    }
}

/// Path of `path` relative to the single search root it was imported from.
///
/// A root counts when the relative path spells `module`'s dotted name, so a
/// virtual environment nested inside the project directory is not ambiguous.
/// When no containing root spells the name, every containing root is a
/// candidate. Exactly one candidate must remain.
pub fn relative_site_path(
    path: &Path,
    module: &str,
    search_roots: &[PathBuf],
) -> Result<PathBuf, ExpandError> {
    let containing: Vec<&PathBuf> = search_roots
        .iter()
        .filter(|root| path.starts_with(root))
        .collect();
    let spelling: Vec<&PathBuf> = containing
        .iter()
        .copied()
        .filter(|root| {
            path.strip_prefix(root)
                .is_ok_and(|relative| spells_module(relative, module))
        })
        .collect();
    let candidates = if spelling.is_empty() { containing } else { spelling };

    match candidates.as_slice() {
        [] => {
            warn!("failed to resolve path {}", path.display());
            Err(ExpandError::UnresolvablePath {
                path: path.to_path_buf(),
            })
        }
        [root] => Ok(path
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_default()),
        roots => Err(ExpandError::AmbiguousPath {
            path: path.to_path_buf(),
            roots: roots.iter().map(|root| (*root).clone()).collect(),
        }),
    }
}

/// `acl/graph/__init__.py` spells `acl.graph`, `acl/fast.pyx` spells `acl.fast`.
fn spells_module(relative: &Path, module: &str) -> bool {
    let components: Vec<&str> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();
    let Some((file_name, dirs)) = components.split_last() else {
        return false;
    };
    let stem = file_name.split('.').next().unwrap_or(file_name);
    let parts: Vec<&str> = module.split('.').collect();

    if stem == "__init__" {
        dirs == parts.as_slice()
    } else {
        parts.split_last().is_some_and(|(last, parents)| *last == stem && dirs == parents)
    }
}

fn to_posix(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn write_stanza(snippet: &mut String, artifact: &Artifact) {
    let code = escape_triple_quoted(&artifact.text);
    // Writing to a String cannot fail
    let _ = write!(
        snippet,
        "file = pathlib.Path({path})\n\
         file.parent.mkdir(parents=True, exist_ok=True)\n\
         code = \"\"\"\\\n\
         {code}\"\"\"\n\
         file.write_text(textwrap.dedent(code))\n\n",
        path = quote_string(&artifact.relative_path),
    );
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn create_test_file(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    fn records(items: &[(&str, Option<PathBuf>)]) -> IndexMap<String, ModuleRecord> {
        items
            .iter()
            .map(|(name, path)| ((*name).to_owned(), ModuleRecord::new(name, path.clone())))
            .collect()
    }

    #[test]
    fn test_plain_source_stanza() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().canonicalize()?;
        create_test_file(&root.join("foo.py"), "print(1)\n")?;

        let records = records(&[
            ("__main__", Some(root.join("main.py"))),
            ("sys", None),
            ("foo", Some(root.join("foo.py"))),
        ]);
        let payload = PayloadBuilder::new(".pyx").build(
            &records,
            &EmbedSpec::new(["foo"]),
            &[root],
        )?;

        assert_eq!(payload.bundled, BTreeSet::from(["foo".to_owned()]));
        assert!(!payload.needs_build_step);
        assert_eq!(
            payload.snippet,
            "import textwrap\nimport pathlib\n\n\
             file = pathlib.Path(\"foo.py\")\n\
             file.parent.mkdir(parents=True, exist_ok=True)\n\
             code = \"\"\"\\\nprint(1)\n\"\"\"\n\
             file.write_text(textwrap.dedent(code))\n\n"
        );
        Ok(())
    }

    #[test]
    fn test_records_outside_embed_set_are_ignored() -> Result<()> {
        let records = records(&[("bar", Some(PathBuf::from("/nowhere/bar.py")))]);
        let payload = PayloadBuilder::new(".pyx").build(&records, &EmbedSpec::new(["foo"]), &[])?;
        assert!(payload.is_empty());
        assert_eq!(payload.snippet, "");
        Ok(())
    }

    #[test]
    fn test_namespace_record_is_dropped() -> Result<()> {
        let records = records(&[("foo", None)]);
        let payload = PayloadBuilder::new(".pyx").build(&records, &EmbedSpec::new(["foo"]), &[])?;
        assert!(payload.is_empty());
        Ok(())
    }

    #[test]
    fn test_compiled_extension_uses_sibling_source_and_one_build_step() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().canonicalize()?;
        let ext_a = root.join("acl/a.cpython-311-x86_64-linux-gnu.so");
        let ext_b = root.join("acl/b.abi3.so");
        create_test_file(&root.join("acl/__init__.py"), "")?;
        create_test_file(&ext_a, "")?;
        create_test_file(&ext_b, "")?;
        create_test_file(&root.join("acl/a.pyx"), "cdef int a = 1\n")?;
        create_test_file(&root.join("acl/b.pyx"), "cdef int b = 2\n")?;

        let records = records(&[
            ("acl", Some(root.join("acl/__init__.py"))),
            ("acl.a", Some(ext_a)),
            ("acl.b", Some(ext_b)),
        ]);
        let payload =
            PayloadBuilder::new(".pyx").build(&records, &EmbedSpec::new(["acl"]), &[root])?;

        assert!(payload.needs_build_step);
        let paths: Vec<&str> = payload
            .artifacts
            .iter()
            .map(|artifact| artifact.relative_path.as_str())
            .collect();
        assert_eq!(paths, ["acl/__init__.py", "acl/a.pyx", "acl/b.pyx"]);
        assert_eq!(payload.snippet.matches("cythonize(").count(), 1);
        assert!(payload.snippet.starts_with(&format!("{PRELUDE}{IMPORT_CYTHON}")));
        assert!(payload.snippet.ends_with(BUILD_CYTHON));
        Ok(())
    }

    #[test]
    fn test_missing_extension_source_is_fatal() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().canonicalize()?;
        let ext = root.join("acl/fast.cpython-311-x86_64-linux-gnu.so");
        create_test_file(&ext, "")?;

        let records = records(&[("acl.fast", Some(ext))]);
        let err = PayloadBuilder::new(".pyx")
            .build(&records, &EmbedSpec::new(["acl"]), &[root.clone()])
            .unwrap_err();

        match err.downcast_ref::<ExpandError>() {
            Some(ExpandError::UnreconstructableArtifact { expected, .. }) => {
                assert_eq!(expected, &root.join("acl/fast.pyx"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_unknown_filetype_is_fatal() {
        let records = records(&[("foo", Some(PathBuf::from("/site/foo.pyc")))]);
        let err = PayloadBuilder::new(".pyx")
            .build(&records, &EmbedSpec::new(["foo"]), &[PathBuf::from("/site")])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExpandError>(),
            Some(ExpandError::UnknownFileType { .. })
        ));
    }

    #[test]
    fn test_relative_site_path_requires_exactly_one_root() {
        let path = Path::new("/venv/lib/site-packages/foo/bar.py");
        let site = PathBuf::from("/venv/lib/site-packages");
        let other = PathBuf::from("/elsewhere");

        assert_eq!(
            relative_site_path(path, "foo.bar", &[other.clone(), site]).ok(),
            Some(PathBuf::from("foo/bar.py"))
        );
        assert!(matches!(
            relative_site_path(path, "foo.bar", &[other]),
            Err(ExpandError::UnresolvablePath { .. })
        ));
    }

    #[test]
    fn test_nested_roots_resolve_by_module_name() {
        let path = Path::new("/proj/.venv/lib/site-packages/foo/__init__.py");
        let project = PathBuf::from("/proj");
        let site = PathBuf::from("/proj/.venv/lib/site-packages");
        let roots = [project.clone(), site.clone()];

        assert_eq!(
            relative_site_path(path, "foo", &roots).ok(),
            Some(PathBuf::from("foo/__init__.py"))
        );
        // Neither root spells the name the module was imported under.
        match relative_site_path(path, "renamed", &roots) {
            Err(ExpandError::AmbiguousPath { roots, .. }) => assert_eq!(roots, vec![project, site]),
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn test_spells_module() {
        assert!(spells_module(Path::new("acl/graph/__init__.py"), "acl.graph"));
        assert!(spells_module(Path::new("acl/fast.pyx"), "acl.fast"));
        assert!(spells_module(Path::new("single.py"), "single"));
        assert!(!spells_module(Path::new("lib/acl/fast.pyx"), "acl.fast"));
        assert!(!spells_module(Path::new("acl/__init__.py"), "acl.graph"));
    }

    #[test]
    fn test_extension_source_path() {
        let builder = PayloadBuilder::new(".pyx");
        assert_eq!(
            builder.extension_source_path(Path::new("/s/acl/fast.cp311-win_amd64.pyd")),
            PathBuf::from("/s/acl/fast.pyx")
        );
        assert_eq!(
            builder.extension_source_path(Path::new("/s/acl/fast.so")),
            PathBuf::from("/s/acl/fast.pyx")
        );
    }
}
