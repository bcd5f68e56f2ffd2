//! Fatal error conditions raised while expanding an entry file.
//!
//! Everything here aborts the run. Recoverable situations (excluded packages,
//! unreadable package metadata) are logged where they happen instead.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExpandError {
    #[error("entry file {} could not be read", path.display())]
    MissingEntry {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    /// A compiled extension was selected for embedding but its source
    /// counterpart is not installed next to it.
    #[error(
        "cannot reconstruct `{module}`: compiled extension {} has no source file at {}",
        extension.display(),
        expected.display()
    )]
    UnreconstructableArtifact {
        module: String,
        extension: PathBuf,
        expected: PathBuf,
    },

    #[error("unknown filetype for `{module}`: {}", path.display())]
    UnknownFileType { module: String, path: PathBuf },

    #[error("failed to resolve {} against any search root", path.display())]
    UnresolvablePath { path: PathBuf },

    #[error(
        "{} is contained in several search roots ({}); refusing to guess its install location",
        path.display(),
        roots.iter().map(|r| r.display().to_string()).collect::<Vec<_>>().join(", ")
    )]
    AmbiguousPath { path: PathBuf, roots: Vec<PathBuf> },
}
