//! Entry file analysis: where generated code may be inserted, and whether the
//! file has already been expanded.

use std::{
    fs,
    path::{Path, PathBuf},
};

use ruff_python_ast::{CmpOp, Expr, ModModule, Stmt, StmtIf, StmtImportFrom};
use ruff_python_parser::{Parsed, parse_module};
use ruff_text_size::Ranged;

use crate::error::ExpandError;

/// Zero-based index into the entry file's lines before which the guard block
/// is inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct InsertionPoint(usize);

impl InsertionPoint {
    pub const TOP: Self = Self(0);

    pub const fn new(line: usize) -> Self {
        Self(line)
    }

    pub const fn line(self) -> usize {
        self.0
    }
}

/// The file being expanded, read and parsed once.
#[derive(Debug)]
pub struct EntrySource {
    path: PathBuf,
    text: String,
    parsed: Parsed<ModModule>,
}

impl EntrySource {
    pub fn read(path: &Path) -> Result<Self, ExpandError> {
        let text = fs::read_to_string(path).map_err(|source| ExpandError::MissingEntry {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_text(path, text)
    }

    pub fn from_text(path: &Path, text: String) -> Result<Self, ExpandError> {
        let parsed = parse_module(&text).map_err(|err| ExpandError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            text,
            parsed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn body(&self) -> &[Stmt] {
        &self.parsed.syntax().body
    }

    /// Line right after the last top-level `from __future__ import`.
    ///
    /// Future statements must precede every other statement except the module
    /// docstring, so anything inserted above them would be a syntax error.
    pub fn insertion_point(&self) -> InsertionPoint {
        let last_future_end = self
            .body()
            .iter()
            .filter_map(|stmt| match stmt {
                Stmt::ImportFrom(import_from) if is_future_import(import_from) => {
                    Some(usize::from(import_from.end()))
                }
                _ => None,
            })
            .max();

        match last_future_end {
            Some(end) => {
                let end_line = self.text[..end].matches('\n').count();
                InsertionPoint(end_line + 1)
            }
            None => InsertionPoint::TOP,
        }
    }

    /// Whether a top-level `if sys.argv[-1] == "<marker>":` block exists.
    pub fn existing_guard(&self, marker: &str) -> bool {
        self.body().iter().any(|stmt| match stmt {
            Stmt::If(if_stmt) => is_guard(if_stmt, marker),
            _ => false,
        })
    }
}

/// Parse `text` and return the line offset after its future statements.
pub fn locate_insertion_point(text: &str) -> Result<InsertionPoint, ExpandError> {
    let entry = EntrySource::from_text(Path::new("<string>"), text.to_owned())?;
    Ok(entry.insertion_point())
}

fn is_future_import(import_from: &StmtImportFrom) -> bool {
    import_from.level == 0
        && import_from
            .module
            .as_ref()
            .is_some_and(|module| module.as_str() == "__future__")
}

fn is_guard(if_stmt: &StmtIf, marker: &str) -> bool {
    let Expr::Compare(compare) = if_stmt.test.as_ref() else {
        return false;
    };
    if !matches!(compare.ops.as_ref(), [CmpOp::Eq]) {
        return false;
    }
    let Expr::Subscript(subscript) = compare.left.as_ref() else {
        return false;
    };
    let Expr::Attribute(attribute) = subscript.value.as_ref() else {
        return false;
    };
    let is_sys_argv = attribute.attr.as_str() == "argv"
        && matches!(attribute.value.as_ref(), Expr::Name(name) if name.id.as_str() == "sys");

    is_sys_argv
        && matches!(
            compare.comparators.first(),
            Some(Expr::StringLiteral(literal)) if literal.value.to_str() == marker
        )
}
