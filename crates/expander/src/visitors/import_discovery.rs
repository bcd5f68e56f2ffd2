//! Import discovery visitor that finds all imports in a Python module,
//! including those nested within functions, classes, and other scopes.

use ruff_python_ast::{
    Expr, Stmt, StmtImport, StmtImportFrom,
    visitor::{Visitor, walk_stmt},
};

/// An import discovered during AST traversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredImport {
    /// The module being imported (`None` for `from . import x`)
    pub module_name: Option<String>,
    /// Names being imported (for from imports)
    pub names: Vec<String>,
    /// Import level for relative imports
    pub level: u32,
    /// Whether the import is guarded by `if TYPE_CHECKING:`
    pub is_type_checking_only: bool,
}

/// Visitor that discovers all imports in a Python module
#[derive(Debug, Default)]
pub struct ImportDiscoveryVisitor {
    imports: Vec<DiscoveredImport>,
    in_type_checking: bool,
}

impl ImportDiscoveryVisitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect every import statement reachable from `body`.
    pub fn discover(body: &[Stmt]) -> Vec<DiscoveredImport> {
        let mut visitor = Self::new();
        for stmt in body {
            visitor.visit_stmt(stmt);
        }
        visitor.into_imports()
    }

    pub fn into_imports(self) -> Vec<DiscoveredImport> {
        self.imports
    }

    /// Check if a condition is a TYPE_CHECKING check
    fn is_type_checking_condition(expr: &Expr) -> bool {
        match expr {
            Expr::Name(name) => name.id.as_str() == "TYPE_CHECKING",
            Expr::Attribute(attr) => {
                attr.attr.as_str() == "TYPE_CHECKING"
                    && matches!(&*attr.value, Expr::Name(name) if name.id.as_str() == "typing")
            }
            _ => false,
        }
    }

    fn record_import(&mut self, stmt: &StmtImport) {
        for alias in &stmt.names {
            self.imports.push(DiscoveredImport {
                module_name: Some(alias.name.to_string()),
                names: Vec::new(),
                level: 0,
                is_type_checking_only: self.in_type_checking,
            });
        }
    }

    fn record_import_from(&mut self, stmt: &StmtImportFrom) {
        // `*` names no submodule
        let names = stmt
            .names
            .iter()
            .map(|alias| alias.name.to_string())
            .filter(|name| name != "*")
            .collect();

        self.imports.push(DiscoveredImport {
            module_name: stmt.module.as_ref().map(ToString::to_string),
            names,
            level: stmt.level,
            is_type_checking_only: self.in_type_checking,
        });
    }
}

impl<'a> Visitor<'a> for ImportDiscoveryVisitor {
    fn visit_stmt(&mut self, stmt: &'a Stmt) {
        match stmt {
            Stmt::Import(import_stmt) => self.record_import(import_stmt),
            Stmt::ImportFrom(import_from) => self.record_import_from(import_from),
            Stmt::If(if_stmt) => {
                let was_type_checking = self.in_type_checking;
                if Self::is_type_checking_condition(&if_stmt.test) {
                    self.in_type_checking = true;
                }
                walk_stmt(self, stmt);
                self.in_type_checking = was_type_checking;
            }
            _ => walk_stmt(self, stmt),
        }
    }
}
