//! AST visitor implementations for expander

mod import_discovery;

pub use import_discovery::{DiscoveredImport, ImportDiscoveryVisitor};
