//! Embeds selected Python packages into a single entry file so it can run
//! where they are not installed.

pub mod analyzer;
pub mod config;
pub mod dirs;
pub mod error;
pub mod graph;
pub mod literal;
pub mod metadata;
pub mod orchestrator;
pub mod payload;
pub mod resolver;
pub mod splicer;
pub mod visitors;

pub use error::ExpandError;
pub use orchestrator::{Expander, Expansion};
pub use payload::EmbedSpec;
