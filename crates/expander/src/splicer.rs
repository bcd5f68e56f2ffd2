//! Assembly of the final program text.

use std::fmt::Write;

use log::debug;

use crate::{
    analyzer::InsertionPoint,
    literal::quote_string,
    metadata::MetadataProvider,
    payload::Payload,
};

const INDENT: &str = "    ";
const FOOTER_HEADING: &str = "\n\n# package information\n";

fn separator() -> String {
    format!("# {}\n", "-".repeat(77))
}

/// Inserts the guarded payload into the entry text and appends the
/// attribution footer.
#[derive(Debug)]
pub struct Splicer<'a, M: ?Sized> {
    marker: &'a str,
    metadata: &'a M,
}

impl<'a, M: MetadataProvider + ?Sized> Splicer<'a, M> {
    pub fn new(marker: &'a str, metadata: &'a M) -> Self {
        Self { marker, metadata }
    }

    /// Every entry line is kept byte-for-byte; the block goes in front of the
    /// line at `at`. With nothing bundled the entry text comes back unchanged.
    pub fn splice(&self, entry_text: &str, at: InsertionPoint, payload: &Payload) -> String {
        if payload.is_empty() {
            return entry_text.to_owned();
        }

        let lines: Vec<&str> = entry_text.split_inclusive('\n').collect();
        let split = at.line().min(lines.len());
        let (head, tail) = lines.split_at(split);

        let mut out = String::with_capacity(entry_text.len() + payload.snippet.len() * 2);
        for line in head {
            out.push_str(line);
        }
        if split > 0 {
            if !out.ends_with('\n') {
                out.push('\n');
            }
            out.push('\n');
        }
        out.push_str(&self.guard_block(&payload.snippet));
        for line in tail {
            out.push_str(line);
        }

        out.push_str(&self.footer(payload));
        out
    }

    fn guard_block(&self, snippet: &str) -> String {
        let mut block = format!(
            "import sys\n\nif sys.argv[-1] == {}:\n",
            quote_string(self.marker)
        );
        block.push_str(&indent(snippet, INDENT));
        block
    }

    fn footer(&self, payload: &Payload) -> String {
        let mut footer = String::new();
        for package in &payload.bundled {
            let Some(block) = self.metadata.describe(package) else {
                debug!("No package information for `{package}`");
                continue;
            };
            if footer.is_empty() {
                footer.push_str(FOOTER_HEADING);
                footer.push_str(&separator());
            }
            let _ = write!(footer, "{}{}", block.render(), separator());
        }
        footer
    }
}

/// Prefix every line that is not blank. Only `\n` ends a line, matching how
/// `textwrap.dedent` measures the margin when the block runs. Embedded sources
/// carry no raw `\r`; the literal encoding escapes it.
fn indent(text: &str, prefix: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    for line in text.split_inclusive('\n') {
        let content = line.trim_end_matches(['\n', '\r']);
        if !content.chars().all(|c| c == ' ' || c == '\t') {
            out.push_str(prefix);
        }
        out.push_str(line);
    }
    out
}
