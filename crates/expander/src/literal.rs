//! Encoding of arbitrary text as the body of a `"""` string literal.
//!
//! The steps must run in this order:
//! 1. every backslash is doubled,
//! 2. every carriage return becomes `\r`,
//! 3. the third quote of every `"""` run is escaped (`""\"`),
//! 4. a trailing unescaped `"` is escaped so it cannot fuse with the closing
//!    delimiter.
//!
//! Escaping quotes first would have step 1 double the backslashes inserted by
//! step 3 and leave the quotes unescaped again. A raw carriage return would be
//! read back as a line break that the indentation of the block cannot cover.

use std::borrow::Cow;

use cow_utils::CowUtils;

const DELIMITER_RUN: &str = "\"\"\"";
const ESCAPED_RUN: &str = "\"\"\\\"";

/// Escape `text` so that `"""\` + result + `"""` evaluates back to `text`.
pub fn escape_triple_quoted(text: &str) -> Cow<'_, str> {
    let escaped = escape_delimiter_runs(escape_carriage_returns(escape_backslashes(text)));
    escape_trailing_quote(escaped)
}

/// Render `text` as a double-quoted single-line Python string literal.
pub fn quote_string(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for c in text.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

fn escape_backslashes(text: &str) -> Cow<'_, str> {
    text.cow_replace('\\', "\\\\")
}

fn escape_carriage_returns(text: Cow<'_, str>) -> Cow<'_, str> {
    if text.contains('\r') {
        Cow::Owned(text.replace('\r', "\\r"))
    } else {
        text
    }
}

fn escape_delimiter_runs(text: Cow<'_, str>) -> Cow<'_, str> {
    if text.contains(DELIMITER_RUN) {
        Cow::Owned(text.replace(DELIMITER_RUN, ESCAPED_RUN))
    } else {
        text
    }
}

fn escape_trailing_quote(text: Cow<'_, str>) -> Cow<'_, str> {
    let Some(body) = text.strip_suffix('"') else {
        return text;
    };
    // Backslashes were doubled in step 1, so an odd count means the quote was
    // already escaped in step 2.
    let preceding = body.chars().rev().take_while(|c| *c == '\\').count();
    if preceding % 2 == 1 {
        return text;
    }
    let mut owned = String::with_capacity(text.len() + 1);
    owned.push_str(body);
    owned.push_str("\\\"");
    Cow::Owned(owned)
}
