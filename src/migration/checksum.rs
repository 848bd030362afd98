//! Checksum calculation for migration scripts

use once_cell::sync::Lazy;
use regex::Regex;

/// Lines that are entirely a single-line comment
static COMMENT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(--|//)").expect("comment line pattern is valid"));

/// Remove full-line comments from a script
///
/// Lines whose trimmed form starts with `--` or `//` are dropped; the
/// remaining lines are joined with `\n`. Comments trailing a statement on the
/// same line are left to the lexer.
#[must_use]
pub fn strip_comment_lines(content: &str) -> String {
    content
        .lines()
        .filter(|line| !COMMENT_LINE.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// CRC-32 of a (comment-filtered) script
///
/// Used to detect scripts edited after they were applied.
#[must_use]
pub fn calculate_checksum(script: &str) -> u32 {
    crc32fast::hash(script.as_bytes())
}
