//! Shared shape for line-oriented tool output parsers.

use tracing::debug;

/// Outcome of parsing one line of tool output
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine<T> {
    Record(T),
    /// Header, blank or section line; carries no data
    Skip,
    /// Looked like data but could not be parsed; dropped
    Malformed(String),
}

/// Parse every line, keeping records and dropping skipped/malformed rows.
pub fn collect_records<T>(
    source: &'static str,
    lines: impl Iterator<Item = ParsedLine<T>>,
) -> Vec<T> {
    let mut out = Vec::new();
    let mut dropped = 0usize;
    for line in lines {
        match line {
            ParsedLine::Record(r) => out.push(r),
            ParsedLine::Skip => {}
            ParsedLine::Malformed(reason) => {
                dropped += 1;
                debug!(source, %reason, "dropping malformed row");
            }
        }
    }
    if dropped > 0 {
        debug!(source, dropped, kept = out.len(), "parsed with dropped rows");
    }
    out
}

/// Whitespace-split columns of a line
pub fn columns(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

/// The first `n` whitespace-separated fields and the trimmed remainder.
///
/// `None` when the line has fewer than `n` fields or nothing after them.
pub fn split_leading(line: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut fields = Vec::with_capacity(n);
    let mut rest = line.trim_start();
    for _ in 0..n {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    let rest = rest.trim_end();
    if rest.is_empty() {
        None
    } else {
        Some((fields, rest))
    }
}
