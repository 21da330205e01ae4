//! Failure and intent signatures for the turn circuit breakers.
//!
//! A failure signature is a coarse fingerprint of a failed tool output; an
//! intent signature is a coarse fingerprint of what a tool call is trying
//! to do. Both ignore incidental detail (numbers in error text, argument
//! order, whitespace) so that loops are caught even when each iteration
//! differs slightly.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

static EXIT_CODE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:exited|exit(?:ed)? with|exit status|exit code)\D{0,16}?(-?\d+)").ok()
});

static DIGITS: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\d+").ok());

/// Substrings that identify connection-level failures.
const CONNECTION_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "network is unreachable",
    "name or service not known",
    "could not resolve host",
    "broken pipe",
    "econnrefused",
    "econnreset",
    "etimedout",
];

/// Longest error line kept in a signature.
const MAX_ERROR_LINE_CHARS: usize = 120;

fn normalize_error_line(line: &str) -> String {
    let lower = line.trim().to_lowercase();
    let masked = match DIGITS.as_ref() {
        Some(re) => re.replace_all(&lower, "#").into_owned(),
        None => lower,
    };
    masked
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(MAX_ERROR_LINE_CHARS)
        .collect()
}

/// Fingerprint of a failed tool output, or `None` if it does not look failed.
///
/// Recognized, in order:
/// - a non-zero exit code (`"Command exited with code 1"` → `exit:1`)
/// - a leading `Error:` line (digits masked, whitespace collapsed)
/// - a known connection-failure marker
#[must_use]
pub fn failure_signature(output: &str) -> Option<String> {
    if let Some(re) = EXIT_CODE.as_ref()
        && let Some(code) = re
            .captures(output)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<i64>().ok())
        && code != 0
    {
        return Some(format!("exit:{code}"));
    }

    if let Some(first) = output.lines().map(str::trim).find(|l| !l.is_empty())
        && first
            .get(..6)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("error:"))
    {
        return Some(format!("error:{}", normalize_error_line(&first[6..])));
    }

    let lower = output.to_lowercase();
    CONNECTION_MARKERS
        .iter()
        .find(|marker| lower.contains(*marker))
        .map(|marker| format!("connection:{marker}"))
}

fn normalize_tool_name(name: &str) -> String {
    name.trim().to_lowercase().replace(['-', ' '], "_")
}

fn string_arg<'a>(args: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| args.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn stable_hash(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .take(6)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Fingerprint of what a tool call is trying to do.
///
/// The dominant argument decides the intent: a path for file tools, a
/// query for search tools, the first two words of a command for shells, a
/// URL for fetchers. Otherwise the whole argument object is hashed
/// (serde_json objects serialize with sorted keys).
#[must_use]
pub fn intent_signature(tool: &str, args: &Value) -> String {
    let tool = normalize_tool_name(tool);

    if let Some(path) = string_arg(args, &["path", "file_path", "file", "filename"]) {
        return format!("{tool}:path={path}");
    }
    if let Some(query) = string_arg(args, &["query", "q", "pattern", "search"]) {
        let query = query.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
        return format!("{tool}:query={query}");
    }
    if let Some(command) = string_arg(args, &["command", "cmd"]) {
        let head = command.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
        return format!("{tool}:cmd={head}");
    }
    if let Some(url) = string_arg(args, &["url", "uri"]) {
        let url = url.split(['?', '#']).next().unwrap_or(url).trim_end_matches('/');
        return format!("{tool}:url={url}");
    }
    match args {
        Value::Null => tool,
        Value::Object(map) if map.is_empty() => tool,
        other => format!("{tool}:{}", stable_hash(&other.to_string())),
    }
}
