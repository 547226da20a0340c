//! Declarative reader for cookbook `metadata.rb` files.
//!
//! `metadata.rb` is a Ruby DSL. Fetched content is never evaluated: this reader only
//! recognises `name`, `version`, `depends` and `supports` statements whose arguments are
//! plain string literals, and ignores every other line.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::model::{Metadata, DEFAULT_CONSTRAINT};

/// File name of the metadata DSL inside a cookbook repository.
pub const METADATA_FILE: &str = "metadata.rb";

/// Fields read from a `metadata.rb`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMetadata {
    pub name: Option<String>,
    pub version: Option<String>,
    pub dependencies: BTreeMap<String, String>,
    pub platforms: BTreeMap<String, String>,
}

impl ParsedMetadata {
    pub fn into_metadata(self) -> Metadata {
        Metadata {
            dependencies: self.dependencies,
            platforms: self.platforms,
        }
    }
}

fn statement_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(name|version|depends|supports)\b\s*\(?\s*(.*?)\s*\)?\s*$")
            .expect("statement pattern is a valid regex")
    })
}

fn literal_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"^\s*(?:'([^'\\]*)'|"([^"\\]*)")\s*(?:,|$)"#)
            .expect("literal pattern is a valid regex")
    })
}

/// Split an argument list into string literals. `None` if anything else appears.
fn literals(arguments: &str) -> Option<Vec<String>> {
    let mut rest = arguments.trim();
    let mut values = Vec::new();
    while !rest.is_empty() {
        let captures = literal_pattern().captures(rest)?;
        let value = captures
            .get(1)
            .or_else(|| captures.get(2))
            .map(|m| m.as_str())?;
        // Double-quoted interpolation would need evaluation.
        if value.contains("#{") {
            return None;
        }
        values.push(value.to_string());
        rest = rest[captures.get(0)?.end()..].trim_start();
    }
    Some(values)
}

/// Drop a trailing `# comment` that sits outside any string literal.
fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    for (idx, ch) in line.char_indices() {
        match (quote, ch) {
            (None, '\'' | '"') => quote = Some(ch),
            (Some(open), c) if c == open => quote = None,
            (None, '#') => return &line[..idx],
            _ => {}
        }
    }
    line
}

/// Read the known fields out of `metadata.rb` source text.
pub fn parse(source: &str) -> ParsedMetadata {
    let mut parsed = ParsedMetadata::default();
    for line in source.lines().map(strip_comment) {
        let Some(captures) = statement_pattern().captures(line) else {
            continue;
        };
        let keyword = &captures[1];
        let Some(args) = literals(&captures[2]) else {
            tracing::debug!(line = line.trim(), "Skipping non-literal metadata statement");
            continue;
        };
        match (keyword, args.as_slice()) {
            ("name", [name]) => parsed.name = Some(name.clone()),
            ("version", [version]) => parsed.version = Some(version.clone()),
            ("depends" | "supports", [target, rest @ ..]) if rest.len() <= 1 => {
                let constraint = rest
                    .first()
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_CONSTRAINT.to_string());
                let map = if keyword == "depends" {
                    &mut parsed.dependencies
                } else {
                    &mut parsed.platforms
                };
                map.insert(target.clone(), constraint);
            }
            _ => {
                tracing::debug!(line = line.trim(), "Skipping unrecognised metadata statement");
            }
        }
    }
    parsed
}
