//! Minimal INI model with configparser-style interpolation.
//!
//! Package metadata, user configuration, source index files, bundle
//! manifests, and template control files are all INI-shaped. This module
//! implements the subset of the format those files rely on, including the
//! exact interpolation contract the metadata model requires: `%(name)s`
//! references resolved lazily and recursively against a substitution pool,
//! with cycle detection and an error on unresolved references.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;
use thiserror::Error;

/// Maximum interpolation recursion before we assume a runaway reference.
const MAX_INTERPOLATION_DEPTH: usize = 16;

/// Interpolation failures, naming the offending reference.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum InterpolationError {
    #[error("unresolved interpolation reference %({0})s")]
    Unresolved(String),
    #[error("interpolation cycle detected through %({0})s")]
    Cycle(String),
    #[error("bad interpolation syntax near '{0}'")]
    BadSyntax(String),
}

/// One parsed section: ordered key/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    entries: Vec<(String, String)>,
}

impl Section {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The section as a plain map (last write wins, order dropped).
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// An INI document: ordered named sections.
#[derive(Debug, Clone, Default)]
pub struct Ini {
    sections: Vec<(String, Section)>,
}

impl Ini {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a string. Keys are lower-cased unless `preserve_case` is
    /// set (bundle manifests key on URLs, which must survive verbatim).
    pub fn parse(input: &str, preserve_case: bool) -> Result<Self, String> {
        let mut ini = Self::new();
        let mut current: Option<usize> = None;
        let mut last_key: Option<String> = None;

        for (lineno, raw_line) in input.lines().enumerate() {
            let line = raw_line.trim_end();
            let trimmed = line.trim_start();

            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                last_key = None;
                continue;
            }

            // Continuation: an indented line appends to the previous value.
            if line.starts_with(char::is_whitespace) {
                if let (Some(idx), Some(key)) = (current, last_key.as_ref()) {
                    let section = &mut ini.sections[idx].1;
                    let existing = section.get(key).unwrap_or_default().to_string();
                    let joined = if existing.is_empty() {
                        trimmed.to_string()
                    } else {
                        format!("{existing}\n{trimmed}")
                    };
                    section.set(key.clone(), joined);
                    continue;
                }
                return Err(format!("line {}: unexpected continuation", lineno + 1));
            }

            if let Some(name) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                current = Some(ini.ensure_section(name.trim()));
                last_key = None;
                continue;
            }

            let split = trimmed
                .char_indices()
                .find(|(_, c)| *c == '=' || *c == ':')
                .map(|(i, _)| i);
            let Some(pos) = split else {
                return Err(format!("line {}: expected 'key = value'", lineno + 1));
            };
            let Some(idx) = current else {
                return Err(format!("line {}: entry before any [section]", lineno + 1));
            };

            let mut key = trimmed[..pos].trim().to_string();
            if !preserve_case {
                key = key.to_lowercase();
            }
            if key.is_empty() {
                return Err(format!("line {}: empty key", lineno + 1));
            }
            let value = trimmed[pos + 1..].trim().to_string();
            ini.sections[idx].1.set(key.clone(), value);
            last_key = Some(key);
        }

        Ok(ini)
    }

    /// Parse a file; IO failures surface as the string error the metadata
    /// layer converts into `BadMetadata`.
    pub fn parse_file(path: &Path, preserve_case: bool) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        Self::parse(&content, preserve_case)
    }

    fn ensure_section(&mut self, name: &str) -> usize {
        if let Some(idx) = self.sections.iter().position(|(n, _)| n == name) {
            return idx;
        }
        self.sections.push((name.to_string(), Section::default()));
        self.sections.len() - 1
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn section_mut(&mut self, name: &str) -> &mut Section {
        let idx = self.ensure_section(name);
        &mut self.sections[idx].1
    }

    pub fn remove_section(&mut self, name: &str) {
        self.sections.retain(|(n, _)| n != name);
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.section(name).is_some()
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|(n, _)| n.as_str())
    }

    pub fn sections(&self) -> impl Iterator<Item = (&str, &Section)> {
        self.sections.iter().map(|(n, s)| (n.as_str(), s))
    }

    /// Serialize in configparser style.
    pub fn to_string(&self) -> String {
        let mut out = String::new();
        for (name, section) in &self.sections {
            let _ = writeln!(out, "[{name}]");
            for (key, value) in section.iter() {
                if value.contains('\n') {
                    let _ = writeln!(out, "{key} =");
                    for line in value.lines() {
                        let _ = writeln!(out, "\t{line}");
                    }
                } else {
                    let _ = writeln!(out, "{key} = {value}");
                }
            }
            let _ = writeln!(out);
        }
        out
    }
}

/// Resolve `%(name)s` references in `value` against `pool`, recursively.
///
/// `%%` escapes a literal percent sign. References inside substituted
/// values are resolved in turn; a reference chain that revisits a name
/// fails with [`InterpolationError::Cycle`], and a reference absent from
/// the pool fails with [`InterpolationError::Unresolved`].
pub fn interpolate(
    value: &str,
    pool: &BTreeMap<String, String>,
) -> Result<String, InterpolationError> {
    let mut active = Vec::new();
    interpolate_inner(value, pool, &mut active, 0)
}

fn interpolate_inner(
    value: &str,
    pool: &BTreeMap<String, String>,
    active: &mut Vec<String>,
    depth: usize,
) -> Result<String, InterpolationError> {
    if depth > MAX_INTERPOLATION_DEPTH {
        return Err(InterpolationError::Cycle(
            active.last().cloned().unwrap_or_default(),
        ));
    }

    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some('(') => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some(')') => break,
                        Some(c) => name.push(c),
                        None => return Err(InterpolationError::BadSyntax(value.to_string())),
                    }
                }
                match chars.next() {
                    Some('s') => {}
                    _ => return Err(InterpolationError::BadSyntax(value.to_string())),
                }

                if active.iter().any(|n| *n == name) {
                    return Err(InterpolationError::Cycle(name));
                }
                let replacement = pool
                    .get(&name)
                    .ok_or_else(|| InterpolationError::Unresolved(name.clone()))?;
                active.push(name);
                let resolved = interpolate_inner(replacement, pool, active, depth + 1)?;
                active.pop();
                out.push_str(&resolved);
            }
            _ => return Err(InterpolationError::BadSyntax(value.to_string())),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_sections_and_continuations() {
        let text = "\
[package]
description = A package
  that spans lines
depends =
  bar >=1.0.0
  baz *
";
        let ini = Ini::parse(text, false).unwrap();
        let pkg = ini.section("package").unwrap();
        assert_eq!(pkg.get("description"), Some("A package\nthat spans lines"));
        assert_eq!(pkg.get("depends"), Some("bar >=1.0.0\nbaz *"));
    }

    #[test]
    fn preserves_key_case_when_asked() {
        let text = "[bundle]\nhttps://example.com/Foo = v1.0.0\n";
        let ini = Ini::parse(text, true).unwrap();
        assert_eq!(
            ini.section("bundle").unwrap().get("https://example.com/Foo"),
            Some("v1.0.0")
        );
    }

    #[test]
    fn entry_outside_section_is_an_error() {
        assert!(Ini::parse("key = value\n", false).is_err());
    }

    #[test]
    fn interpolation_resolves_recursively() {
        let pool = pool(&[
            ("prefix", "/opt/zeek"),
            ("bin", "%(prefix)s/bin"),
            ("zeek", "%(bin)s/zeek"),
        ]);
        assert_eq!(interpolate("%(zeek)s", &pool).unwrap(), "/opt/zeek/bin/zeek");
    }

    #[test]
    fn interpolation_detects_cycles() {
        let pool = pool(&[("a", "%(b)s"), ("b", "%(a)s")]);
        match interpolate("%(a)s", &pool) {
            Err(InterpolationError::Cycle(name)) => assert!(name == "a" || name == "b"),
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn interpolation_rejects_unresolved() {
        let pool = pool(&[]);
        assert_eq!(
            interpolate("./configure --with=%(LAST_VAR)s", &pool),
            Err(InterpolationError::Unresolved("LAST_VAR".into()))
        );
    }

    #[test]
    fn percent_escape_passes_through() {
        let pool = pool(&[]);
        assert_eq!(interpolate("100%%", &pool).unwrap(), "100%");
    }

    #[test]
    fn roundtrip_write_parse() {
        let mut ini = Ini::new();
        ini.section_mut("bundle")
            .set("https://example.com/foo", "1.0.0");
        let text = ini.to_string();
        let back = Ini::parse(&text, true).unwrap();
        assert_eq!(
            back.section("bundle").unwrap().get("https://example.com/foo"),
            Some("1.0.0")
        );
    }
}
