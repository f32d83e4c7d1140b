//! User variables: named values a package or template requires at
//! build/instantiation time.
//!
//! Declared in metadata as `user_vars = NAME [default] "description"`
//! entries. Resolution priority is fixed: explicit command-line override,
//! then a same-named environment variable, then the persisted answer in the
//! user config, then the declared default. The engine itself never prompts;
//! front-ends that do prompt feed the answer back in as an override.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

static USER_VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(\w+)\s+\[(.*?)\]\s+"(.*?)""#).expect("static regex"));

/// A single declared user variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserVar {
    name: String,
    default: Option<String>,
    description: String,
}

impl UserVar {
    pub fn new(name: impl Into<String>, default: Option<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default,
            description: description.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Parse the metadata `user_vars` field. Returns `None` when the field
    /// is present but malformed (the caller reports a metadata error).
    pub fn parse_field(text: &str) -> Option<Vec<UserVar>> {
        let text = text.trim();
        if text.is_empty() {
            return Some(Vec::new());
        }

        let mut vars = Vec::new();
        for caps in USER_VAR_RE.captures_iter(text) {
            vars.push(UserVar::new(
                &caps[1],
                Some(caps[2].to_string()),
                caps[3].to_string(),
            ));
        }

        // Anything left over beyond whitespace means the field didn't fully
        // match the NAME [default] "description" shape.
        let leftover = USER_VAR_RE.replace_all(text, "");
        if vars.is_empty() || !leftover.trim().is_empty() {
            return None;
        }
        Some(vars)
    }

    /// Parse a `NAME=VALUE` command-line override.
    pub fn parse_arg(arg: &str) -> Result<(String, String), String> {
        match arg.split_once('=') {
            Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
            _ => Err(format!("invalid user var argument \"{arg}\", must be NAME=VALUE")),
        }
    }

    /// Resolve this variable's value.
    ///
    /// Priority: `overrides` (command line) > environment variable of the
    /// same name > `persisted` (user config answers) > declared default.
    /// Returns `Err` with the variable name when nothing resolves.
    pub fn resolve(
        &self,
        overrides: &BTreeMap<String, String>,
        persisted: &BTreeMap<String, String>,
    ) -> Result<String, String> {
        if let Some(v) = overrides.get(&self.name) {
            return Ok(v.clone());
        }
        if let Ok(v) = std::env::var(&self.name) {
            if !v.is_empty() {
                return Ok(v);
            }
        }
        if let Some(v) = persisted.get(&self.name) {
            return Ok(v.clone());
        }
        self.default.clone().ok_or_else(|| self.name.clone())
    }
}

/// Resolve a whole declared set, in declaration order.
pub fn resolve_all(
    vars: &[UserVar],
    overrides: &BTreeMap<String, String>,
    persisted: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, String> {
    let mut out = BTreeMap::new();
    for var in vars {
        let value = var.resolve(overrides, persisted)?;
        out.insert(var.name().to_string(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_declared_vars() {
        let vars = UserVar::parse_field(
            r#"LIBRDKAFKA_ROOT [/usr] "Path to librdkafka installation" TEST_VAR [] "A test var""#,
        )
        .unwrap();
        assert_eq!(vars.len(), 2);
        assert_eq!(vars[0].name(), "LIBRDKAFKA_ROOT");
        assert_eq!(vars[0].default(), Some("/usr"));
        assert_eq!(vars[1].name(), "TEST_VAR");
        assert_eq!(vars[1].default(), Some(""));
    }

    #[test]
    fn malformed_field_is_none() {
        assert!(UserVar::parse_field("NOT A VALID FIELD").is_none());
    }

    #[test]
    fn empty_field_is_empty_vec() {
        assert_eq!(UserVar::parse_field("").unwrap(), Vec::new());
    }

    #[test]
    fn parse_arg_splits_on_first_equals() {
        let (name, value) = UserVar::parse_arg("PATH_VAR=/a=b").unwrap();
        assert_eq!(name, "PATH_VAR");
        assert_eq!(value, "/a=b");
        assert!(UserVar::parse_arg("nonsense").is_err());
    }

    #[test]
    fn override_beats_persisted_and_default() {
        let var = UserVar::new("BUILD_ROOT", Some("/default".into()), "");
        let mut overrides = BTreeMap::new();
        let mut persisted = BTreeMap::new();
        persisted.insert("BUILD_ROOT".to_string(), "/persisted".to_string());

        assert_eq!(var.resolve(&overrides, &persisted).unwrap(), "/persisted");
        overrides.insert("BUILD_ROOT".to_string(), "/cli".to_string());
        assert_eq!(var.resolve(&overrides, &persisted).unwrap(), "/cli");
    }

    #[test]
    fn unresolved_names_the_variable() {
        let var = UserVar::new("MISSING", None, "");
        let err = var.resolve(&BTreeMap::new(), &BTreeMap::new()).unwrap_err();
        assert_eq!(err, "MISSING");
    }
}
