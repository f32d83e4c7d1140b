//! Version kinds and constraint matching.
//!
//! A package's installed version is one of three disjoint kinds, captured
//! by [`TrackingMethod`]: a release tag (semantic version, optional leading
//! `v` stripped for comparison), a branch pin (tracks the branch tip), or a
//! raw commit hash. The kind determines upgrade eligibility downstream.
//!
//! Constraints ([`VersionSpec`]) are either `branch=NAME` pins or semver
//! range expressions (`*`, `>=1.0.0`, `>=1.0.0,<2.0.0`, `=1.0.0`, ...).

use std::fmt;

use serde::{Deserialize, Serialize};

/// How an installed package tracks its upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingMethod {
    /// Pinned to a release tag; upgrade moves to the highest tag.
    Version,
    /// Pinned to a branch; upgrade fast-forwards to the branch tip.
    Branch,
    /// Pinned to an exact commit; never upgraded.
    Commit,
}

impl fmt::Display for TrackingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackingMethod::Version => write!(f, "version"),
            TrackingMethod::Branch => write!(f, "branch"),
            TrackingMethod::Commit => write!(f, "commit"),
        }
    }
}

/// Strip an optional leading `v` from a version tag for comparison.
///
/// `v1.2.3` and `1.2.3` name the same release; the prefix is only stripped
/// when a digit follows so branch names like `various` survive.
pub fn normalize_version_tag(tag: &str) -> &str {
    match tag.strip_prefix('v') {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => rest,
        _ => tag,
    }
}

/// Parse a (possibly abbreviated) version tag into a semver version.
///
/// Tags in the wild drop trailing components (`1.0`, `2`); pad them out the
/// way `Version.coerce` does before handing to the semver parser.
pub fn coerce_version(tag: &str) -> Result<semver::Version, semver::Error> {
    let tag = normalize_version_tag(tag);
    let core_end = tag
        .find(|c| c == '-' || c == '+')
        .unwrap_or(tag.len());
    let (core, rest) = tag.split_at(core_end);
    let dots = core.matches('.').count();
    let padded = match dots {
        0 => format!("{core}.0.0{rest}"),
        1 => format!("{core}.0{rest}"),
        _ => tag.to_string(),
    };
    padded.parse()
}

/// Whether a tag parses as a release version at all.
pub fn is_version_tag(tag: &str) -> bool {
    coerce_version(tag).is_ok()
}

/// Sort version tags ascending; non-version tags are dropped.
pub fn sorted_version_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parsed: Vec<(semver::Version, String)> = tags
        .into_iter()
        .filter_map(|t| {
            let raw = t.as_ref().to_string();
            coerce_version(&raw).ok().map(|v| (v, raw))
        })
        .collect();
    parsed.sort();
    parsed.into_iter().map(|(_, raw)| raw).collect()
}

/// Whether a string looks like an abbreviated or full commit hash.
pub fn looks_like_commit(text: &str) -> bool {
    text.len() >= 7 && text.len() <= 40 && text.chars().all(|c| c.is_ascii_hexdigit())
}

/// A parsed version constraint from a `depends` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    /// `*`: any version.
    Any,
    /// A semver range such as `>=1.0.0,<2.0.0`.
    Range(semver::VersionReq),
    /// `branch=NAME`: must track the named branch.
    Branch(String),
}

impl VersionSpec {
    /// Parse a constraint string.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let spec = spec.trim();
        if spec.is_empty() || spec == "*" {
            return Ok(VersionSpec::Any);
        }
        if let Some(branch) = spec.strip_prefix("branch=") {
            if branch.is_empty() {
                return Err("empty branch name in constraint".to_string());
            }
            return Ok(VersionSpec::Branch(branch.to_string()));
        }
        // Bare versions mean exact equality, matching how dependency
        // listings like `bar =1.0.0` are commonly written with or without
        // the operator.
        let req = spec
            .parse::<semver::VersionReq>()
            .map_err(|e| format!("invalid semver constraint \"{spec}\": {e}"))?;
        Ok(VersionSpec::Range(req))
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, VersionSpec::Branch(_))
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSpec::Any => write!(f, "*"),
            VersionSpec::Range(req) => write!(f, "{req}"),
            VersionSpec::Branch(name) => write!(f, "branch={name}"),
        }
    }
}

/// A concrete resolved version together with its tracking method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageVersion {
    pub method: TrackingMethod,
    pub version: String,
}

impl PackageVersion {
    pub fn new(method: TrackingMethod, version: impl Into<String>) -> Self {
        Self {
            method,
            version: version.into(),
        }
    }

    /// Check this version against a constraint string.
    ///
    /// Returns `Ok(())` when satisfied, else a message explaining the
    /// mismatch (used verbatim in dependency error reports).
    pub fn fulfills(&self, spec: &str) -> Result<(), String> {
        let spec = VersionSpec::parse(spec)?;
        match (&spec, self.method) {
            (VersionSpec::Any, _) => Ok(()),
            (VersionSpec::Branch(want), TrackingMethod::Branch) => {
                if *want == self.version {
                    Ok(())
                } else {
                    Err(format!(
                        "tracks branch \"{}\", not required branch \"{want}\"",
                        self.version
                    ))
                }
            }
            (VersionSpec::Branch(want), _) => Err(format!(
                "{} \"{}\" does not track required branch \"{want}\"",
                self.method, self.version
            )),
            (VersionSpec::Range(req), TrackingMethod::Version) => {
                let version = coerce_version(&self.version)
                    .map_err(|e| format!("version \"{}\" is not semantic: {e}", self.version))?;
                if req.matches(&version) {
                    Ok(())
                } else {
                    Err(format!("version {} is outside required range {req}", self.version))
                }
            }
            (VersionSpec::Range(req), method) => Err(format!(
                "{method} \"{}\" cannot satisfy version range {req}",
                self.version
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_v_prefix() {
        assert_eq!(normalize_version_tag("v1.2.3"), "1.2.3");
        assert_eq!(normalize_version_tag("1.2.3"), "1.2.3");
        assert_eq!(normalize_version_tag("various"), "various");
    }

    #[test]
    fn coerces_short_versions() {
        assert_eq!(coerce_version("1.0").unwrap(), semver::Version::new(1, 0, 0));
        assert_eq!(coerce_version("v2").unwrap(), semver::Version::new(2, 0, 0));
        assert!(coerce_version("not-a-version").is_err());
    }

    #[test]
    fn sorts_tags_ascending() {
        let tags = sorted_version_tags(["v2.0.0", "0.9.0", "1.0.0", "feature-branch"]);
        assert_eq!(tags, vec!["0.9.0", "1.0.0", "v2.0.0"]);
    }

    #[test]
    fn parses_specs() {
        assert_eq!(VersionSpec::parse("*").unwrap(), VersionSpec::Any);
        assert_eq!(VersionSpec::parse("").unwrap(), VersionSpec::Any);
        assert!(matches!(
            VersionSpec::parse("branch=topic/fix").unwrap(),
            VersionSpec::Branch(b) if b == "topic/fix"
        ));
        assert!(matches!(VersionSpec::parse(">=1.0.0, <2.0.0").unwrap(), VersionSpec::Range(_)));
        assert!(VersionSpec::parse(">=not.a.version").is_err());
    }

    #[test]
    fn tag_versions_match_ranges() {
        let v = PackageVersion::new(TrackingMethod::Version, "v2.0.0");
        assert!(v.fulfills(">=1.0.0").is_ok());
        assert!(v.fulfills(">=1.0.0,<2.0.0").is_err());
        assert!(v.fulfills("=2.0.0").is_ok());
        assert!(v.fulfills("*").is_ok());
    }

    #[test]
    fn branch_versions_only_match_same_branch() {
        let v = PackageVersion::new(TrackingMethod::Branch, "main");
        assert!(v.fulfills("branch=main").is_ok());
        assert!(v.fulfills("branch=dev").is_err());
        assert!(v.fulfills(">=1.0.0").is_err());
        assert!(v.fulfills("*").is_ok());
    }

    #[test]
    fn commit_versions_match_only_wildcard() {
        let v = PackageVersion::new(TrackingMethod::Commit, "abc123def456789a");
        assert!(v.fulfills("*").is_ok());
        assert!(v.fulfills(">=1.0.0").is_err());
        assert!(v.fulfills("branch=main").is_err());
    }

    #[test]
    fn commit_detection() {
        assert!(looks_like_commit("0123456789abcdef0123456789abcdef01234567"));
        assert!(looks_like_commit("abc1234"));
        assert!(!looks_like_commit("main"));
        assert!(!looks_like_commit("v1.0.0"));
    }
}
