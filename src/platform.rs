//! Discovery of the host analysis platform.
//!
//! The engine never links against the platform; it shells out to the
//! platform's configuration tool (`zeek-config`) for version and path
//! information, and to the platform binary's `--build-info` output for the
//! table of built-in capabilities (packages the platform ships with and
//! can satisfy without a clone).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// One built-in capability the platform advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinCapability {
    pub name: String,
    pub version: String,
    pub commit: Option<String>,
}

/// Everything discovered about the host platform.
#[derive(Debug, Clone, Default)]
pub struct PlatformInfo {
    /// Platform version, when a configuration tool was found.
    pub version: Option<String>,
    /// `--site_dir`: where site scripts live.
    pub site_dir: Option<PathBuf>,
    /// `--plugin_dir`: where plugins live.
    pub plugin_dir: Option<PathBuf>,
    /// `--zeek_dist`: the source distribution path.
    pub zeek_dist: Option<PathBuf>,
    /// `--zeekpath`: the script search path.
    pub zeekpath: Option<String>,
    /// Built-in capabilities keyed by name.
    pub capabilities: BTreeMap<String, BuiltinCapability>,
}

/// Versions reported by `--build-info` can carry a `-N` commit-count
/// suffix (`1.4.2-68` meaning 68 commits past 1.4.2); strip it, leaving
/// real prerelease suffixes like `-rc1` alone.
static COMMIT_COUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]+\.[0-9]+\.[0-9]+)-[0-9]+$").expect("static regex"));

#[derive(Deserialize)]
struct BuildInfo {
    zkg: Option<BuildInfoZkg>,
}

#[derive(Deserialize)]
struct BuildInfoZkg {
    provides: Option<Vec<BuildInfoProvides>>,
}

#[derive(Deserialize)]
struct BuildInfoProvides {
    name: Option<String>,
    version: Option<String>,
    commit: Option<String>,
}

impl PlatformInfo {
    /// Construct directly; used by tests and by callers that already know
    /// the platform facts.
    pub fn from_parts(
        version: Option<String>,
        capabilities: impl IntoIterator<Item = BuiltinCapability>,
    ) -> Self {
        Self {
            version,
            capabilities: capabilities
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect(),
            ..Default::default()
        }
    }

    /// Probe the host for `zeek-config` and the platform binary.
    ///
    /// Absence of the platform is not an error: the result simply carries
    /// no version and no capabilities, and resolution of platform-version
    /// dependencies will report that fact.
    pub async fn discover() -> Self {
        let mut info = Self::default();

        let Some(output) = run_tool(
            "zeek-config",
            &["--version", "--site_dir", "--plugin_dir", "--zeek_dist", "--zeekpath"],
        )
        .await
        else {
            warn!("no \"zeek-config\" found in PATH; platform version unknown");
            return info;
        };

        let mut lines = output.lines();
        info.version = lines.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        info.site_dir = next_path(&mut lines);
        info.plugin_dir = next_path(&mut lines);
        info.zeek_dist = next_path(&mut lines);
        info.zeekpath = lines.next().map(|s| s.trim().to_string());

        debug!(version = ?info.version, "discovered platform");
        info.capabilities = discover_capabilities().await;
        info
    }
}

fn next_path(lines: &mut std::str::Lines<'_>) -> Option<PathBuf> {
    lines
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

async fn run_tool(program: &str, args: &[&str]) -> Option<String> {
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        Command::new(program).args(args).output(),
    )
    .await;

    match result {
        Ok(Ok(output)) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(Ok(output)) => {
            debug!(%program, code = ?output.status.code(), "tool exited non-zero");
            None
        }
        Ok(Err(e)) => {
            debug!(%program, error = %e, "tool not runnable");
            None
        }
        Err(_) => {
            warn!(%program, "tool timed out");
            None
        }
    }
}

/// Query `zeek --build-info` for the `zkg.provides` capability table.
async fn discover_capabilities() -> BTreeMap<String, BuiltinCapability> {
    let mut capabilities = BTreeMap::new();

    let Some(output) = run_tool("zeek", &["--build-info"]).await else {
        info!("unable to discover built-in packages (requires Zeek 6.0 or later)");
        return capabilities;
    };

    let parsed: BuildInfo = match serde_json::from_str(&output) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "unable to parse platform build info");
            return capabilities;
        }
    };

    let Some(provides) = parsed.zkg.and_then(|z| z.provides) else {
        warn!("missing zkg.provides entry in platform build info");
        return capabilities;
    };

    for entry in provides {
        let (Some(name), Some(version)) = (entry.name, entry.version) else {
            warn!("capability entry missing name or version");
            continue;
        };
        let version = match COMMIT_COUNT_RE.captures(&version) {
            Some(caps) => caps[1].to_string(),
            None => version,
        };
        debug!(%name, %version, "found built-in package");
        capabilities.insert(
            name.clone(),
            BuiltinCapability {
                name,
                version,
                commit: entry.commit,
            },
        );
    }

    capabilities
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_count_suffix_is_stripped() {
        assert_eq!(&COMMIT_COUNT_RE.captures("1.4.2-68").unwrap()[1], "1.4.2");
        assert!(COMMIT_COUNT_RE.captures("1.4.2-rc1").is_none());
        assert!(COMMIT_COUNT_RE.captures("1.4.2").is_none());
    }

    #[test]
    fn from_parts_indexes_capabilities() {
        let info = PlatformInfo::from_parts(
            Some("6.0.1".into()),
            [BuiltinCapability {
                name: "spicy-plugin".into(),
                version: "1.4.2".into(),
                commit: None,
            }],
        );
        assert!(info.capabilities.contains_key("spicy-plugin"));
        assert_eq!(info.version.as_deref(), Some("6.0.1"));
    }
}
