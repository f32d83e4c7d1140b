//! User configuration: the INI file driving the engine.
//!
//! Sections:
//!
//! - `[sources]`: name to git URL of package sources
//! - `[paths]`: `state_dir`, `script_dir`, `plugin_dir`, `bin_dir`,
//!   `zeek_dist`
//! - `[user_vars]`: persisted answers to package user variables
//! - `[templates]`: `default` template URL override
//!
//! `[paths]` values may reference each other with `%(name)s`; references
//! are resolved at load time against the section itself plus `HOME`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::fsutil;
use crate::core::ZkgError;
use crate::meta::ini::{self, Ini};

/// Environment variable overriding the default template URL.
pub const DEFAULT_TEMPLATE_ENV: &str = "ZKG_DEFAULT_TEMPLATE";
/// Fallback template used by `create` when nothing else is configured.
pub const DEFAULT_TEMPLATE_URL: &str = "https://github.com/zeek/package-template";

/// Parsed user configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Package sources by name.
    pub sources: BTreeMap<String, String>,
    pub state_dir: PathBuf,
    pub script_dir: PathBuf,
    pub plugin_dir: PathBuf,
    /// Defaults to `<state_dir>/bin` when unset.
    pub bin_dir: Option<PathBuf>,
    /// Path to the platform source distribution, needed by packages that
    /// build native plugins.
    pub zeek_dist: Option<PathBuf>,
    /// Persisted user-variable answers.
    pub user_vars: BTreeMap<String, String>,
    /// Default template override from `[templates] default=`.
    pub default_template: Option<String>,
}

impl Config {
    /// Load from an INI file.
    ///
    /// # Errors
    ///
    /// [`ZkgError::Config`] on parse failures or unresolvable `%(name)s`
    /// references in `[paths]`.
    pub fn load(path: &Path) -> Result<Self> {
        let ini = Ini::parse_file(path, true)
            .map_err(|reason| ZkgError::Config { reason })?;
        Self::from_ini(&ini)
    }

    /// Build from an already-parsed INI document.
    pub fn from_ini(ini: &Ini) -> Result<Self> {
        let mut config = Self::default();

        if let Some(sources) = ini.section("sources") {
            for (name, url) in sources.iter() {
                config.sources.insert(name.to_string(), url.to_string());
            }
        }

        let mut pool: BTreeMap<String, String> = BTreeMap::new();
        if let Ok(home) = std::env::var("HOME") {
            pool.insert("home".to_string(), home);
        }
        if let Some(paths) = ini.section("paths") {
            for (key, value) in paths.iter() {
                pool.insert(key.to_string(), value.to_string());
            }
            let resolve = |key: &str| -> Result<Option<String>> {
                match paths.get(key) {
                    None => Ok(None),
                    Some(raw) => ini::interpolate(raw, &pool)
                        .map(Some)
                        .map_err(|e| {
                            ZkgError::Config {
                                reason: format!("[paths] {key}: {e}"),
                            }
                            .into()
                        }),
                }
            };

            if let Some(v) = resolve("state_dir")? {
                config.state_dir = PathBuf::from(v);
            }
            if let Some(v) = resolve("script_dir")? {
                config.script_dir = PathBuf::from(v);
            }
            if let Some(v) = resolve("plugin_dir")? {
                config.plugin_dir = PathBuf::from(v);
            }
            if let Some(v) = resolve("bin_dir")? {
                config.bin_dir = Some(PathBuf::from(v));
            }
            if let Some(v) = resolve("zeek_dist")?.or(resolve("bro_dist")?) {
                config.zeek_dist = Some(PathBuf::from(v));
            }
        }

        if let Some(vars) = ini.section("user_vars") {
            for (name, value) in vars.iter() {
                config.user_vars.insert(name.to_string(), value.to_string());
            }
        }

        if let Some(templates) = ini.section("templates") {
            config.default_template = templates.get("default").map(str::to_string);
        }

        config.apply_defaults();
        Ok(config)
    }

    /// Fill unset paths from the conventional home-relative defaults.
    pub fn apply_defaults(&mut self) {
        let home = std::env::var("HOME").map(PathBuf::from).unwrap_or_default();
        if self.state_dir.as_os_str().is_empty() {
            self.state_dir = home.join(".zkg");
        }
        if self.script_dir.as_os_str().is_empty() {
            self.script_dir = self.state_dir.join("script_dir");
        }
        if self.plugin_dir.as_os_str().is_empty() {
            self.plugin_dir = self.state_dir.join("plugin_dir");
        }
    }

    /// The effective bin dir: configured or `<state_dir>/bin`.
    pub fn effective_bin_dir(&self) -> PathBuf {
        self.bin_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("bin"))
    }

    /// The template URL `create` uses when none is given: environment
    /// override, then `[templates] default`, then the stock template.
    pub fn default_template(&self) -> String {
        std::env::var(DEFAULT_TEMPLATE_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.default_template.clone())
            .unwrap_or_else(|| DEFAULT_TEMPLATE_URL.to_string())
    }

    /// Serialize back to INI form.
    pub fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();
        let sources = ini.section_mut("sources");
        for (name, url) in &self.sources {
            sources.set(name.clone(), url.clone());
        }
        let paths = ini.section_mut("paths");
        paths.set("state_dir", self.state_dir.display().to_string());
        paths.set("script_dir", self.script_dir.display().to_string());
        paths.set("plugin_dir", self.plugin_dir.display().to_string());
        if let Some(bin) = &self.bin_dir {
            paths.set("bin_dir", bin.display().to_string());
        }
        if let Some(dist) = &self.zeek_dist {
            paths.set("zeek_dist", dist.display().to_string());
        }
        let vars = ini.section_mut("user_vars");
        for (name, value) in &self.user_vars {
            vars.set(name.clone(), value.clone());
        }
        if let Some(template) = &self.default_template {
            ini.section_mut("templates").set("default", template.clone());
        }
        ini
    }

    /// Persist atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        fsutil::atomic_write(path, self.to_ini().to_string().as_bytes())
    }

    /// Record a user-variable answer for future runs (interactive mode
    /// opt-in; non-interactive runs never call this).
    pub fn persist_user_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.user_vars.insert(name.into(), value.into());
    }
}

/// Generate a configuration by querying the platform's configuration tool.
///
/// Maps `zeek-config` output (`--site_dir`, `--plugin_dir`, `--zeek_dist`)
/// onto `[paths]`; the state dir stays at its home default.
pub fn autoconfig(platform: &crate::platform::PlatformInfo) -> Config {
    let mut config = Config::default();
    if let Some(site_dir) = &platform.site_dir {
        config.script_dir = site_dir.clone();
    }
    if let Some(plugin_dir) = &platform.plugin_dir {
        config.plugin_dir = plugin_dir.clone();
    }
    if let Some(dist) = &platform.zeek_dist {
        config.zeek_dist = Some(dist.clone());
    }
    config.sources.insert(
        "zeek".to_string(),
        "https://github.com/zeek/packages".to_string(),
    );
    config.apply_defaults();
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[sources]
zeek = https://github.com/zeek/packages

[paths]
state_dir = /tmp/zkg-state
script_dir = %(state_dir)s/script_dir
plugin_dir = %(state_dir)s/plugin_dir
zeek_dist = /opt/zeek-src

[user_vars]
LIBRDKAFKA_ROOT = /usr/local
";

    #[test]
    fn loads_and_interpolates_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/tmp/zkg-state"));
        assert_eq!(config.script_dir, PathBuf::from("/tmp/zkg-state/script_dir"));
        assert_eq!(
            config.sources.get("zeek").map(String::as_str),
            Some("https://github.com/zeek/packages")
        );
        assert_eq!(
            config.user_vars.get("LIBRDKAFKA_ROOT").map(String::as_str),
            Some("/usr/local")
        );
        assert_eq!(config.zeek_dist, Some(PathBuf::from("/opt/zeek-src")));
    }

    #[test]
    fn unresolved_path_reference_is_config_error() {
        let ini = Ini::parse("[paths]\nscript_dir = %(nowhere)s/scripts\n", true).unwrap();
        let err = Config::from_ini(&ini).unwrap_err();
        let err = err.downcast::<ZkgError>().unwrap();
        assert!(matches!(err, ZkgError::Config { .. }));
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");

        let mut config = Config::default();
        config.state_dir = PathBuf::from("/tmp/zkg");
        config.apply_defaults();
        config.sources.insert("zeek".into(), "https://example.com/packages".into());
        config.persist_user_var("ANSWER", "42");
        config.save(&path).unwrap();

        let back = Config::load(&path).unwrap();
        assert_eq!(back.sources, config.sources);
        assert_eq!(back.user_vars.get("ANSWER").map(String::as_str), Some("42"));
    }

    #[test]
    fn bin_dir_defaults_under_state_dir() {
        let mut config = Config::default();
        config.state_dir = PathBuf::from("/tmp/zkg");
        assert_eq!(config.effective_bin_dir(), PathBuf::from("/tmp/zkg/bin"));
    }
}
