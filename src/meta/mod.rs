//! Package metadata model.
//!
//! Every package carries an INI metadata file at its repository root. Two
//! file names are accepted for backward compatibility, `zkg.meta`
//! (preferred) and the legacy `bro-pkg.meta`, and the file must begin with
//! a `[package]` section. Parsing produces a [`PackageMetadata`] record;
//! anything structurally wrong fails with a `BadMetadata` error naming the
//! offending field.
//!
//! Values may contain `%(name)s` references which are resolved lazily via
//! [`PackageMetadata::interpolated`] against the engine's substitution pool
//! (user vars, config paths, `zeek_dist`, per-package `package_base`).

pub mod ini;
pub mod uservar;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::ZkgError;
use ini::Ini;
use uservar::UserVar;

/// Preferred metadata file name.
pub const METADATA_FILENAME: &str = "zkg.meta";
/// Legacy metadata file name, still accepted.
pub const LEGACY_METADATA_FILENAME: &str = "bro-pkg.meta";

/// Names reserved for the analysis platform itself in `depends` entries.
pub const PLATFORM_DEP_NAMES: [&str; 2] = ["zeek", "bro"];
/// Names reserved for the package manager itself in `depends` entries.
pub const MANAGER_DEP_NAMES: [&str; 2] = ["zkg", "bro-pkg"];

/// Fields the engine knows about; anything else in `[package]` is
/// tolerated but reported as a warning by template validation.
const KNOWN_FIELDS: [&str; 15] = [
    "description",
    "tags",
    "credits",
    "aliases",
    "script_dir",
    "plugin_dir",
    "build_command",
    "test_command",
    "config_files",
    "executables",
    "user_vars",
    "depends",
    "suggests",
    "external_depends",
    "version",
];

/// What a `depends` entry names, before resolution.
///
/// Reserved names resolve against runtime-known versions rather than any
/// package; everything else is a package short name or git URL. Whether a
/// package name is ultimately satisfied by a built-in platform capability
/// is decided during resolution, not parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyName {
    /// `zeek` / `bro`: the analysis platform's own version.
    Platform,
    /// `zkg` / `bro-pkg`: the package manager's own version.
    Manager,
    /// A package short name or git URL.
    Package(String),
}

/// Classify a dependency name into its reserved or package form.
pub fn classify_dependency(name: &str) -> DependencyName {
    if PLATFORM_DEP_NAMES.contains(&name) {
        DependencyName::Platform
    } else if MANAGER_DEP_NAMES.contains(&name) {
        DependencyName::Manager
    } else {
        DependencyName::Package(name.to_string())
    }
}

/// Template provenance recorded in a created package's metadata.
///
/// Allows re-running instantiation with identical inputs later.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRecord {
    /// Template source repo (URL or name).
    pub source: String,
    /// Resolved template version (tag, branch, or commit).
    pub version: String,
    /// Engine version that performed the instantiation.
    pub zkg_version: String,
    /// Selected features, sorted.
    pub features: Vec<String>,
    /// Supplied variable values.
    pub vars: BTreeMap<String, String>,
}

/// Pick the metadata file in a package directory, preferring the newer name.
pub fn pick_metadata_file(dir: &Path) -> PathBuf {
    let modern = dir.join(METADATA_FILENAME);
    if modern.exists() {
        return modern;
    }
    let legacy = dir.join(LEGACY_METADATA_FILENAME);
    if legacy.exists() {
        return legacy;
    }
    modern
}

/// The parsed (raw, uninterpolated) metadata record of one package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadata {
    fields: BTreeMap<String, String>,
}

impl PackageMetadata {
    pub fn from_fields(fields: BTreeMap<String, String>) -> Self {
        Self { fields }
    }

    /// Parse the metadata file at a package root.
    ///
    /// # Errors
    ///
    /// [`ZkgError::BadMetadata`] when the file is missing, unparseable, or
    /// lacks the leading `[package]` section.
    pub fn parse_dir(dir: &Path, package: &str) -> crate::core::Result<Self> {
        let file = pick_metadata_file(dir);
        if !file.exists() {
            return Err(ZkgError::bad_metadata(
                package,
                format!("missing metadata file ({METADATA_FILENAME} or {LEGACY_METADATA_FILENAME})"),
            )
            .into());
        }
        let ini = Ini::parse_file(&file, false)
            .map_err(|reason| ZkgError::bad_metadata(package, reason))?;
        let section = ini.section("package").ok_or_else(|| {
            ZkgError::bad_metadata(package, "metadata file lacks a [package] section")
        })?;
        let mut meta = Self {
            fields: section.to_map(),
        };

        // A [template] section in the file carries provenance; fold it into
        // the record so the manifest remembers it past clone removal.
        if let Some(record) = template_record_from_ini(&ini) {
            meta.fields
                .insert("template".to_string(), serde_json::to_string(&record).unwrap_or_default());
        }

        Ok(meta)
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn description(&self) -> &str {
        self.get("description").unwrap_or_default()
    }

    /// Comma-separated classification tags.
    pub fn tags(&self) -> Vec<String> {
        split_csv(self.get("tags").unwrap_or_default())
    }

    pub fn credits(&self) -> &str {
        self.get("credits").unwrap_or_default()
    }

    /// Alternate short names this package answers to.
    pub fn aliases(&self) -> Vec<String> {
        split_csv(self.get("aliases").unwrap_or_default())
    }

    /// Declared script directory, if any. An absent field means the package
    /// root itself may act as an implicit script dir.
    pub fn script_dir(&self) -> Option<&str> {
        self.get("script_dir")
    }

    /// Declared plugin directory; defaults to `build`.
    pub fn plugin_dir(&self) -> &str {
        self.get("plugin_dir").unwrap_or("build")
    }

    /// Whether `plugin_dir` was declared explicitly (affects whether a
    /// missing directory is an error or just unusual).
    pub fn plugin_dir_declared(&self) -> bool {
        self.fields.contains_key("plugin_dir")
    }

    pub fn build_command(&self) -> Option<&str> {
        self.get("build_command").filter(|s| !s.is_empty())
    }

    pub fn test_command(&self) -> Option<&str> {
        self.get("test_command").filter(|s| !s.is_empty())
    }

    /// Whitespace-separated executables, as paths relative to the clone.
    pub fn executables(&self) -> Vec<String> {
        self.get("executables")
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    /// Comma-separated config files, as paths relative to the clone.
    pub fn config_files(&self) -> Vec<String> {
        split_csv(self.get("config_files").unwrap_or_default())
    }

    /// Parse the `depends` field into (name, constraint) pairs.
    ///
    /// Each line is `name SPEC`; a bare name implies `*`. Returns `Err`
    /// naming the malformed line.
    pub fn depends(&self) -> Result<Vec<(String, String)>, String> {
        parse_dependency_field(self.get("depends").unwrap_or_default())
    }

    /// Parse the `suggests` field, same shape as `depends`.
    pub fn suggests(&self) -> Result<Vec<(String, String)>, String> {
        parse_dependency_field(self.get("suggests").unwrap_or_default())
    }

    /// Parse `external_depends` (tools outside the package system); kept as
    /// informational pairs, never resolved.
    pub fn external_depends(&self) -> Result<Vec<(String, String)>, String> {
        parse_dependency_field(self.get("external_depends").unwrap_or_default())
    }

    /// Declared user variables. `None` means the field is present but
    /// malformed.
    pub fn user_vars(&self) -> Option<Vec<UserVar>> {
        match self.get("user_vars") {
            None => Some(Vec::new()),
            Some(text) => UserVar::parse_field(text),
        }
    }

    /// The recorded template provenance, if the package was created from a
    /// template.
    pub fn template_record(&self) -> Option<TemplateRecord> {
        self.get("template")
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    /// Fields in `[package]` the engine does not recognize.
    pub fn unknown_fields(&self) -> Vec<&str> {
        self.fields
            .keys()
            .map(String::as_str)
            .filter(|k| *k != "template" && !KNOWN_FIELDS.contains(k))
            .collect()
    }

    /// Resolve every `%(name)s` reference against `pool`, returning a new
    /// record. Failure names the unresolved reference or cycle.
    pub fn interpolated(&self, pool: &BTreeMap<String, String>) -> Result<Self, String> {
        let mut fields = BTreeMap::new();
        for (key, value) in &self.fields {
            let resolved = ini::interpolate(value, pool)
                .map_err(|e| format!("field '{key}': {e}"))?;
            fields.insert(key.clone(), resolved);
        }
        Ok(Self { fields })
    }
}

/// Parse a multi-line dependency field into (name, constraint) pairs.
fn parse_dependency_field(text: &str) -> Result<Vec<(String, String)>, String> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(char::is_whitespace) {
            Some((name, spec)) => {
                let spec = spec.trim();
                if spec.is_empty() {
                    out.push((name.to_string(), "*".to_string()));
                } else {
                    out.push((name.to_string(), spec.to_string()));
                }
            }
            None => {
                // A lone token with an embedded constraint ("bar=1.0.0")
                // is a missing separator, not a package name.
                if line.contains('=') && !line.contains("://") && !line.starts_with("git@") {
                    return Err(format!(
                        "malformed dependency line \"{line}\" (expected \"name constraint\")"
                    ));
                }
                out.push((line.to_string(), "*".to_string()));
            }
        }
    }
    Ok(out)
}

fn split_csv(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Extract a [`TemplateRecord`] from `[template]`/`[template_vars]`
/// sections of a metadata INI, if present.
pub fn template_record_from_ini(ini: &Ini) -> Option<TemplateRecord> {
    let section = ini.section("template")?;
    let mut record = TemplateRecord {
        source: section.get("source").unwrap_or_default().to_string(),
        version: section.get("version").unwrap_or_default().to_string(),
        zkg_version: section.get("zkg_version").unwrap_or_default().to_string(),
        features: split_csv(section.get("features").unwrap_or_default()),
        vars: BTreeMap::new(),
    };
    if let Some(vars) = ini.section("template_vars") {
        record.vars = vars.to_map();
    }
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_meta(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    const SAMPLE: &str = "\
[package]
description = Detect the frobnicator
tags = detection, frobnication
aliases = frob, frobnicate
script_dir = scripts
build_command = ./configure --root=%(FROB_ROOT)s && make
test_command = btest -c btest.cfg
executables = bin/frobctl
config_files = scripts/config.zeek
user_vars =
\tFROB_ROOT [/usr] \"Frobnicator install root\"
depends =
\tzeek >=5.0.0
\tbar >=1.0.0,<2.0.0
\thttps://example.com/baz branch=dev
";

    #[test]
    fn parses_modern_file() {
        let dir = tempfile::tempdir().unwrap();
        write_meta(dir.path(), METADATA_FILENAME, SAMPLE);
        let meta = PackageMetadata::parse_dir(dir.path(), "frob").unwrap();

        assert_eq!(meta.description(), "Detect the frobnicator");
        assert_eq!(meta.aliases(), vec!["frob", "frobnicate"]);
        assert_eq!(meta.script_dir(), Some("scripts"));
        assert_eq!(meta.plugin_dir(), "build");
        assert!(!meta.plugin_dir_declared());
        assert_eq!(meta.executables(), vec!["bin/frobctl"]);

        let deps = meta.depends().unwrap();
        assert_eq!(deps[0], ("zeek".to_string(), ">=5.0.0".to_string()));
        assert_eq!(deps[1], ("bar".to_string(), ">=1.0.0,<2.0.0".to_string()));
        assert_eq!(
            deps[2],
            ("https://example.com/baz".to_string(), "branch=dev".to_string())
        );
    }

    #[test]
    fn prefers_modern_over_legacy() {
        let dir = tempfile::tempdir().unwrap();
        write_meta(dir.path(), LEGACY_METADATA_FILENAME, "[package]\ndescription = old\n");
        write_meta(dir.path(), METADATA_FILENAME, "[package]\ndescription = new\n");
        let meta = PackageMetadata::parse_dir(dir.path(), "p").unwrap();
        assert_eq!(meta.description(), "new");
    }

    #[test]
    fn accepts_legacy_alone() {
        let dir = tempfile::tempdir().unwrap();
        write_meta(dir.path(), LEGACY_METADATA_FILENAME, "[package]\ndescription = old\n");
        let meta = PackageMetadata::parse_dir(dir.path(), "p").unwrap();
        assert_eq!(meta.description(), "old");
    }

    #[test]
    fn missing_package_section_is_bad_metadata() {
        let dir = tempfile::tempdir().unwrap();
        write_meta(dir.path(), METADATA_FILENAME, "[other]\nkey = value\n");
        let err = PackageMetadata::parse_dir(dir.path(), "p").unwrap_err();
        let err = err.downcast::<ZkgError>().unwrap();
        assert!(matches!(err, ZkgError::BadMetadata { .. }));
    }

    #[test]
    fn missing_file_is_bad_metadata() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PackageMetadata::parse_dir(dir.path(), "p").is_err());
    }

    #[test]
    fn missing_constraint_separator_is_malformed() {
        let mut fields = BTreeMap::new();
        fields.insert("depends".to_string(), "bar=1.0.0".to_string());
        let meta = PackageMetadata::from_fields(fields);
        let err = meta.depends().unwrap_err();
        assert!(err.contains("bar=1.0.0"));
    }

    #[test]
    fn classification_of_reserved_names() {
        assert_eq!(classify_dependency("zeek"), DependencyName::Platform);
        assert_eq!(classify_dependency("bro"), DependencyName::Platform);
        assert_eq!(classify_dependency("zkg"), DependencyName::Manager);
        assert_eq!(classify_dependency("bro-pkg"), DependencyName::Manager);
        assert_eq!(
            classify_dependency("spicy-plugin"),
            DependencyName::Package("spicy-plugin".to_string())
        );
    }

    #[test]
    fn interpolation_applies_to_all_fields() {
        let dir = tempfile::tempdir().unwrap();
        write_meta(dir.path(), METADATA_FILENAME, SAMPLE);
        let meta = PackageMetadata::parse_dir(dir.path(), "frob").unwrap();

        let mut pool = BTreeMap::new();
        pool.insert("FROB_ROOT".to_string(), "/home/x/sandbox".to_string());
        let resolved = meta.interpolated(&pool).unwrap();
        assert_eq!(
            resolved.build_command().unwrap(),
            "./configure --root=/home/x/sandbox && make"
        );
    }

    #[test]
    fn interpolation_failure_names_the_field() {
        let dir = tempfile::tempdir().unwrap();
        write_meta(dir.path(), METADATA_FILENAME, SAMPLE);
        let meta = PackageMetadata::parse_dir(dir.path(), "frob").unwrap();
        let err = meta.interpolated(&BTreeMap::new()).unwrap_err();
        assert!(err.contains("build_command"));
        assert!(err.contains("FROB_ROOT"));
    }

    #[test]
    fn unknown_fields_surface() {
        let mut fields = BTreeMap::new();
        fields.insert("description".to_string(), "d".to_string());
        fields.insert("bogus_field".to_string(), "x".to_string());
        let meta = PackageMetadata::from_fields(fields);
        assert_eq!(meta.unknown_fields(), vec!["bogus_field"]);
    }
}
