//! The package object: identity, status, and resolution-time info.
//!
//! A package has three names: its canonical *qualified name*
//! (`source/author_path/short_name`, or the raw git URL when installed
//! outside any source), its *short name* (last URL path component), and any
//! *aliases* declared in metadata. Aliases must stay globally unique across
//! installed packages.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::meta::PackageMetadata;
use crate::version::{PackageVersion, TrackingMethod};

/// URL scheme marking packages satisfied by the platform itself.
pub const BUILTIN_SCHEME: &str = "builtin://";
/// Synthetic source name for built-in capability packages.
pub const BUILTIN_SOURCE: &str = "zeek-builtin";

/// Magic marker file announcing a plugin directory to the platform.
pub const PLUGIN_MAGIC_FILE: &str = "__zeek_plugin__";
pub const PLUGIN_MAGIC_FILE_DISABLED: &str = "__zeek_plugin__.disabled";
/// Pre-6.1 marker name, still recognized.
pub const LEGACY_PLUGIN_MAGIC_FILE: &str = "__bro_plugin__";
pub const LEGACY_PLUGIN_MAGIC_FILE_DISABLED: &str = "__bro_plugin__.disabled";

/// Names that can never be package short names.
const RESERVED_NAMES: [&str; 6] = ["zeek", "bro", "zkg", "bro-pkg", "package", "packages"];

/// Strip trailing slashes from a URL or path.
fn remove_trailing_slashes(path: &str) -> &str {
    path.trim_end_matches('/')
}

/// The short name of a package: the last path component of its URL.
pub fn name_from_path(path: &str) -> String {
    remove_trailing_slashes(path)
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Normalize user-supplied package paths/URLs for lookup.
pub fn canonical_url(path: &str) -> String {
    remove_trailing_slashes(path.trim()).to_string()
}

/// Whether a short name is usable for a package.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !RESERVED_NAMES.contains(&name)
        && !name.starts_with('.')
        && !name.contains('/')
}

/// Whether a name is reserved for the platform or the manager.
pub fn is_reserved_name(name: &str) -> bool {
    matches!(name, "zeek" | "bro" | "zkg" | "bro-pkg")
}

/// Core identity of a package, persisted in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// The git URL uniquely identifying where the package lives.
    pub git_url: String,
    /// Short name: last component of the git URL path.
    pub name: String,
    /// Source this package came from; empty when installed from a raw URL.
    #[serde(default)]
    pub source: String,
    /// Directory within the source's index tree naming this package, e.g.
    /// `alice` for a package listed in `alice/zkg.index`.
    #[serde(default)]
    pub directory: String,
    /// Metadata snapshot the manifest remembers independently of the clone.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Package {
    pub fn from_url(git_url: impl Into<String>) -> Self {
        let git_url = canonical_url(&git_url.into());
        let name = name_from_path(&git_url);
        Self {
            git_url,
            name,
            source: String::new(),
            directory: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn from_source(
        git_url: impl Into<String>,
        source: impl Into<String>,
        directory: impl Into<String>,
    ) -> Self {
        let mut pkg = Self::from_url(git_url);
        pkg.source = source.into();
        pkg.directory = directory.into();
        pkg
    }

    /// Whether this package is a built-in platform capability rather than
    /// an installable repository.
    pub fn is_builtin(&self) -> bool {
        self.git_url.starts_with(BUILTIN_SCHEME)
    }

    /// The package's path within its source: `directory/name` or just the
    /// name when the index sits at the source root.
    pub fn module_path(&self) -> String {
        if self.directory.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.directory, self.name)
        }
    }

    /// The shortest name that fully qualifies the package:
    /// `source/module_path` when it came from a source, else the git URL.
    pub fn qualified_name(&self) -> String {
        if !self.source.is_empty() {
            format!("{}/{}", self.source, self.module_path())
        } else {
            self.git_url.clone()
        }
    }

    /// Whether `path` refers to this package: exact short name, any suffix
    /// of the qualified name on a path-component boundary, or the full URL.
    pub fn matches_path(&self, path: &str) -> bool {
        let path = canonical_url(path);
        if path == self.git_url || path == self.name {
            return true;
        }
        let qualified = self.qualified_name();
        qualified == path || qualified.ends_with(&format!("/{path}"))
    }

    /// Aliases declared in the remembered metadata snapshot.
    pub fn aliases(&self) -> Vec<String> {
        PackageMetadata::from_fields(self.metadata.clone()).aliases()
    }

    /// Typed view over the remembered metadata snapshot.
    pub fn metadata_record(&self) -> PackageMetadata {
        PackageMetadata::from_fields(self.metadata.clone())
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified_name())
    }
}

/// Mutable status of an installed package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageStatus {
    #[serde(default)]
    pub is_loaded: bool,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub is_outdated: bool,
    pub tracking_method: Option<TrackingMethod>,
    #[serde(default)]
    pub current_version: String,
    #[serde(default)]
    pub current_hash: String,
}

impl PackageStatus {
    /// The installed version together with its tracking method.
    pub fn package_version(&self) -> Option<PackageVersion> {
        self.tracking_method
            .map(|m| PackageVersion::new(m, self.current_version.clone()))
    }
}

/// A package the manifest records as installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub package: Package,
    pub status: PackageStatus,
}

impl InstalledPackage {
    pub fn is_builtin(&self) -> bool {
        self.package.is_builtin()
    }

    /// Check the installed version against a constraint string.
    pub fn fulfills(&self, spec: &str) -> Result<(), String> {
        match self.status.package_version() {
            Some(v) => v.fulfills(spec),
            None => Err("package has no recorded version".to_string()),
        }
    }
}

/// Everything the resolver needs to know about one package candidate:
/// identity, metadata at the version under consideration, the available
/// version tags, and the default branch.
#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub package: Package,
    pub status: Option<PackageStatus>,
    pub metadata: PackageMetadata,
    /// Version tags, sorted ascending.
    pub versions: Vec<String>,
    pub default_branch: String,
    /// The version whose metadata was snapshotted.
    pub metadata_version: String,
}

impl PackageInfo {
    /// The version an unconstrained request resolves to: the highest tag,
    /// else the default branch.
    pub fn best_version(&self) -> String {
        self.versions
            .last()
            .cloned()
            .unwrap_or_else(|| self.default_branch.clone())
    }

    /// The tracking method a given version string implies for this package.
    pub fn version_kind(&self, version: &str) -> TrackingMethod {
        if self.versions.iter().any(|v| v == version) {
            TrackingMethod::Version
        } else if crate::version::looks_like_commit(version) {
            TrackingMethod::Commit
        } else {
            TrackingMethod::Branch
        }
    }

    /// Parsed `depends`; `Err` carries the malformed line.
    pub fn depends(&self) -> Result<Vec<(String, String)>, String> {
        self.metadata.depends()
    }

    /// Parsed `suggests`.
    pub fn suggests(&self) -> Result<Vec<(String, String)>, String> {
        self.metadata.suggests()
    }
}

/// Build the [`PackageInfo`] for a built-in platform capability.
pub fn make_builtin_package(name: &str, version: &str, commit: Option<&str>) -> PackageInfo {
    let package = Package {
        git_url: format!("{BUILTIN_SCHEME}{name}"),
        name: name.to_string(),
        source: BUILTIN_SOURCE.to_string(),
        directory: String::new(),
        metadata: BTreeMap::new(),
    };
    let status = PackageStatus {
        is_loaded: true,
        is_pinned: false,
        is_outdated: false,
        tracking_method: Some(TrackingMethod::Version),
        current_version: version.to_string(),
        current_hash: commit.unwrap_or_default().to_string(),
    };
    PackageInfo {
        package,
        status: Some(status),
        metadata: PackageMetadata::default(),
        versions: vec![version.to_string()],
        default_branch: String::new(),
        metadata_version: version.to_string(),
    }
}
