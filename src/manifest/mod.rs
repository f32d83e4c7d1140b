//! The manifest store: persistent record of installed packages.
//!
//! A single JSON file (`manifest.json` in the state directory) holds a
//! schema version, the stage directories it was written against, and one
//! entry per installed package (identity, resolved version and tracking
//! method, loaded/pinned state, and the metadata snapshot the engine must
//! remember independently of the clone).
//!
//! Writes are atomic (write-temp-then-rename) and happen exactly once per
//! operation, at the end of a successful plan. Reads migrate older schema
//! versions forward; schema version 0 stored entries under
//! `package_dict`/`status_dict` keys, which the loader still understands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::fsutil;
use crate::core::ZkgError;
use crate::package::InstalledPackage;

/// Current manifest schema version.
pub const MANIFEST_VERSION: u32 = 1;

/// The persisted manifest envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub manifest_version: u32,
    pub script_dir: PathBuf,
    pub plugin_dir: PathBuf,
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,
    pub installed_packages: Vec<InstalledPackage>,
}

impl Manifest {
    /// An empty manifest for a fresh state directory.
    pub fn empty(script_dir: &Path, plugin_dir: &Path, bin_dir: &Path) -> Self {
        Self {
            manifest_version: MANIFEST_VERSION,
            script_dir: script_dir.to_path_buf(),
            plugin_dir: plugin_dir.to_path_buf(),
            bin_dir: Some(bin_dir.to_path_buf()),
            installed_packages: Vec::new(),
        }
    }

    /// Load a manifest, migrating older schemas.
    ///
    /// # Errors
    ///
    /// [`ZkgError::Manifest`] when the file is unreadable, not JSON, or
    /// written by a newer engine.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read manifest {}", path.display()))?;
        let raw: Value = serde_json::from_str(&content).map_err(|e| ZkgError::Manifest {
            file: path.display().to_string(),
            reason: format!("not valid JSON: {e}"),
        })?;

        let version = raw
            .get("manifest_version")
            .and_then(Value::as_u64)
            .ok_or_else(|| ZkgError::Manifest {
                file: path.display().to_string(),
                reason: "missing manifest_version".to_string(),
            })? as u32;

        if version > MANIFEST_VERSION {
            return Err(ZkgError::Manifest {
                file: path.display().to_string(),
                reason: format!(
                    "schema version {version} is newer than supported version {MANIFEST_VERSION}"
                ),
            }
            .into());
        }

        let migrated = if version < MANIFEST_VERSION {
            debug!(from = version, to = MANIFEST_VERSION, "migrating manifest schema");
            migrate(raw, version).map_err(|reason| ZkgError::Manifest {
                file: path.display().to_string(),
                reason,
            })?
        } else {
            raw
        };

        serde_json::from_value(migrated)
            .map_err(|e| {
                ZkgError::Manifest {
                    file: path.display().to_string(),
                    reason: format!("unreadable manifest shape: {e}"),
                }
                .into()
            })
    }

    /// Persist atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fsutil::atomic_write(path, json.as_bytes())
    }

    pub fn find(&self, name: &str) -> Option<&InstalledPackage> {
        self.installed_packages
            .iter()
            .find(|p| p.package.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut InstalledPackage> {
        self.installed_packages
            .iter_mut()
            .find(|p| p.package.name == name)
    }

    /// Insert or replace by short name, keeping entries sorted for
    /// reproducible serialization.
    pub fn upsert(&mut self, entry: InstalledPackage) {
        self.installed_packages
            .retain(|p| p.package.name != entry.package.name);
        self.installed_packages.push(entry);
        self.installed_packages
            .sort_by(|a, b| a.package.name.cmp(&b.package.name));
    }

    pub fn remove(&mut self, name: &str) -> Option<InstalledPackage> {
        let idx = self
            .installed_packages
            .iter()
            .position(|p| p.package.name == name)?;
        Some(self.installed_packages.remove(idx))
    }
}

/// Bring an older on-disk representation up to the current schema.
fn migrate(mut raw: Value, version: u32) -> Result<Value, String> {
    if version == 0 {
        // v0 wrapped each entry as {"package_dict": {...}, "status_dict":
        // {...}} and package dicts could carry a since-removed index_data
        // blob.
        let entries = raw
            .get_mut("installed_packages")
            .and_then(Value::as_array_mut)
            .ok_or("missing installed_packages list")?;
        for entry in entries.iter_mut() {
            let obj = entry.as_object_mut().ok_or("entry is not an object")?;
            let mut package = obj
                .remove("package_dict")
                .ok_or("v0 entry lacks package_dict")?;
            let status = obj.remove("status_dict").ok_or("v0 entry lacks status_dict")?;
            if let Some(pkg) = package.as_object_mut() {
                pkg.remove("index_data");
            }
            obj.insert("package".to_string(), package);
            obj.insert("status".to_string(), status);
        }
        raw["manifest_version"] = Value::from(MANIFEST_VERSION);
    }
    Ok(raw)
}
