//! The operation orchestrator: the public API of the engine.
//!
//! A [`Manager`] owns the state directory, the manifest, the configured
//! sources, and a VCS driver, and exposes the package verbs: `refresh`,
//! `list`, `search`, `info`, `install`, `remove`, `purge`, `load`,
//! `unload`, `pin`, `unpin`, `upgrade`, `test`, `bundle`, `unbundle`, and
//! `create`. Multi-package verbs are transactional: they stage into an
//! ephemeral workspace and the real stage plus the manifest flip over only
//! after every package has succeeded, so observers between operations see
//! the pre-plan or post-plan state and never an intermediate.
//!
//! Mutating verbs take the advisory state-directory lock; read-only verbs
//! do not.

mod bundle_ops;
mod install;
mod sources;
mod template_ops;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::fsutil;
use crate::core::ZkgError;
use crate::git::{ensure_clone, Vcs};
use crate::manifest::Manifest;
use crate::meta::PackageMetadata;
use crate::package::{
    canonical_url, make_builtin_package, name_from_path, InstalledPackage, Package, PackageInfo,
    PackageStatus,
};
use crate::platform::PlatformInfo;
use crate::resolver::PackageProvider;
use crate::source::Source;
use crate::stage::{self, Stage, StateLayout};
use crate::version::{sorted_version_tags, TrackingMethod};

pub use install::InstallOptions;

/// The package manager: state directory, manifest, sources, and verbs.
pub struct Manager {
    pub(crate) config: Config,
    pub(crate) layout: StateLayout,
    pub(crate) platform: PlatformInfo,
    pub(crate) vcs: Arc<dyn Vcs>,
    pub(crate) sources: BTreeMap<String, Source>,
    pub(crate) manifest: Manifest,
    /// `--user-var NAME=VALUE` overrides for this invocation.
    pub(crate) user_var_overrides: BTreeMap<String, String>,
}

impl Manager {
    /// Create a manager over a state directory, creating the directory
    /// tree and an empty manifest on first use, and relocating staged
    /// artifacts when the configured stage directories moved since the
    /// manifest was last written.
    pub fn new(config: Config, vcs: Arc<dyn Vcs>, platform: PlatformInfo) -> Result<Self> {
        let layout = StateLayout::new(
            &config.state_dir,
            &config.script_dir,
            &config.plugin_dir,
            &config.effective_bin_dir(),
        );
        layout.create_dirs()?;
        write_readme(&layout.script_packages_dir().join("README"))?;
        write_readme(&layout.plugin_packages_dir().join("README"))?;

        let manifest_path = layout.manifest_path();
        let manifest = if manifest_path.exists() {
            Manifest::load(&manifest_path)?
        } else {
            let manifest = Manifest::empty(
                &layout.script_packages_dir(),
                &layout.plugin_packages_dir(),
                &layout.bin_dir,
            );
            manifest.save(&manifest_path)?;
            manifest
        };

        let mut manager = Self {
            config,
            layout,
            platform,
            vcs,
            sources: BTreeMap::new(),
            manifest,
            user_var_overrides: BTreeMap::new(),
        };

        manager.relocate_stage_dirs()?;
        manager.write_state_files()?;
        Ok(manager)
    }

    /// Set the command-line user-variable overrides for this invocation.
    pub fn set_user_var_overrides(&mut self, overrides: BTreeMap<String, String>) {
        self.user_var_overrides = overrides;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    /// Stage directories recorded in an older manifest may differ from the
    /// configured ones; move the owned `packages/` subtrees over and
    /// remember the new locations.
    fn relocate_stage_dirs(&mut self) -> Result<()> {
        let mut need_update = false;

        let prev_script = self.manifest.script_dir.clone();
        let cur_script = self.layout.script_packages_dir();
        if prev_script != cur_script {
            info!(from = %prev_script.display(), to = %cur_script.display(), "relocating script_dir");
            if prev_script.exists() {
                fsutil::delete_path(&cur_script)?;
                fsutil::make_dir(cur_script.parent().unwrap_or(&cur_script))?;
                std::fs::rename(&prev_script, &cur_script)
                    .with_context(|| "failed to move script packages tree")?;
            }
            // Package and alias symlinks live next to the packages tree.
            let names: Vec<String> = self
                .manifest
                .installed_packages
                .iter()
                .flat_map(|ipkg| {
                    let mut names = vec![ipkg.package.name.clone()];
                    names.extend(ipkg.package.aliases());
                    names
                })
                .collect();
            if let Some(prev_root) = prev_script.parent() {
                for name in names {
                    let old_link = prev_root.join(&name);
                    if std::fs::symlink_metadata(&old_link).is_ok() {
                        fsutil::make_symlink(
                            Path::new("packages").join(&name).as_path(),
                            &self.layout.script_dir.join(&name),
                        )?;
                        fsutil::delete_path(&old_link)?;
                    }
                }
            }
            self.manifest.script_dir = cur_script;
            need_update = true;
        }

        let prev_plugin = self.manifest.plugin_dir.clone();
        let cur_plugin = self.layout.plugin_packages_dir();
        if prev_plugin != cur_plugin {
            info!(from = %prev_plugin.display(), to = %cur_plugin.display(), "relocating plugin_dir");
            if prev_plugin.exists() {
                fsutil::delete_path(&cur_plugin)?;
                fsutil::make_dir(cur_plugin.parent().unwrap_or(&cur_plugin))?;
                std::fs::rename(&prev_plugin, &cur_plugin)
                    .with_context(|| "failed to move plugin packages tree")?;
            }
            self.manifest.plugin_dir = cur_plugin;
            need_update = true;
        }

        let prev_bin = self.manifest.bin_dir.clone();
        if prev_bin.as_deref() != Some(self.layout.bin_dir.as_path()) {
            if let Some(prev_bin) = prev_bin {
                info!(from = %prev_bin.display(), to = %self.layout.bin_dir.display(), "relocating bin_dir");
                self.clear_bin_dir(&prev_bin);
            }
            self.refresh_bin_dir()?;
            self.manifest.bin_dir = Some(self.layout.bin_dir.clone());
            need_update = true;
        }

        if need_update {
            self.manifest.save(&self.layout.manifest_path())?;
        }
        Ok(())
    }

    /// Rewrite the loader index and its `__load__.zeek` symlink from the
    /// current manifest.
    pub(crate) fn write_state_files(&self) -> Result<()> {
        let loaded: Vec<String> = self
            .loaded_packages()
            .into_iter()
            .filter(|ipkg| self.has_scripts(ipkg))
            .map(|ipkg| ipkg.package.name)
            .collect();
        stage::write_autoloader(&self.layout, &loaded)
    }

    /// Persist the manifest. Called exactly once per mutating operation.
    pub(crate) fn save_manifest(&self) -> Result<()> {
        self.manifest.save(&self.layout.manifest_path())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// All installed packages, built-in capabilities included, sorted by
    /// name.
    pub fn installed(&self) -> Vec<InstalledPackage> {
        let mut packages: Vec<InstalledPackage> = self.manifest.installed_packages.clone();
        for capability in self.platform.capabilities.values() {
            let info = make_builtin_package(
                &capability.name,
                &capability.version,
                capability.commit.as_deref(),
            );
            if packages.iter().all(|p| p.package.name != info.package.name) {
                packages.push(InstalledPackage {
                    package: info.package,
                    status: info.status.expect("builtin info carries status"),
                });
            }
        }
        packages.sort_by(|a, b| a.package.name.cmp(&b.package.name));
        packages
    }

    /// Installed packages marked as loaded.
    pub fn loaded_packages(&self) -> Vec<InstalledPackage> {
        self.installed()
            .into_iter()
            .filter(|p| p.status.is_loaded)
            .collect()
    }

    /// Find an installed package by URL, qualified name, short name, or
    /// alias.
    pub fn find_installed_package(&self, pkg_path: &str) -> Option<InstalledPackage> {
        let path = canonical_url(pkg_path);
        let installed = self.installed();
        if let Some(found) = installed.iter().find(|p| p.package.matches_path(&path)) {
            return Some(found.clone());
        }
        let name = name_from_path(&path);
        installed
            .into_iter()
            .find(|p| p.package.aliases().iter().any(|a| *a == name))
    }

    /// All packages listed by all sources.
    pub fn source_packages(&self) -> Vec<Package> {
        let mut packages = Vec::new();
        for source in self.sources.values() {
            match source.packages() {
                Ok(mut list) => packages.append(&mut list),
                Err(e) => warn!(source = %source.name, error = %e, "failed to read source index"),
            }
        }
        packages
    }

    /// Source packages whose name/path matches `pkg_path`.
    pub fn match_source_packages(&self, pkg_path: &str) -> Vec<Package> {
        let path = canonical_url(pkg_path);
        self.source_packages()
            .into_iter()
            .filter(|p| p.matches_path(&path))
            .collect()
    }

    /// Search source packages by substring over qualified names and
    /// aggregated tags.
    pub fn search(&self, query: &str) -> Vec<Package> {
        let query = query.to_lowercase();
        self.source_packages()
            .into_iter()
            .filter(|p| {
                p.qualified_name().to_lowercase().contains(&query)
                    || p.metadata_record()
                        .tags()
                        .iter()
                        .any(|t| t.to_lowercase().contains(&query))
            })
            .collect()
    }

    /// A built-in capability matching `pkg_path`, if the platform
    /// advertises one.
    pub fn find_builtin_package(&self, pkg_path: &str) -> Option<PackageInfo> {
        let name = name_from_path(&canonical_url(pkg_path));
        self.platform
            .capabilities
            .get(&name)
            .map(|c| make_builtin_package(&c.name, &c.version, c.commit.as_deref()))
    }

    /// Whether an installed package has staged scripts.
    pub fn has_scripts(&self, ipkg: &InstalledPackage) -> bool {
        self.layout
            .script_packages_dir()
            .join(&ipkg.package.name)
            .is_dir()
    }

    /// Whether an installed package staged a plugin tree.
    pub fn has_plugin(&self, ipkg: &InstalledPackage) -> bool {
        self.layout
            .plugin_packages_dir()
            .join(&ipkg.package.name)
            .is_dir()
    }

    /// The last build log for a package, if any.
    pub fn package_build_log(&self, pkg_path: &str) -> PathBuf {
        self.layout.build_log(&name_from_path(&canonical_url(pkg_path)))
    }

    /// Version tags available for an installed package's clone.
    pub async fn package_versions(&self, ipkg: &InstalledPackage) -> Result<Vec<String>> {
        let clone = self.layout.package_clonedir().join(&ipkg.package.name);
        Ok(sorted_version_tags(self.vcs.list_tags(&clone).await?))
    }

    /// The environment a user shell needs to see staged artifacts, as
    /// name/value pairs (the `env` verb).
    pub fn env(&self) -> Vec<(String, String)> {
        Stage::real(&self.layout).subprocess_env(&self.platform)
    }

    /// Full information on a package at a version.
    ///
    /// With `prefer_installed`, an installed package answers from its
    /// long-lived clone; otherwise the package is cloned into the scratch
    /// area at the requested (or best) version and inspected there.
    pub async fn info(
        &self,
        pkg_path: &str,
        version: &str,
        prefer_installed: bool,
    ) -> Result<PackageInfo> {
        let path = canonical_url(pkg_path);
        debug!(package = %path, %version, "gathering package info");

        if prefer_installed {
            if let Some(ipkg) = self.find_installed_package(&path) {
                if ipkg.is_builtin() {
                    return self
                        .find_builtin_package(&ipkg.package.name)
                        .ok_or_else(|| {
                            ZkgError::dependency(format!(
                                "built-in package \"{path}\" no longer advertised by platform"
                            ))
                            .into()
                        });
                }
                return self.info_from_installed(&ipkg).await;
            }
        }

        if let Some(builtin) = self.find_builtin_package(&path) {
            // Built-ins only win when nothing installable matches.
            if self.match_source_packages(&path).is_empty()
                && self.find_installed_package(&path).is_none()
            {
                return Ok(builtin);
            }
        }

        let package = self.lookup_package(&path)?;
        self.info_from_scratch_clone(package, version).await
    }

    /// Resolve a user-supplied path to a [`Package`] via installed state,
    /// sources, or a raw URL.
    pub(crate) fn lookup_package(&self, path: &str) -> Result<Package> {
        if let Some(ipkg) = self.find_installed_package(path) {
            return Ok(ipkg.package);
        }

        let matches = self.match_source_packages(path);
        match matches.len() {
            0 => {
                if path.contains("://") || path.contains('@') || Path::new(path).is_dir() {
                    Ok(Package::from_url(path))
                } else {
                    Err(ZkgError::dependency(format!(
                        "package \"{path}\" not found in sources and also not a valid git URL"
                    ))
                    .into())
                }
            }
            1 => Ok(matches.into_iter().next().expect("len checked")),
            _ => {
                let names: Vec<String> = matches.iter().map(|p| p.qualified_name()).collect();
                Err(ZkgError::dependency(format!(
                    "\"{path}\" matches multiple packages, try a more specific name from: {}",
                    names.join(", ")
                ))
                .into())
            }
        }
    }

    async fn info_from_installed(&self, ipkg: &InstalledPackage) -> Result<PackageInfo> {
        let clone = self.layout.package_clonedir().join(&ipkg.package.name);
        if !self.vcs.is_valid_repo(&clone) {
            // The clone may have been removed; answer from the manifest
            // snapshot.
            return Ok(PackageInfo {
                package: ipkg.package.clone(),
                status: Some(ipkg.status.clone()),
                metadata: ipkg.package.metadata_record(),
                versions: Vec::new(),
                default_branch: String::new(),
                metadata_version: ipkg.status.current_version.clone(),
            });
        }

        let versions = sorted_version_tags(self.vcs.list_tags(&clone).await?);
        let default_branch = self.vcs.default_branch(&clone).await.unwrap_or_default();
        let metadata = PackageMetadata::parse_dir(&clone, &ipkg.package.name)
            .unwrap_or_else(|_| ipkg.package.metadata_record());

        Ok(PackageInfo {
            package: ipkg.package.clone(),
            status: Some(ipkg.status.clone()),
            metadata,
            versions,
            default_branch,
            metadata_version: ipkg.status.current_version.clone(),
        })
    }

    async fn info_from_scratch_clone(&self, package: Package, version: &str) -> Result<PackageInfo> {
        let clone = self.layout.scratch_dir().join("info").join(&package.name);
        fsutil::delete_path(&clone)?;
        let shallow = !crate::version::looks_like_commit(version);
        ensure_clone(self.vcs.as_ref(), &package.git_url, &clone, shallow).await?;

        let versions = sorted_version_tags(self.vcs.list_tags(&clone).await?);
        let default_branch = self.vcs.default_branch(&clone).await?;
        let metadata_version = if version.is_empty() {
            versions.last().cloned().unwrap_or_else(|| default_branch.clone())
        } else {
            version.to_string()
        };
        self.vcs.checkout(&clone, &metadata_version).await?;

        let metadata = PackageMetadata::parse_dir(&clone, &package.name)?;
        let mut package = package;
        package.metadata = metadata.fields().clone();

        Ok(PackageInfo {
            package,
            status: None,
            metadata,
            versions,
            default_branch,
            metadata_version,
        })
    }

    /// Check a candidate package's name and aliases against everything
    /// installed; any collision is an [`ZkgError::AliasConflict`].
    pub(crate) fn validate_alias_conflict(
        &self,
        package: &Package,
        metadata: &PackageMetadata,
    ) -> Result<()> {
        let mut package_names: BTreeMap<String, String> = BTreeMap::new();
        let mut alias_names: BTreeMap<String, String> = BTreeMap::new();
        for ipkg in self.installed() {
            if ipkg.package.git_url == package.git_url {
                continue;
            }
            let qualified = ipkg.package.qualified_name();
            package_names.insert(ipkg.package.name.clone(), qualified.clone());
            for alias in ipkg.package.aliases() {
                alias_names.insert(alias, qualified.clone());
            }
        }

        if let Some(owner) = alias_names.get(&package.name) {
            return Err(ZkgError::AliasConflict {
                reason: format!(
                    "name \"{}\" conflicts with alias from \"{owner}\"",
                    package.name
                ),
            }
            .into());
        }

        for alias in metadata.aliases() {
            if let Some(owner) = package_names.get(&alias) {
                return Err(ZkgError::AliasConflict {
                    reason: format!(
                        "alias \"{alias}\" conflicts with name of installed package \"{owner}\""
                    ),
                }
                .into());
            }
            if let Some(owner) = alias_names.get(&alias) {
                return Err(ZkgError::AliasConflict {
                    reason: format!(
                        "alias \"{alias}\" conflicts with alias of installed package \"{owner}\""
                    ),
                }
                .into());
            }
        }
        Ok(())
    }

    /// The config-level substitution pool for metadata interpolation:
    /// persisted user vars plus the platform distribution paths.
    /// Command-line overrides ride separately so the CLI > environment >
    /// config > default priority holds.
    pub(crate) fn substitution_pool(&self) -> BTreeMap<String, String> {
        let mut pool = self.config.user_vars.clone();
        let dist = self
            .config
            .zeek_dist
            .clone()
            .or_else(|| self.platform.zeek_dist.clone())
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        pool.insert("zeek_dist".to_string(), dist.clone());
        pool.insert("bro_dist".to_string(), dist);
        pool
    }

    /// Ensure symlinks exist in the bin dir for every installed package's
    /// executables.
    pub(crate) fn refresh_bin_dir(&self) -> Result<()> {
        for ipkg in &self.manifest.installed_packages {
            let clone = self.layout.package_clonedir().join(&ipkg.package.name);
            for exe in ipkg.package.metadata_record().executables() {
                let src = clone.join(&exe);
                let dst = self
                    .layout
                    .bin_dir
                    .join(Path::new(&exe).file_name().unwrap_or_default());
                if src.exists() {
                    fsutil::make_symlink(&src, &dst)?;
                }
            }
        }
        Ok(())
    }

    /// Remove bin-dir symlinks belonging to installed packages.
    pub(crate) fn clear_bin_dir(&self, bin_dir: &Path) {
        for ipkg in &self.manifest.installed_packages {
            for exe in ipkg.package.metadata_record().executables() {
                let link = bin_dir.join(Path::new(&exe).file_name().unwrap_or_default());
                if std::fs::symlink_metadata(&link)
                    .map(|m| m.file_type().is_symlink())
                    .unwrap_or(false)
                {
                    if let Err(e) = std::fs::remove_file(&link) {
                        warn!(link = %link.display(), error = %e, "cannot remove bin link");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl PackageProvider for Manager {
    async fn package_info(
        &self,
        pkg_path: &str,
        version: &str,
        prefer_installed: bool,
    ) -> Result<PackageInfo> {
        self.info(pkg_path, version, prefer_installed).await
    }

    fn find_builtin(&self, name: &str) -> Option<PackageInfo> {
        self.find_builtin_package(name)
    }

    fn installed_packages(&self) -> Vec<InstalledPackage> {
        self.installed()
    }

    fn platform_version(&self) -> Option<String> {
        self.platform.version.clone()
    }

    fn manager_version(&self) -> String {
        crate::VERSION.to_string()
    }
}

/// Status summary used by `list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    All,
    Installed,
    Loaded,
    Unloaded,
    Pinned,
    Outdated,
}

impl Manager {
    /// Installed packages matching a list filter.
    pub fn list(&self, filter: ListFilter) -> Vec<InstalledPackage> {
        self.installed()
            .into_iter()
            .filter(|p| match filter {
                ListFilter::All | ListFilter::Installed => true,
                ListFilter::Loaded => p.status.is_loaded,
                ListFilter::Unloaded => !p.status.is_loaded,
                ListFilter::Pinned => p.status.is_pinned,
                ListFilter::Outdated => p.status.is_outdated,
            })
            .collect()
    }
}

fn write_readme(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    fsutil::atomic_write(
        path,
        b"WARNING: This directory is managed by zkg.\nDon't make direct modifications to anything within it.\n",
    )
}

/// Fetch or create the long-lived clone of a package at a version,
/// returning the tracking method the version implies.
pub(crate) async fn fetch_package_clone(
    vcs: &dyn Vcs,
    clone_path: &Path,
    package: &Package,
    version: &str,
) -> Result<(String, TrackingMethod, String)> {
    let have_clone = vcs.is_valid_repo(clone_path);
    if have_clone {
        if let Err(e) = vcs.fetch(clone_path).await {
            warn!(package = %package.name, error = %e, "fetch failed, recloning");
            fsutil::delete_path(clone_path)?;
        }
    }
    if !vcs.is_valid_repo(clone_path) {
        let shallow = false; // long-lived clones keep full history
        ensure_clone(vcs, &package.git_url, clone_path, shallow).await?;
    }

    let tags = sorted_version_tags(vcs.list_tags(clone_path).await?);
    let branches = vcs.list_branches(clone_path).await?;

    let (version, method) = if version.is_empty() {
        match tags.last() {
            Some(tag) => (tag.clone(), TrackingMethod::Version),
            None => (vcs.default_branch(clone_path).await?, TrackingMethod::Branch),
        }
    } else if tags.iter().any(|t| t == version) {
        (version.to_string(), TrackingMethod::Version)
    } else if branches.iter().any(|b| b == version) {
        (version.to_string(), TrackingMethod::Branch)
    } else if vcs.is_commit(clone_path, version).await {
        (version.to_string(), TrackingMethod::Commit)
    } else {
        return Err(ZkgError::VersionResolution {
            package: package.name.clone(),
            reason: format!("no such branch or version tag: \"{version}\""),
        }
        .into());
    };

    vcs.checkout(clone_path, &version).await?;
    if method == TrackingMethod::Branch {
        // Move a branch checkout to the remote tip.
        let _ = vcs.pull(clone_path).await;
    }
    let _ = vcs.submodule_update(clone_path).await;
    let commit = vcs.current_commit(clone_path).await?;
    Ok((version, method, commit))
}

/// Whether a clone is outdated relative to its tracked ref.
pub(crate) async fn is_clone_outdated(
    vcs: &dyn Vcs,
    clone_path: &Path,
    version: &str,
    method: TrackingMethod,
) -> bool {
    match method {
        TrackingMethod::Version => {
            let tags = match vcs.list_tags(clone_path).await {
                Ok(tags) => sorted_version_tags(tags),
                Err(_) => return false,
            };
            match tags.last() {
                Some(latest) => {
                    crate::version::normalize_version_tag(latest)
                        != crate::version::normalize_version_tag(version)
                }
                None => false,
            }
        }
        TrackingMethod::Branch => vcs
            .commits_behind(clone_path, version)
            .await
            .map(|n| n > 0)
            .unwrap_or(false),
        TrackingMethod::Commit => false,
    }
}

pub(crate) fn manifest_entry(
    package: Package,
    status: PackageStatus,
) -> InstalledPackage {
    InstalledPackage { package, status }
}
