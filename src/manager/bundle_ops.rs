//! Bundle verbs: packing installed packages for offline transfer and
//! installing from such archives.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::bundle::{self, BundleManifest};
use crate::core::fsutil;
use crate::core::ZkgError;
use crate::lock::StateLock;
use crate::meta::classify_dependency;
use crate::package::{name_from_path, InstalledPackage, Package, PackageStatus};
use crate::resolver::PlanEntry;
use crate::stage::{self, Stage, StageContext};
use crate::version::{looks_like_commit, sorted_version_tags, TrackingMethod};

use super::{manifest_entry, Manager};

impl Manager {
    /// Create a bundle of the given (git URL, version) pairs, or of every
    /// installed package when `packages` is `None`.
    ///
    /// With `prefer_existing_clones`, a package installed at the requested
    /// version is copied from the clone area instead of cloned from its
    /// remote; locally modified config files travel with it.
    ///
    /// Returns the archive's sha256 digest.
    pub async fn bundle(
        &mut self,
        bundle_file: &Path,
        packages: Option<Vec<(String, String)>>,
        prefer_existing_clones: bool,
    ) -> Result<String> {
        let package_list = match packages {
            Some(list) => list,
            None => self
                .installed()
                .into_iter()
                .map(|p| (p.package.git_url.clone(), p.status.current_version.clone()))
                .collect(),
        };

        let bundle_dir = self.layout.scratch_dir().join("bundle");
        fsutil::delete_path(&bundle_dir)?;
        fsutil::make_dir(&bundle_dir)?;

        let mut manifest = BundleManifest::default();

        for (git_url, version) in package_list {
            // Built-in capabilities have nothing to clone; record them in
            // the manifest's meta section to aid debugging on the
            // destination host.
            if git_url.starts_with(crate::package::BUILTIN_SCHEME) {
                manifest
                    .builtin_packages
                    .push((name_from_path(&git_url), version));
                continue;
            }

            let name = name_from_path(&git_url);
            let clone_path = bundle_dir.join(&name);
            manifest.packages.push((git_url.clone(), version.clone()));

            if prefer_existing_clones {
                if let Some(ipkg) = self.match_installed_url_and_version(&git_url, &version) {
                    let src = self.layout.package_clonedir().join(&ipkg.package.name);
                    fsutil::copy_dir_all(&src, &clone_path)?;
                    self.vcs.reset_clean(&clone_path).await?;

                    for (rel, installed) in
                        stage::modified_config_files(&self.layout, &ipkg.package)?
                    {
                        let dst = clone_path.join(&rel);
                        if let Some(parent) = dst.parent() {
                            fsutil::make_dir(parent)?;
                        }
                        std::fs::copy(&installed, &dst)?;
                    }
                    continue;
                }
            }

            let shallow = !looks_like_commit(&version);
            self.vcs
                .clone_repo(&git_url, &clone_path, shallow)
                .await
                .with_context(|| format!("failed to clone {git_url}"))?;
        }

        manifest.write_to(&bundle_dir)?;
        fsutil::delete_path(bundle_file)?;
        let digest = bundle::create_archive(&bundle_dir, bundle_file)?;
        info!(bundle = %bundle_file.display(), %digest, "created bundle");
        Ok(digest)
    }

    fn match_installed_url_and_version(
        &self,
        git_url: &str,
        version: &str,
    ) -> Option<InstalledPackage> {
        self.installed()
            .into_iter()
            .find(|p| p.package.git_url == git_url && p.status.current_version == version)
    }

    /// Inspect a bundle without installing it.
    pub fn bundle_info(&self, bundle_file: &Path) -> Result<(BundleManifest, String)> {
        let manifest = bundle::read_manifest_from_archive(bundle_file)?;
        let digest = bundle::archive_digest(bundle_file)?;
        Ok((manifest, digest))
    }

    /// Install every package contained in a bundle, transactionally.
    ///
    /// Clones come from the bundle itself; no network access is needed.
    /// Entries whose dependencies reference built-in capabilities this
    /// host does not advertise produce warnings up front; the install is
    /// still attempted and may fail at the ordinary constraint check.
    pub async fn unbundle(&mut self, bundle_file: &Path) -> Result<()> {
        let _lock = StateLock::acquire(&self.layout.state_dir)?;
        debug!(bundle = %bundle_file.display(), "unbundling");

        let untar_dir = self.layout.scratch_dir().join("untar");
        fsutil::delete_path(&untar_dir)?;
        fsutil::make_dir(&untar_dir)?;
        bundle::extract_archive(bundle_file, &untar_dir)?;
        let manifest = BundleManifest::read_from(&untar_dir)?;

        // Capabilities the source host had but this host lacks.
        for (name, version) in &manifest.builtin_packages {
            match self.platform.capabilities.get(name) {
                None => warn!(
                    capability = %name,
                    %version,
                    "bundle was built against a built-in capability this host does not advertise"
                ),
                Some(cap) if cap.version != *version => info!(
                    capability = %name,
                    bundled = %version,
                    host = %cap.version,
                    "bundle was built against a different built-in capability version"
                ),
                Some(_) => {}
            }
        }

        // Move bundled clones into the clone area, then stage them all as
        // one plan.
        let ws_root = self.layout.scratch_dir().join("stage");
        let workspace = Stage::workspace(&self.layout, &ws_root);
        workspace.populate(None)?;
        workspace.seed_from(&Stage::real(&self.layout))?;

        let ctx = StageContext {
            layout: &self.layout,
            substitutions: self.substitution_pool(),
            cli_overrides: self.user_var_overrides.clone(),
            env: workspace.subprocess_env(&self.platform),
        };

        let mut staged: Vec<(PlanEntry, InstalledPackage)> = Vec::new();
        for (git_url, version) in &manifest.packages {
            let package = Package::from_url(git_url.as_str());
            let clone_path = self.layout.package_clonedir().join(&package.name);
            let bundled_clone = untar_dir.join(&package.name);
            if !bundled_clone.is_dir() {
                return Err(ZkgError::Bundle {
                    reason: format!("bundle lacks a clone directory for {}", package.name),
                }
                .into());
            }
            fsutil::delete_path(&clone_path)?;
            fsutil::move_tree(&bundled_clone, &clone_path)?;

            let (version, method) = self.classify_bundled_version(&clone_path, version).await?;
            self.vcs.checkout(&clone_path, &version).await?;
            let commit = self.vcs.current_commit(&clone_path).await?;

            let raw = crate::meta::PackageMetadata::parse_dir(&clone_path, &package.name)?;
            self.validate_alias_conflict(&package, &raw)?;

            let metadata = stage::stage_package(&package, &clone_path, &workspace, &ctx).await?;

            let mut package = package;
            package.metadata = metadata.fields().clone();
            let prior = self.find_installed_package(&package.name);
            let status = PackageStatus {
                is_loaded: prior.as_ref().map(|p| p.status.is_loaded).unwrap_or(true),
                is_pinned: prior.as_ref().map(|p| p.status.is_pinned).unwrap_or(false),
                is_outdated: false,
                tracking_method: Some(method),
                current_version: version.clone(),
                current_hash: commit,
            };
            let info = crate::package::PackageInfo {
                package: package.clone(),
                status: Some(status.clone()),
                metadata: metadata.clone(),
                versions: Vec::new(),
                default_branch: String::new(),
                metadata_version: version,
            };
            staged.push((
                PlanEntry {
                    info,
                    version: status.current_version.clone(),
                    is_suggestion: false,
                },
                manifest_entry(package, status),
            ));
        }

        self.commit_plan(&ws_root, &workspace, staged)?;

        // Post-install dependency verification: anything unsatisfied is a
        // warning here, mirroring the dual behavior at bundle creation.
        for (git_url, _) in &manifest.packages {
            let Some(ipkg) = self.find_installed_package(git_url) else {
                warn!(package = %git_url, "bundled package not installed?");
                continue;
            };
            let deps = ipkg.package.metadata_record().depends().unwrap_or_default();
            for (dep, spec) in deps {
                if !matches!(
                    classify_dependency(&dep),
                    crate::meta::DependencyName::Package(_)
                ) {
                    continue;
                }
                match self.find_installed_package(&dep) {
                    None => warn!(
                        dependency = %dep,
                        of = %git_url,
                        "dependency of bundled package missing"
                    ),
                    Some(dep_pkg) => {
                        if let Err(msg) = dep_pkg.fulfills(&spec) {
                            warn!(
                                dependency = %dep,
                                of = %git_url,
                                constraint = %spec,
                                %msg,
                                "dependency of bundled package not compatible"
                            );
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn classify_bundled_version(
        &self,
        clone_path: &Path,
        version: &str,
    ) -> Result<(String, TrackingMethod)> {
        let tags = sorted_version_tags(self.vcs.list_tags(clone_path).await?);
        if version.is_empty() {
            return match tags.last() {
                Some(tag) => Ok((tag.clone(), TrackingMethod::Version)),
                None => Ok((
                    self.vcs.default_branch(clone_path).await?,
                    TrackingMethod::Branch,
                )),
            };
        }
        if tags.iter().any(|t| t == version) {
            return Ok((version.to_string(), TrackingMethod::Version));
        }
        if self.vcs.is_commit(clone_path, version).await {
            return Ok((version.to_string(), TrackingMethod::Commit));
        }
        // Branch pins keep tracking their branch on the destination host.
        Ok((version.to_string(), TrackingMethod::Branch))
    }
}
