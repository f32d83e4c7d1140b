//! Install, upgrade, remove, load/unload, and pin verbs, plus the
//! transactional plan executor they share.
//!
//! A plan executes against an ephemeral workspace stage seeded with the
//! pre-plan artifacts. Every package in the plan must fetch, build, test,
//! and stage successfully before the workspace is swapped over the real
//! stage and the manifest is written once, at the end. Any failure
//! simply discards the workspace, leaving the real stage and manifest
//! byte-for-byte untouched.

use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::core::fsutil;
use crate::core::ZkgError;
use crate::lock::StateLock;
use crate::package::{canonical_url, name_from_path, InstalledPackage, PackageStatus};
use crate::resolver::{self, PlanEntry, Request, ResolveOptions};
use crate::stage::{self, Stage, StageContext};
use crate::version::TrackingMethod;

use super::{fetch_package_clone, is_clone_outdated, manifest_entry, Manager};

/// Options steering install/upgrade behavior.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Skip running package test suites.
    pub skiptests: bool,
    /// Proceed without interactive confirmation (never bypasses failing
    /// tests; only `skiptests` does that).
    pub force: bool,
    /// Mark newly installed packages as loaded.
    pub load: bool,
    /// Ignore `suggests` edges during resolution.
    pub ignore_suggestions: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            skiptests: false,
            force: false,
            load: true,
            ignore_suggestions: false,
        }
    }
}

impl Manager {
    /// Install one or more packages plus whatever they require, as one
    /// transaction.
    pub async fn install(&mut self, requests: &[Request], opts: &InstallOptions) -> Result<()> {
        let _lock = StateLock::acquire(&self.layout.state_dir)?;

        // Re-install requests for already-installed packages resolve to
        // their existing identity.
        let plan = resolver::resolve(
            &*self,
            requests,
            &ResolveOptions {
                ignore_installed: false,
                ignore_suggestions: opts.ignore_suggestions,
                use_builtin: true,
            },
        )
        .await?;

        let mut entries: Vec<PlanEntry> = plan.entries;
        for request in requests {
            let info = self.info(&request.path, &request.version, false).await?;
            let version = if request.version.is_empty() {
                info.best_version()
            } else {
                request.version.clone()
            };
            entries.push(PlanEntry {
                info,
                version,
                is_suggestion: false,
            });
        }

        self.execute_plan(entries, opts).await
    }

    /// Upgrade an installed package to the latest version its tracking
    /// method allows.
    ///
    /// Test failures of the new version block the upgrade even with
    /// `force`; only `skiptests` lifts that.
    pub async fn upgrade(&mut self, pkg_path: &str, opts: &InstallOptions) -> Result<()> {
        let path = canonical_url(pkg_path);
        debug!(package = %path, "upgrading");
        let ipkg = self
            .find_installed_package(&path)
            .ok_or_else(|| anyhow::anyhow!("no such package installed: {path}"))?;

        if ipkg.status.is_pinned {
            return Err(anyhow::anyhow!(
                "package \"{}\" is pinned, unpin before upgrading",
                ipkg.package.name
            ));
        }

        let clone = self.layout.package_clonedir().join(&ipkg.package.name);
        if let Err(e) = self.vcs.fetch(&clone).await {
            warn!(package = %ipkg.package.name, error = %e, "fetch before upgrade failed");
        }
        let method = ipkg
            .status
            .tracking_method
            .ok_or_else(|| anyhow::anyhow!("package has no recorded tracking method"))?;

        if !is_clone_outdated(self.vcs.as_ref(), &clone, &ipkg.status.current_version, method).await
        {
            info!(package = %ipkg.package.name, "package is not outdated");
            return Ok(());
        }

        let target_version = match method {
            TrackingMethod::Version => {
                let tags = crate::version::sorted_version_tags(self.vcs.list_tags(&clone).await?);
                tags.last()
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("no version tags available"))?
            }
            TrackingMethod::Branch => ipkg.status.current_version.clone(),
            TrackingMethod::Commit => return Ok(()),
        };

        let request = Request::new(ipkg.package.qualified_name(), target_version);
        self.install(&[request], opts).await
    }

    /// Execute an ordered plan transactionally.
    async fn execute_plan(&mut self, entries: Vec<PlanEntry>, opts: &InstallOptions) -> Result<()> {
        // Alias uniqueness across installed packages and within the plan.
        let mut plan_names: BTreeSet<String> = BTreeSet::new();
        for entry in &entries {
            if entry.is_builtin() {
                continue;
            }
            self.validate_alias_conflict(&entry.info.package, &entry.info.metadata)?;
            for name in std::iter::once(entry.info.package.name.clone())
                .chain(entry.info.metadata.aliases())
            {
                if !plan_names.insert(name.clone()) {
                    return Err(ZkgError::AliasConflict {
                        reason: format!(
                            "plan contains conflicting name or alias \"{name}\""
                        ),
                    }
                    .into());
                }
            }
        }

        // Run test suites before anything is staged for real. The testing
        // area is separate from the plan workspace, so a failure aborts
        // with no cleanup to do.
        if !opts.skiptests {
            for entry in &entries {
                if entry.is_builtin() || entry.info.metadata.test_command().is_none() {
                    continue;
                }
                let (passed, test_dir) = self
                    .test(&entry.info.package.qualified_name(), &entry.version)
                    .await?;
                if !passed {
                    return Err(ZkgError::TestFailed {
                        package: entry.info.package.name.clone(),
                        code: 1,
                        dir: test_dir.display().to_string(),
                    }
                    .into());
                }
            }
        }

        // Stage everything into an ephemeral workspace.
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
        for entry in entries {
            if entry.is_builtin() {
                debug!(package = %entry.info.package.name, "satisfied by built-in capability");
                continue;
            }
            let package = entry.info.package.clone();
            let prior = self.find_installed_package(&package.name);
            let clone_path = self.layout.package_clonedir().join(&package.name);

            // Keep the user's edited config files across the re-checkout.
            let saved_configs = match &prior {
                Some(prior_ipkg) if !prior_ipkg.is_builtin() => {
                    stage::save_temporary_config_files(&self.layout, &prior_ipkg.package)?
                }
                _ => Vec::new(),
            };
            let modified = match &prior {
                Some(prior_ipkg) if !prior_ipkg.is_builtin() => {
                    stage::modified_config_files(&self.layout, &prior_ipkg.package)?
                }
                _ => Vec::new(),
            };
            if !modified.is_empty() {
                let backups =
                    stage::backup_modified_files(&self.layout, &package.name, &modified)?;
                for backup in &backups {
                    info!(package = %package.name, backup = %backup.display(), "backed up modified config file");
                }
            }

            let (version, method, commit) =
                fetch_package_clone(self.vcs.as_ref(), &clone_path, &package, &entry.version)
                    .await?;

            for (rel, backup) in &saved_configs {
                let dst = clone_path.join(rel);
                if let Some(parent) = dst.parent() {
                    fsutil::make_dir(parent)?;
                }
                std::fs::copy(backup, &dst).with_context(|| {
                    format!("failed to restore config file {rel} into {}", package.name)
                })?;
            }

            let metadata = stage::stage_package(&package, &clone_path, &workspace, &ctx).await?;

            let mut package = package;
            package.metadata = metadata.fields().clone();
            let status = PackageStatus {
                is_loaded: prior.as_ref().map(|p| p.status.is_loaded).unwrap_or(opts.load),
                is_pinned: prior.as_ref().map(|p| p.status.is_pinned).unwrap_or(false),
                is_outdated: false,
                tracking_method: Some(method),
                current_version: version,
                current_hash: commit,
            };
            staged.push((entry, manifest_entry(package, status)));
        }

        self.commit_plan(&ws_root, &workspace, staged)?;
        Ok(())
    }

    /// Swap the workspace into the real stage and write the manifest.
    pub(crate) fn commit_plan(
        &mut self,
        ws_root: &PathBuf,
        workspace: &Stage,
        staged: Vec<(PlanEntry, InstalledPackage)>,
    ) -> Result<()> {
        let real = Stage::real(&self.layout);
        let rollback_root = self.layout.scratch_dir().join("rollback");
        fsutil::delete_path(&rollback_root)?;
        fsutil::make_dir(&rollback_root)?;

        let swaps = [
            (&workspace.script_dir, &real.script_dir, "scripts"),
            (&workspace.plugin_dir, &real.plugin_dir, "plugins"),
            (&workspace.bin_dir, &real.bin_dir, "bin"),
        ];

        let mut moved: Vec<(PathBuf, PathBuf)> = Vec::new();
        let result = (|| -> Result<()> {
            for (ws_dir, real_dir, label) in swaps {
                let saved = rollback_root.join(label);
                if real_dir.exists() {
                    fsutil::move_tree(real_dir, &saved)
                        .map_err(|_| ZkgError::stage("failed to set aside stage tree", real_dir))?;
                    moved.push((saved.clone(), real_dir.clone()));
                }
                fsutil::move_tree(ws_dir, real_dir)
                    .map_err(|_| ZkgError::stage("failed to move workspace tree", real_dir))?;
            }
            Ok(())
        })();

        if let Err(e) = result {
            // Put the pre-plan trees back; the workspace is abandoned.
            for (saved, original) in moved.into_iter().rev() {
                fsutil::delete_path(&original).ok();
                fsutil::move_tree(&saved, &original).ok();
            }
            return Err(e);
        }

        // Script-root symlinks (short name and aliases) for the packages
        // this plan staged.
        for (_, entry) in &staged {
            if self
                .layout
                .script_packages_dir()
                .join(&entry.package.name)
                .is_dir()
            {
                let target = PathBuf::from("packages").join(&entry.package.name);
                fsutil::make_symlink(&target, &self.layout.script_dir.join(&entry.package.name))?;
                for alias in entry.package.aliases() {
                    fsutil::make_symlink(&target, &self.layout.script_dir.join(alias))?;
                }
            }
        }

        for (_, entry) in &staged {
            stage::write_plugin_magic(&self.layout, &entry.package.name, entry.status.is_loaded);
            self.manifest.upsert(entry.clone());
        }

        self.write_state_files()?;
        self.refresh_bin_dir()?;
        self.save_manifest()?;

        fsutil::delete_path(&rollback_root)?;
        fsutil::delete_path(ws_root)?;

        for (_, entry) in &staged {
            info!(package = %entry.package.qualified_name(), version = %entry.status.current_version, "installed");
        }
        Ok(())
    }

    /// Run a package's test suite in a dedicated per-test workspace,
    /// staging the package and its dependencies there first.
    ///
    /// Returns whether tests passed and the directory preserving
    /// stdout/stderr for inspection. A package without a `test_command`
    /// is an error.
    pub async fn test(&self, pkg_path: &str, version: &str) -> Result<(bool, PathBuf)> {
        let path = canonical_url(pkg_path);
        debug!(package = %path, "testing");
        let pkg_info = self.info(&path, version, false).await?;

        if pkg_info.metadata.test_command().is_none() {
            return Err(anyhow::anyhow!(
                "package \"{path}\" does not specify a test_command"
            ));
        }
        let version = if version.is_empty() {
            pkg_info.metadata_version.clone()
        } else {
            version.to_string()
        };

        let test_root = self.layout.testing_dir().join(&pkg_info.package.name);
        let test_stage = Stage::testing(&test_root);
        test_stage.populate(Some(&self.layout.package_clonedir()))?;

        let request = Request::new(pkg_info.package.qualified_name(), version.clone());
        let plan = resolver::resolve(
            self,
            std::slice::from_ref(&request),
            &ResolveOptions {
                ignore_installed: false,
                ignore_suggestions: false,
                use_builtin: true,
            },
        )
        .await?;

        let ctx = StageContext {
            layout: &self.layout,
            substitutions: self.substitution_pool(),
            cli_overrides: self.user_var_overrides.clone(),
            env: test_stage.subprocess_env(&self.platform),
        };

        // Dependencies first, then the package under test.
        let mut to_stage: Vec<(crate::package::PackageInfo, String)> = plan
            .entries
            .iter()
            .filter(|e| !e.is_builtin())
            .map(|e| (e.info.clone(), e.version.clone()))
            .collect();
        to_stage.push((pkg_info.clone(), version.clone()));

        for (info, stage_version) in &to_stage {
            debug!(package = %info.package.name, version = %stage_version, "preparing for testing");
            let clone_path = test_stage.clone_dir.join(&info.package.name);
            // An installed-package symlink from populate() gets replaced by
            // a real clone of the version under test.
            if std::fs::symlink_metadata(&clone_path)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false)
            {
                fsutil::delete_path(&clone_path)?;
            }
            if !clone_path.exists() {
                self.vcs
                    .clone_repo(&info.package.git_url, &clone_path, false)
                    .await?;
            }
            self.vcs.checkout(&clone_path, stage_version).await?;
            stage::stage_package(&info.package, &clone_path, &test_stage, &ctx).await?;
        }

        // Run the requested package's test_command with the stage
        // environment.
        let clone_path = test_stage.clone_dir.join(&pkg_info.package.name);
        let metadata = crate::meta::PackageMetadata::parse_dir(&clone_path, &pkg_info.package.name)?;
        let metadata = stage::interpolate_metadata(&metadata, &pkg_info.package.name, &ctx, &test_stage)?;
        let Some(test_command) = metadata.test_command() else {
            return Err(anyhow::anyhow!(
                "package \"{path}\" does not specify a test_command"
            ));
        };

        debug!(package = %pkg_info.package.name, %test_command, "running test_command");
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(test_command).current_dir(&clone_path);
        for (key, value) in &ctx.env {
            cmd.env(key, value);
        }
        let output = cmd
            .output()
            .await
            .with_context(|| format!("failed to spawn test_command for {}", pkg_info.package.name))?;

        std::fs::write(clone_path.join("zkg.test_command.stdout"), &output.stdout)?;
        std::fs::write(clone_path.join("zkg.test_command.stderr"), &output.stderr)?;

        Ok((output.status.success(), test_root))
    }

    /// Remove an installed package: clone, staged artifacts, loader entry,
    /// bin links, and manifest entry.
    pub async fn remove(&mut self, pkg_path: &str) -> Result<bool> {
        let _lock = StateLock::acquire(&self.layout.state_dir)?;
        let path = canonical_url(pkg_path);
        debug!(package = %path, "removing");

        let Some(ipkg) = self.find_installed_package(&path) else {
            info!(package = %path, "no matching package to remove");
            return Ok(false);
        };
        if ipkg.is_builtin() {
            return Err(anyhow::anyhow!(
                "cannot remove built-in package \"{}\"",
                ipkg.package.name
            ));
        }

        let name = ipkg.package.name.clone();
        // Loader entry first, so an interrupted removal never leaves a
        // dangling @load.
        if ipkg.status.is_loaded {
            if let Some(entry) = self.manifest.find_mut(&name) {
                entry.status.is_loaded = false;
            }
            self.write_state_files()?;
        }

        fsutil::delete_path(&self.layout.package_clonedir().join(&name))?;
        fsutil::delete_path(&self.layout.script_packages_dir().join(&name))?;
        fsutil::delete_path(&self.layout.plugin_packages_dir().join(&name))?;
        fsutil::delete_path(&self.layout.script_dir.join(&name))?;
        for alias in ipkg.package.aliases() {
            fsutil::delete_path(&self.layout.script_dir.join(alias))?;
        }
        for exe in ipkg.package.metadata_record().executables() {
            let link = self
                .layout
                .bin_dir
                .join(std::path::Path::new(&exe).file_name().unwrap_or_default());
            if std::fs::symlink_metadata(&link)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false)
            {
                std::fs::remove_file(&link).ok();
            }
        }

        self.manifest.remove(&name);
        self.write_state_files()?;
        self.save_manifest()?;
        info!(package = %path, "removed");
        Ok(true)
    }

    /// Remove a package and additionally delete its backed-up config
    /// files.
    pub async fn purge(&mut self, pkg_path: &str) -> Result<bool> {
        let name = name_from_path(&canonical_url(pkg_path));
        let removed = self.remove(pkg_path).await?;
        if removed {
            fsutil::delete_path(&self.layout.backup_dir().join(&name))?;
        }
        Ok(removed)
    }

    /// Mark an installed package as loaded.
    pub fn load(&mut self, pkg_path: &str) -> Result<()> {
        let _lock = StateLock::acquire(&self.layout.state_dir)?;
        let path = canonical_url(pkg_path);
        debug!(package = %path, "loading");
        let Some(ipkg) = self.find_installed_package(&path) else {
            return Err(anyhow::anyhow!("no such package: {path}"));
        };
        if ipkg.status.is_loaded {
            return Ok(());
        }

        let load_script = self
            .layout
            .script_packages_dir()
            .join(&ipkg.package.name)
            .join("__load__.zeek");
        if !load_script.exists() && !self.has_plugin(&ipkg) {
            return Err(anyhow::anyhow!(
                "no __load__.zeek within package script_dir and no plugin included"
            ));
        }

        let name = ipkg.package.name.clone();
        if let Some(entry) = self.manifest.find_mut(&name) {
            entry.status.is_loaded = true;
        }
        self.write_state_files()?;
        self.save_manifest()?;
        stage::write_plugin_magic(&self.layout, &name, true);
        debug!(package = %path, "loaded");
        Ok(())
    }

    /// Unmark an installed package as loaded.
    pub fn unload(&mut self, pkg_path: &str) -> Result<bool> {
        let _lock = StateLock::acquire(&self.layout.state_dir)?;
        let path = canonical_url(pkg_path);
        debug!(package = %path, "unloading");
        let Some(ipkg) = self.find_installed_package(&path) else {
            return Ok(false);
        };
        if !ipkg.status.is_loaded {
            return Ok(true);
        }

        let name = ipkg.package.name.clone();
        if let Some(entry) = self.manifest.find_mut(&name) {
            entry.status.is_loaded = false;
        }
        self.write_state_files()?;
        self.save_manifest()?;
        stage::write_plugin_magic(&self.layout, &name, false);
        debug!(package = %path, "unloaded");
        Ok(true)
    }

    /// Load a package and all of its installed dependencies, returning
    /// per-package outcomes (name, error message or empty).
    pub fn load_with_dependencies(&mut self, pkg_name: &str) -> Vec<(String, String)> {
        let mut results = Vec::new();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = VecDeque::from([pkg_name.to_string()]);

        while let Some(name) = queue.pop_front() {
            if !visited.insert(name.clone()) {
                continue;
            }
            let Some(_ipkg) = self.find_installed_package(&name) else {
                results.push((name, "loading failed, package not installed".to_string()));
                continue;
            };
            match self.load(&name) {
                Ok(()) => results.push((name.clone(), String::new())),
                Err(e) => {
                    results.push((name.clone(), e.to_string()));
                    continue;
                }
            }
            for (dep, _) in self.installed_dependencies(&name) {
                if !crate::package::is_reserved_name(&dep) && !visited.contains(&dep) {
                    queue.push_back(dep);
                }
            }
        }
        results
    }

    /// Direct dependencies of an installed package, as (short name,
    /// constraint) pairs.
    pub fn installed_dependencies(&self, pkg_name: &str) -> Vec<(String, String)> {
        self.find_installed_package(pkg_name)
            .map(|ipkg| {
                ipkg.package
                    .metadata_record()
                    .depends()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(name, spec)| (name_from_path(&name), spec))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Installed packages that (transitively) depend on `pkg_path`.
    pub fn list_depender_pkgs(&self, pkg_path: &str) -> Vec<String> {
        let target = name_from_path(&canonical_url(pkg_path));
        let mut dependers: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = VecDeque::from([target.clone()]);

        while let Some(current) = queue.pop_front() {
            for ipkg in self.installed() {
                let name = ipkg.package.name.clone();
                let deps = self.installed_dependencies(&name);
                if deps.iter().any(|(dep, _)| *dep == current) && dependers.insert(name.clone()) {
                    queue.push_back(name);
                }
            }
        }
        dependers.into_iter().collect()
    }

    /// Unload a package together with any dependencies no loaded package
    /// still needs. Returns per-package outcomes.
    pub fn unload_with_unused_dependers(&mut self, pkg_name: &str) -> Vec<(String, String)> {
        let mut results = Vec::new();
        let mut queue: VecDeque<String> = VecDeque::from([pkg_name.to_string()]);
        let mut visited: BTreeSet<String> = BTreeSet::new();

        while let Some(name) = queue.pop_front() {
            if !visited.insert(name.clone()) {
                continue;
            }
            let Some(ipkg) = self.find_installed_package(&name) else {
                results.push((name, "package not installed".to_string()));
                break;
            };
            if !ipkg.status.is_loaded {
                continue;
            }

            let dependers = self.list_depender_pkgs(&name);
            let all_unloaded = dependers.iter().all(|dep| {
                self.find_installed_package(dep)
                    .map(|p| !p.status.is_loaded)
                    .unwrap_or(true)
            });

            if !all_unloaded && name != pkg_name {
                continue;
            }
            if !all_unloaded {
                let listing: Vec<String> =
                    dependers.iter().map(|d| format!("\"{d}\"")).collect();
                results.push((
                    name,
                    format!("package is in use by other packages --- {}", listing.join(", ")),
                ));
                break;
            }

            match self.unload(&name) {
                Ok(_) => results.push((name.clone(), String::new())),
                Err(e) => {
                    results.push((name.clone(), e.to_string()));
                    continue;
                }
            }
            for (dep, _) in self.installed_dependencies(&name) {
                if !crate::package::is_reserved_name(&dep) {
                    queue.push_back(dep);
                }
            }
        }
        results
    }

    /// Pin an installed package to its current version.
    pub fn pin(&mut self, pkg_path: &str) -> Result<InstalledPackage> {
        let _lock = StateLock::acquire(&self.layout.state_dir)?;
        let path = canonical_url(pkg_path);
        let ipkg = self
            .find_installed_package(&path)
            .ok_or_else(|| anyhow::anyhow!("no such package installed: {path}"))?;
        if !ipkg.status.is_pinned {
            let name = ipkg.package.name.clone();
            if let Some(entry) = self.manifest.find_mut(&name) {
                entry.status.is_pinned = true;
            }
            self.save_manifest()?;
            debug!(package = %path, "pinned");
        }
        Ok(self.find_installed_package(&path).expect("still installed"))
    }

    /// Allow a pinned package to be upgraded again.
    pub fn unpin(&mut self, pkg_path: &str) -> Result<InstalledPackage> {
        let _lock = StateLock::acquire(&self.layout.state_dir)?;
        let path = canonical_url(pkg_path);
        let ipkg = self
            .find_installed_package(&path)
            .ok_or_else(|| anyhow::anyhow!("no such package installed: {path}"))?;
        if ipkg.status.is_pinned {
            let name = ipkg.package.name.clone();
            if let Some(entry) = self.manifest.find_mut(&name) {
                entry.status.is_pinned = false;
            }
            self.save_manifest()?;
            debug!(package = %path, "unpinned");
        }
        Ok(self.find_installed_package(&path).expect("still installed"))
    }

    /// Fetch the latest refs for all installed packages and refresh their
    /// outdated flags. Does not upgrade anything.
    pub async fn refresh_installed_packages(&mut self) -> Result<()> {
        let _lock = StateLock::acquire(&self.layout.state_dir)?;
        let installed: Vec<InstalledPackage> = self.manifest.installed_packages.clone();
        for ipkg in installed {
            if ipkg.is_builtin() {
                continue;
            }
            let clone = self.layout.package_clonedir().join(&ipkg.package.name);
            if !self.vcs.is_valid_repo(&clone) {
                continue;
            }
            debug!(package = %ipkg.package.qualified_name(), "fetching");
            if let Err(e) = self.vcs.fetch(&clone).await {
                warn!(package = %ipkg.package.name, error = %e, "failed to fetch package");
                continue;
            }
            if let Some(method) = ipkg.status.tracking_method {
                let outdated = is_clone_outdated(
                    self.vcs.as_ref(),
                    &clone,
                    &ipkg.status.current_version,
                    method,
                )
                .await;
                if let Some(entry) = self.manifest.find_mut(&ipkg.package.name) {
                    entry.status.is_outdated = outdated;
                }
            }
        }
        self.save_manifest()
    }

    /// Save and restore helpers for loaded state, used by front-ends that
    /// bulk-toggle loading around an operation.
    pub fn loaded_package_states(&self) -> std::collections::BTreeMap<String, bool> {
        self.installed()
            .into_iter()
            .map(|p| (p.package.name.clone(), p.status.is_loaded))
            .collect()
    }

    /// Restore a previously captured loaded-state snapshot.
    pub fn restore_loaded_package_states(
        &mut self,
        saved: &std::collections::BTreeMap<String, bool>,
    ) -> Result<()> {
        let _lock = StateLock::acquire(&self.layout.state_dir)?;
        let mut toggled = Vec::new();
        for (name, was_loaded) in saved {
            if let Some(entry) = self.manifest.find_mut(name) {
                if entry.status.is_loaded != *was_loaded {
                    entry.status.is_loaded = *was_loaded;
                    toggled.push((name.clone(), *was_loaded));
                }
            }
        }
        for (name, loaded) in toggled {
            stage::write_plugin_magic(&self.layout, &name, loaded);
        }
        self.write_state_files()?;
        self.save_manifest()
    }
}
