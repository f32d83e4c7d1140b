//! The staging pipeline: where package artifacts get built and installed.
//!
//! *Staging* is the act of getting a package ready for use at a particular
//! set of filesystem locations, called a [`Stage`]: a script tree, a plugin
//! tree, and a binary directory. The stage may be the real installation
//! directories, an ephemeral per-plan workspace (so a multi-package
//! operation can be rolled back by discarding the workspace), or a
//! dedicated per-test area under `testing/<name>/`.
//!
//! Per-package staging runs, in order: metadata parse + interpolation,
//! `build_command` (output captured to `logs/<name>-build.log`, with the
//! stage's bin dir prepended to `PATH`), script-tree copy, plugin-tree
//! copy, executable symlinks, and alias symlinks. Any failure surfaces as
//! `BuildFailed` or `Stage` and leaves the real stage untouched; the
//! caller swaps workspace trees into place only after every package in the
//! plan has staged successfully.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::core::fsutil;
use crate::core::ZkgError;
use crate::meta::PackageMetadata;
use crate::package::{
    Package, LEGACY_PLUGIN_MAGIC_FILE, LEGACY_PLUGIN_MAGIC_FILE_DISABLED, PLUGIN_MAGIC_FILE,
    PLUGIN_MAGIC_FILE_DISABLED,
};
use crate::platform::PlatformInfo;

/// Name of the loader index file within the script stage.
pub const AUTOLOAD_SCRIPT: &str = "packages.zeek";
/// Symlink to the loader index so `@load packages` works.
pub const AUTOLOAD_PACKAGE: &str = "__load__.zeek";

/// The fixed filesystem layout under the state directory, plus the
/// configured stage directories.
#[derive(Debug, Clone)]
pub struct StateLayout {
    pub state_dir: PathBuf,
    /// Script stage root (the engine owns its `packages/` subtree).
    pub script_dir: PathBuf,
    /// Plugin stage root (the engine owns its `packages/` subtree).
    pub plugin_dir: PathBuf,
    pub bin_dir: PathBuf,
}

impl StateLayout {
    pub fn new(state_dir: &Path, script_dir: &Path, plugin_dir: &Path, bin_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            script_dir: script_dir.to_path_buf(),
            plugin_dir: plugin_dir.to_path_buf(),
            bin_dir: bin_dir.to_path_buf(),
        }
    }

    pub fn package_clonedir(&self) -> PathBuf {
        self.state_dir.join("clones").join("package")
    }

    pub fn source_clonedir(&self) -> PathBuf {
        self.state_dir.join("clones").join("source")
    }

    pub fn template_clonedir(&self) -> PathBuf {
        self.state_dir.join("clones").join("template")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.state_dir.join("scratch")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.state_dir.join("backups")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn testing_dir(&self) -> PathBuf {
        self.state_dir.join("testing")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.state_dir.join("manifest.json")
    }

    /// `<script_dir>/packages`, the subtree the engine owns.
    pub fn script_packages_dir(&self) -> PathBuf {
        self.script_dir.join("packages")
    }

    /// `<plugin_dir>/packages`, the subtree the engine owns.
    pub fn plugin_packages_dir(&self) -> PathBuf {
        self.plugin_dir.join("packages")
    }

    pub fn autoload_script(&self) -> PathBuf {
        self.script_packages_dir().join(AUTOLOAD_SCRIPT)
    }

    pub fn autoload_package(&self) -> PathBuf {
        self.script_packages_dir().join(AUTOLOAD_PACKAGE)
    }

    pub fn build_log(&self, package: &str) -> PathBuf {
        self.log_dir().join(format!("{package}-build.log"))
    }

    /// Create every directory the engine maintains.
    pub fn create_dirs(&self) -> Result<()> {
        for dir in [
            &self.state_dir,
            &self.package_clonedir(),
            &self.source_clonedir(),
            &self.template_clonedir(),
            &self.scratch_dir(),
            &self.backup_dir(),
            &self.log_dir(),
            &self.testing_dir(),
            &self.script_packages_dir(),
            &self.plugin_packages_dir(),
            &self.bin_dir,
        ] {
            fsutil::make_dir(dir)?;
        }
        Ok(())
    }
}

/// A set of staging locations a package installs into.
#[derive(Debug, Clone)]
pub struct Stage {
    /// Root of an ephemeral stage; `None` means the real installation
    /// directories.
    pub state_dir: Option<PathBuf>,
    pub clone_dir: PathBuf,
    /// The `packages/` script subtree of this stage.
    pub script_dir: PathBuf,
    /// The `packages/` plugin subtree of this stage.
    pub plugin_dir: PathBuf,
    pub bin_dir: PathBuf,
}

impl Stage {
    /// The real installation directories.
    pub fn real(layout: &StateLayout) -> Self {
        Self {
            state_dir: None,
            clone_dir: layout.package_clonedir(),
            script_dir: layout.script_packages_dir(),
            plugin_dir: layout.plugin_packages_dir(),
            bin_dir: layout.bin_dir.clone(),
        }
    }

    /// An ephemeral per-plan workspace mirroring the real stage. Clones
    /// stay in the real clone area; only artifacts land under `root`.
    pub fn workspace(layout: &StateLayout, root: &Path) -> Self {
        Self {
            state_dir: Some(root.to_path_buf()),
            clone_dir: layout.package_clonedir(),
            script_dir: root.join("scripts").join("packages"),
            plugin_dir: root.join("plugins").join("packages"),
            bin_dir: root.join("bin"),
        }
    }

    /// A dedicated per-test stage with its own clone area.
    pub fn testing(root: &Path) -> Self {
        Self {
            state_dir: Some(root.to_path_buf()),
            clone_dir: root.join("clones"),
            script_dir: root.join("scripts").join("packages"),
            plugin_dir: root.join("plugins").join("packages"),
            bin_dir: root.join("bin"),
        }
    }

    /// Create the stage's directories. An ephemeral stage is wiped first;
    /// a testing stage additionally symlinks the real package clones in so
    /// `%(package_base)s` references resolve to one location, with clones
    /// of packages under test later replacing those links.
    pub fn populate(&self, real_clone_dir: Option<&Path>) -> Result<()> {
        if let Some(root) = &self.state_dir {
            fsutil::delete_path(root)?;
        }
        for dir in [&self.clone_dir, &self.script_dir, &self.plugin_dir, &self.bin_dir] {
            fsutil::make_dir(dir)?;
        }

        if self.state_dir.is_some() {
            if let Some(real) = real_clone_dir {
                if real.is_dir() && real != self.clone_dir {
                    for entry in std::fs::read_dir(real)? {
                        let entry = entry?;
                        if entry.file_type()?.is_dir() {
                            fsutil::make_symlink(
                                &entry.path(),
                                &self.clone_dir.join(entry.file_name()),
                            )?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Seed this stage's artifact trees from another stage (used to give a
    /// plan workspace the pre-plan installed artifacts).
    pub fn seed_from(&self, other: &Stage) -> Result<()> {
        for (src, dst) in [
            (&other.script_dir, &self.script_dir),
            (&other.plugin_dir, &self.plugin_dir),
            (&other.bin_dir, &self.bin_dir),
        ] {
            if src.is_dir() {
                fsutil::copy_dir(src, dst)?;
            }
        }
        Ok(())
    }

    /// The environment for build/test subprocesses: stage bin dir first in
    /// `PATH`, stage trees first in the platform's script and plugin search
    /// paths.
    pub fn subprocess_env(&self, platform: &PlatformInfo) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = Vec::new();

        let path = std::env::var("PATH").unwrap_or_default();
        env.push((
            "PATH".to_string(),
            format!("{}:{path}", self.bin_dir.display()),
        ));

        let zeekpath = std::env::var("ZEEKPATH")
            .ok()
            .or_else(|| platform.zeekpath.clone())
            .unwrap_or_default();
        let script_root = self.script_dir.parent().unwrap_or(&self.script_dir);
        env.push((
            "ZEEKPATH".to_string(),
            format!("{}:{zeekpath}", script_root.display()),
        ));

        let plugin_path = std::env::var("ZEEK_PLUGIN_PATH")
            .ok()
            .or_else(|| platform.plugin_dir.as_ref().map(|p| p.display().to_string()))
            .unwrap_or_default();
        let plugin_root = self.plugin_dir.parent().unwrap_or(&self.plugin_dir);
        env.push((
            "ZEEK_PLUGIN_PATH".to_string(),
            format!("{}:{plugin_path}", plugin_root.display()),
        ));

        env
    }
}

/// Inputs the per-package staging step needs beyond the stage itself.
#[derive(Debug)]
pub struct StageContext<'a> {
    pub layout: &'a StateLayout,
    /// Config-level substitution pool (persisted user vars plus
    /// `zeek_dist`/`bro_dist`). `package_base` is added per-stage.
    pub substitutions: BTreeMap<String, String>,
    /// `--user-var` overrides; these beat environment variables, which in
    /// turn beat the persisted pool.
    pub cli_overrides: BTreeMap<String, String>,
    /// Environment for build subprocesses.
    pub env: Vec<(String, String)>,
}

/// Interpolate a package's metadata against the engine substitution pool.
///
/// The pool is the union of the context substitutions, `package_base`
/// (this stage's clone area), and, for variables the package declares in
/// `user_vars`, same-named environment variables and declared defaults.
pub fn interpolate_metadata(
    metadata: &PackageMetadata,
    package: &str,
    ctx: &StageContext<'_>,
    stage: &Stage,
) -> Result<PackageMetadata> {
    let user_vars = metadata.user_vars().ok_or_else(|| {
        ZkgError::bad_metadata(package, "package has malformed 'user_vars' metadata field")
    })?;

    let mut pool = ctx.substitutions.clone();
    pool.insert(
        "package_base".to_string(),
        stage.clone_dir.display().to_string(),
    );

    for var in &user_vars {
        if !ctx.cli_overrides.contains_key(var.name()) {
            if let Ok(value) = std::env::var(var.name()) {
                if !value.is_empty() {
                    pool.insert(var.name().to_string(), value);
                }
            }
        }
        if !pool.contains_key(var.name()) {
            if let Some(default) = var.default() {
                pool.insert(var.name().to_string(), default.to_string());
            }
        }
    }
    for (name, value) in &ctx.cli_overrides {
        pool.insert(name.clone(), value.clone());
    }

    metadata
        .interpolated(&pool)
        .map_err(|reason| ZkgError::bad_metadata(package, reason).into())
}

/// Run a package's `build_command`, capturing output to the build log.
pub async fn run_build(
    package: &Package,
    build_command: &str,
    clone_path: &Path,
    ctx: &StageContext<'_>,
) -> Result<()> {
    debug!(package = %package.name, %build_command, "running build_command");
    let progress = spinner(format!("building {}", package.name));

    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(build_command)
        .current_dir(clone_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &ctx.env {
        cmd.env(key, value);
    }

    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to spawn build_command for {}", package.name))?;

    let log_path = ctx.layout.build_log(&package.name);
    let mut log = Vec::new();
    log.extend_from_slice(b"=== STDERR ===\n");
    log.extend_from_slice(&output.stderr);
    log.extend_from_slice(b"=== STDOUT ===\n");
    log.extend_from_slice(&output.stdout);
    if let Err(e) = fsutil::atomic_write(&log_path, &log) {
        warn!(package = %package.name, error = %e, "failed to write build log");
    }

    progress.finish_and_clear();

    if !output.status.success() {
        return Err(ZkgError::BuildFailed {
            package: package.name.clone(),
            log: log_path.display().to_string(),
        }
        .into());
    }
    info!(package = %package.name, log = %log_path.display(), "build succeeded");
    Ok(())
}

/// Stage one package's artifacts into `stage`.
///
/// Returns the interpolated metadata so the caller can snapshot it into
/// the manifest.
pub async fn stage_package(
    package: &Package,
    clone_path: &Path,
    stage: &Stage,
    ctx: &StageContext<'_>,
) -> Result<PackageMetadata> {
    let raw = PackageMetadata::parse_dir(clone_path, &package.name)?;
    let metadata = interpolate_metadata(&raw, &package.name, ctx, stage)?;

    if let Some(build_command) = metadata.build_command() {
        run_build(package, build_command, clone_path, ctx).await?;
    }

    install_scripts(package, &metadata, clone_path, stage, &ctx.layout.scratch_dir())?;
    install_plugin(package, &metadata, clone_path, stage, &ctx.layout.scratch_dir())?;
    install_executables(package, &metadata, clone_path, stage)?;

    Ok(metadata)
}

/// Copy the package's script tree into the stage and maintain the
/// script-root symlinks (short name and aliases pointing at
/// `packages/<name>`).
fn install_scripts(
    package: &Package,
    metadata: &PackageMetadata,
    clone_path: &Path,
    stage: &Stage,
    scratch: &Path,
) -> Result<()> {
    let declared = metadata.script_dir();
    let script_src = clone_path.join(declared.unwrap_or(""));
    let script_dst = stage.script_dir.join(&package.name);

    if declared.is_some() && !script_src.exists() {
        return Err(ZkgError::Stage {
            operation: format!(
                "package's 'script_dir' does not exist: {}",
                declared.unwrap_or_default()
            ),
            path: script_src.display().to_string(),
        }
        .into());
    }

    let load_script = script_src.join("__load__.zeek");
    if load_script.is_file() {
        let script_root = stage
            .script_dir
            .parent()
            .unwrap_or(&stage.script_dir)
            .to_path_buf();
        let target = Path::new("packages").join(&package.name);
        fsutil::make_symlink(&target, &script_root.join(&package.name))?;
        for alias in metadata.aliases() {
            fsutil::make_symlink(&target, &script_root.join(alias))?;
        }

        fsutil::copy_over_path(&script_src, &script_dst, scratch)?;
    } else if declared.is_some() {
        return Err(ZkgError::Stage {
            operation: format!(
                "no __load__.zeek file found in package's 'script_dir': {}",
                declared.unwrap_or_default()
            ),
            path: script_src.display().to_string(),
        }
        .into());
    } else {
        warn!(
            package = %package.name,
            "no __load__.zeek in implicit script_dir, skipped installing scripts"
        );
    }

    Ok(())
}

/// Copy the package's plugin tree into the stage. A missing implicit
/// `build/` directory is common and only logged; a missing declared
/// directory is an error.
fn install_plugin(
    package: &Package,
    metadata: &PackageMetadata,
    clone_path: &Path,
    stage: &Stage,
    scratch: &Path,
) -> Result<()> {
    let plugin_dir = metadata.plugin_dir();
    let plugin_src = clone_path.join(plugin_dir);
    let plugin_dst = stage.plugin_dir.join(&package.name);

    if !plugin_src.exists() {
        info!(package = %package.name, %plugin_dir, "package 'plugin_dir' does not exist");
        if metadata.plugin_dir_declared() {
            return Err(ZkgError::Stage {
                operation: format!("package's 'plugin_dir' does not exist: {plugin_dir}"),
                path: plugin_src.display().to_string(),
            }
            .into());
        }
        return Ok(());
    }

    fsutil::copy_over_path(&plugin_src, &plugin_dst, scratch)
}

/// Verify listed executables and symlink them into the stage bin dir.
fn install_executables(
    package: &Package,
    metadata: &PackageMetadata,
    clone_path: &Path,
    stage: &Stage,
) -> Result<()> {
    for exe in metadata.executables() {
        let full = clone_path.join(&exe);
        if !full.is_file() {
            return Err(ZkgError::Stage {
                operation: format!("executable '{exe}' is missing"),
                path: full.display().to_string(),
            }
            .into());
        }
        if !fsutil::is_executable(&full) {
            return Err(ZkgError::Stage {
                operation: format!("file '{exe}' is not executable"),
                path: full.display().to_string(),
            }
            .into());
        }
        let link_name = Path::new(&exe)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        fsutil::make_symlink(&full, &stage.bin_dir.join(link_name))?;
    }
    Ok(())
}

/// Write the loader index: one `@load` directive per loaded package that
/// installed scripts. Regenerated wholesale, so loading twice cannot
/// duplicate a line.
pub fn write_autoloader(layout: &StateLayout, loaded_with_scripts: &[String]) -> Result<()> {
    let mut content = String::from(
        "# WARNING: This file is managed by zkg.\n# Do not make direct modifications here.\n",
    );
    for name in loaded_with_scripts {
        content.push_str(&format!("@load ./{name}\n"));
    }
    fsutil::atomic_write(&layout.autoload_script(), content.as_bytes())?;
    fsutil::make_symlink(Path::new(AUTOLOAD_SCRIPT), &layout.autoload_package())
}

/// Flip a package's plugin magic marker between its enabled and disabled
/// names. The platform only recognizes a plugin directory carrying the
/// enabled marker; both the current and the legacy marker names are
/// handled.
pub fn write_plugin_magic(layout: &StateLayout, package_name: &str, loaded: bool) {
    let package_dir = layout.plugin_packages_dir().join(package_name);
    let pairs = [
        (PLUGIN_MAGIC_FILE, PLUGIN_MAGIC_FILE_DISABLED),
        (LEGACY_PLUGIN_MAGIC_FILE, LEGACY_PLUGIN_MAGIC_FILE_DISABLED),
    ];

    for (enabled, disabled) in pairs {
        let enabled_path = package_dir.join(enabled);
        let disabled_path = package_dir.join(disabled);
        let result = if loaded {
            if disabled_path.exists() {
                std::fs::rename(&disabled_path, &enabled_path)
            } else {
                Ok(())
            }
        } else if enabled_path.exists() {
            std::fs::rename(&enabled_path, &disabled_path)
        } else {
            Ok(())
        };
        if let Err(e) = result {
            warn!(package = %package_name, error = %e, "could not toggle plugin marker");
        }
    }
}

/// Copy config files named in metadata to a temporary backup area before
/// an upgrade clobbers the clone. Returns (relative path, backup path)
/// pairs.
pub fn save_temporary_config_files(
    layout: &StateLayout,
    package: &Package,
) -> Result<Vec<(String, PathBuf)>> {
    let metadata = package.metadata_record();
    let clone_dir = layout.package_clonedir().join(&package.name);
    let mut saved = Vec::new();

    for config_file in metadata.config_files() {
        let src = clone_dir.join(&config_file);
        if !src.is_file() {
            info!(
                package = %package.name,
                %config_file,
                "package claims config file but it does not exist"
            );
            continue;
        }
        let backup = layout.scratch_dir().join("tmpcfg").join(&config_file);
        if let Some(parent) = backup.parent() {
            fsutil::make_dir(parent)?;
        }
        std::fs::copy(&src, &backup)?;
        saved.push((config_file, backup));
    }
    Ok(saved)
}

/// Config files the user has modified relative to the package's own copy.
/// Returns (relative path, installed path) pairs.
pub fn modified_config_files(
    layout: &StateLayout,
    package: &Package,
) -> Result<Vec<(String, PathBuf)>> {
    let metadata = package.metadata_record();
    let clone_dir = layout.package_clonedir().join(&package.name);
    let script_install = layout.script_packages_dir().join(&package.name);
    let plugin_install = layout.plugin_packages_dir().join(&package.name);
    let script_dir = metadata.script_dir().unwrap_or("").to_string();
    let plugin_dir = metadata.plugin_dir().to_string();
    let mut modified = Vec::new();

    for config_file in metadata.config_files() {
        let theirs = clone_dir.join(&config_file);
        if !theirs.is_file() {
            continue;
        }

        let ours = if !plugin_dir.is_empty() && config_file.starts_with(&plugin_dir) {
            plugin_install.join(config_file[plugin_dir.len()..].trim_start_matches('/'))
        } else if config_file.starts_with(&script_dir) {
            script_install.join(config_file[script_dir.len()..].trim_start_matches('/'))
        } else {
            warn!(
                package = %package.name,
                %config_file,
                "config file not within plugin_dir or script_dir"
            );
            continue;
        };

        if !ours.is_file() {
            continue;
        }
        if !fsutil::files_identical(&ours, &theirs)? {
            modified.push((config_file, ours));
        }
    }
    Ok(modified)
}

/// Back up modified config files under `backups/<subdir>/` with a
/// timestamp suffix; returns the backup paths in input order.
pub fn backup_modified_files(
    layout: &StateLayout,
    backup_subdir: &str,
    modified: &[(String, PathBuf)],
) -> Result<Vec<PathBuf>> {
    let timestamp = chrono::Local::now().format(".%Y-%m-%d-%H:%M:%S").to_string();
    let mut backups = Vec::new();

    for (config_file, installed) in modified {
        let rel_dir = Path::new(config_file).parent().unwrap_or(Path::new(""));
        let file_name = installed
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let backup_dir = layout.backup_dir().join(backup_subdir).join(rel_dir);
        fsutil::make_dir(&backup_dir)?;
        let backup_path = backup_dir.join(format!("{file_name}{timestamp}"));
        std::fs::copy(installed, &backup_path)?;
        backups.push(backup_path);
    }
    Ok(backups)
}

/// A spinner when stdout is a terminal, a hidden bar otherwise. Progress
/// rendering keys off the terminal alone so redirected output stays quiet.
pub fn spinner(message: String) -> ProgressBar {
    if std::io::stdout().is_terminal() {
        let bar = ProgressBar::new_spinner();
        bar.set_style(ProgressStyle::with_template("{spinner} {msg}").expect("static template"));
        bar.set_message(message);
        bar.enable_steady_tick(std::time::Duration::from_millis(120));
        bar
    } else {
        ProgressBar::hidden()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(root: &Path) -> StateLayout {
        StateLayout::new(
            &root.join("state"),
            &root.join("stage").join("scripts"),
            &root.join("stage").join("plugins"),
            &root.join("stage").join("bin"),
        )
    }

    #[test]
    fn layout_paths_follow_the_state_dir() {
        let layout = layout(Path::new("/x"));
        assert_eq!(layout.package_clonedir(), PathBuf::from("/x/state/clones/package"));
        assert_eq!(layout.source_clonedir(), PathBuf::from("/x/state/clones/source"));
        assert_eq!(layout.manifest_path(), PathBuf::from("/x/state/manifest.json"));
        assert_eq!(layout.build_log("foo"), PathBuf::from("/x/state/logs/foo-build.log"));
        assert_eq!(
            layout.autoload_script(),
            PathBuf::from("/x/stage/scripts/packages/packages.zeek")
        );
    }

    #[test]
    fn autoloader_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        layout.create_dirs().unwrap();

        write_autoloader(&layout, &["foo".to_string(), "bar".to_string()]).unwrap();
        write_autoloader(&layout, &["foo".to_string(), "bar".to_string()]).unwrap();

        let content = std::fs::read_to_string(layout.autoload_script()).unwrap();
        assert_eq!(content.matches("@load ./foo").count(), 1);
        assert_eq!(content.matches("@load ./bar").count(), 1);

        write_autoloader(&layout, &[]).unwrap();
        let content = std::fs::read_to_string(layout.autoload_script()).unwrap();
        assert!(!content.contains("@load"));
    }

    #[test]
    fn plugin_magic_toggles_both_marker_names() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        let pkg_dir = layout.plugin_packages_dir().join("foo");
        fsutil::make_dir(&pkg_dir).unwrap();
        std::fs::write(pkg_dir.join(PLUGIN_MAGIC_FILE), "").unwrap();

        write_plugin_magic(&layout, "foo", false);
        assert!(pkg_dir.join(PLUGIN_MAGIC_FILE_DISABLED).exists());
        assert!(!pkg_dir.join(PLUGIN_MAGIC_FILE).exists());

        write_plugin_magic(&layout, "foo", true);
        assert!(pkg_dir.join(PLUGIN_MAGIC_FILE).exists());
        assert!(!pkg_dir.join(PLUGIN_MAGIC_FILE_DISABLED).exists());

        // Toggling again in the same direction is a no-op.
        write_plugin_magic(&layout, "foo", true);
        assert!(pkg_dir.join(PLUGIN_MAGIC_FILE).exists());
    }

    #[test]
    fn workspace_stage_mirrors_real_layout() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        let ws_root = layout.scratch_dir().join("stage");
        let stage = Stage::workspace(&layout, &ws_root);

        assert_eq!(stage.clone_dir, layout.package_clonedir());
        assert!(stage.script_dir.starts_with(&ws_root));
        assert!(stage.bin_dir.starts_with(&ws_root));
    }

    #[test]
    fn testing_stage_links_existing_clones() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        layout.create_dirs().unwrap();
        fsutil::make_dir(&layout.package_clonedir().join("installed-pkg")).unwrap();

        let stage = Stage::testing(&layout.testing_dir().join("foo"));
        stage.populate(Some(&layout.package_clonedir())).unwrap();

        let link = stage.clone_dir.join("installed-pkg");
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    }

    #[test]
    fn subprocess_env_prepends_stage_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        let stage = Stage::real(&layout);
        let env = stage.subprocess_env(&PlatformInfo::default());

        let path = env.iter().find(|(k, _)| k == "PATH").unwrap();
        assert!(path.1.starts_with(&format!("{}:", stage.bin_dir.display())));
        let zeekpath = env.iter().find(|(k, _)| k == "ZEEKPATH").unwrap();
        assert!(zeekpath.1.starts_with(&layout.script_dir.display().to_string()));
    }

    #[tokio::test]
    async fn stage_package_installs_scripts_and_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        layout.create_dirs().unwrap();

        let clone = dir.path().join("clone");
        std::fs::create_dir_all(clone.join("scripts")).unwrap();
        std::fs::write(clone.join("scripts/__load__.zeek"), "@load ./main\n").unwrap();
        std::fs::write(clone.join("scripts/main.zeek"), "event zeek_init() {}\n").unwrap();
        std::fs::write(
            clone.join(crate::meta::METADATA_FILENAME),
            "[package]\nscript_dir = scripts\naliases = frob\n",
        )
        .unwrap();

        let package = Package::from_url("https://example.com/alice/foo");
        let stage = Stage::real(&layout);
        let ctx = StageContext {
            layout: &layout,
            substitutions: BTreeMap::new(),
            cli_overrides: BTreeMap::new(),
            env: Vec::new(),
        };

        stage_package(&package, &clone, &stage, &ctx).await.unwrap();

        assert!(layout.script_packages_dir().join("foo/main.zeek").is_file());
        let alias = layout.script_dir.join("frob");
        assert!(std::fs::symlink_metadata(&alias).unwrap().file_type().is_symlink());
        let name_link = layout.script_dir.join("foo");
        assert!(std::fs::symlink_metadata(&name_link).unwrap().file_type().is_symlink());
    }

    #[tokio::test]
    async fn declared_script_dir_without_load_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        layout.create_dirs().unwrap();

        let clone = dir.path().join("clone");
        std::fs::create_dir_all(clone.join("scripts")).unwrap();
        std::fs::write(
            clone.join(crate::meta::METADATA_FILENAME),
            "[package]\nscript_dir = scripts\n",
        )
        .unwrap();

        let package = Package::from_url("https://example.com/alice/foo");
        let ctx = StageContext {
            layout: &layout,
            substitutions: BTreeMap::new(),
            cli_overrides: BTreeMap::new(),
            env: Vec::new(),
        };
        let err = stage_package(&package, &clone, &Stage::real(&layout), &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("__load__.zeek"));
    }

    #[tokio::test]
    async fn build_failure_references_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        layout.create_dirs().unwrap();

        let clone = dir.path().join("clone");
        std::fs::create_dir_all(&clone).unwrap();
        std::fs::write(
            clone.join(crate::meta::METADATA_FILENAME),
            "[package]\nbuild_command = echo nope >&2 && false\n",
        )
        .unwrap();

        let package = Package::from_url("https://example.com/alice/foo");
        let ctx = StageContext {
            layout: &layout,
            substitutions: BTreeMap::new(),
            cli_overrides: BTreeMap::new(),
            env: Vec::new(),
        };
        let err = stage_package(&package, &clone, &Stage::real(&layout), &ctx)
            .await
            .unwrap_err();
        let err = err.downcast::<ZkgError>().unwrap();
        assert!(matches!(err, ZkgError::BuildFailed { .. }));

        let log = std::fs::read_to_string(layout.build_log("foo")).unwrap();
        assert!(log.contains("=== STDERR ==="));
        assert!(log.contains("nope"));
    }

    #[tokio::test]
    async fn build_env_reaches_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        layout.create_dirs().unwrap();

        let clone = dir.path().join("clone");
        std::fs::create_dir_all(&clone).unwrap();
        std::fs::write(
            clone.join(crate::meta::METADATA_FILENAME),
            "[package]\nuser_vars =\n\tLAST_VAR [] \"sandbox path\"\nbuild_command = echo sandbox is %(LAST_VAR)s\n",
        )
        .unwrap();

        let package = Package::from_url("https://example.com/alice/foo");
        let mut substitutions = BTreeMap::new();
        substitutions.insert("LAST_VAR".to_string(), "/home/x/sandbox".to_string());
        let ctx = StageContext {
            layout: &layout,
            substitutions,
            cli_overrides: BTreeMap::new(),
            env: Vec::new(),
        };
        stage_package(&package, &clone, &Stage::real(&layout), &ctx)
            .await
            .unwrap();

        let log = std::fs::read_to_string(layout.build_log("foo")).unwrap();
        assert!(log.contains("/home/x/sandbox"), "log was: {log}");
    }
}
