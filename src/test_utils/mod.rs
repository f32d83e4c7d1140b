//! Test fixtures: throwaway state directories and real local git
//! repositories for exercising the engine hermetically.
//!
//! Fixture repositories live in temp directories and are addressed by
//! filesystem path, so clone/fetch/checkout go through the ordinary git
//! driver without any network access.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use crate::config::Config;
use crate::git::GitCli;
use crate::manager::Manager;
use crate::platform::{BuiltinCapability, PlatformInfo};

/// Run a git command in a fixture repo, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("git not runnable");
    assert!(
        output.status.success(),
        "git {args:?} in {} failed: {}",
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// A local git repository acting as a package, source, or template.
pub struct GitRepoFixture {
    pub dir: PathBuf,
}

impl GitRepoFixture {
    /// Initialize an empty repository with a `main` default branch and
    /// commit identity configured.
    pub fn init(dir: PathBuf) -> Self {
        std::fs::create_dir_all(&dir).expect("fixture dir");
        git(&dir, &["init", "-b", "main"]);
        git(&dir, &["config", "user.email", "tester@example.com"]);
        git(&dir, &["config", "user.name", "Tester"]);
        Self { dir }
    }

    /// The URL packages use to reach this repository.
    pub fn url(&self) -> String {
        self.dir.display().to_string()
    }

    /// Write a file (creating parents) without committing.
    pub fn write(&self, rel: &str, content: &str) {
        let path = self.dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("fixture parents");
        }
        std::fs::write(path, content).expect("fixture write");
    }

    /// Write an executable file.
    #[cfg(unix)]
    pub fn write_executable(&self, rel: &str, content: &str) {
        use std::os::unix::fs::PermissionsExt;
        self.write(rel, content);
        let path = self.dir.join(rel);
        let mut perm = std::fs::metadata(&path).expect("fixture stat").permissions();
        perm.set_mode(0o755);
        std::fs::set_permissions(&path, perm).expect("fixture chmod");
    }

    /// Stage everything and commit.
    pub fn commit(&self, message: &str) {
        git(&self.dir, &["add", "--all"]);
        git(&self.dir, &["commit", "--no-verify", "-m", message]);
    }

    /// Create a tag at HEAD.
    pub fn tag(&self, name: &str) {
        git(&self.dir, &["tag", name]);
    }

    /// Create and switch to a branch.
    pub fn branch(&self, name: &str) {
        git(&self.dir, &["checkout", "-b", name]);
    }

    pub fn checkout(&self, name: &str) {
        git(&self.dir, &["checkout", name]);
    }
}

/// A complete throwaway engine environment: state dir, stage dirs, and a
/// place to put fixture repositories.
pub struct TestEnvironment {
    root: tempfile::TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().expect("test env root"),
        }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// A configuration pointing all state and stage dirs into the
    /// environment.
    pub fn config(&self) -> Config {
        let mut config = Config {
            state_dir: self.path().join("state"),
            script_dir: self.path().join("stage").join("scripts"),
            plugin_dir: self.path().join("stage").join("plugins"),
            bin_dir: Some(self.path().join("stage").join("bin")),
            ..Config::default()
        };
        config.apply_defaults();
        config
    }

    /// A manager over this environment with a fixed platform version and
    /// no built-in capabilities.
    pub fn manager(&self) -> Manager {
        self.manager_with_platform(PlatformInfo::from_parts(Some("6.0.0".into()), []))
    }

    /// A manager with specific built-in capabilities advertised.
    pub fn manager_with_capabilities(
        &self,
        capabilities: Vec<BuiltinCapability>,
    ) -> Manager {
        self.manager_with_platform(PlatformInfo::from_parts(Some("6.0.0".into()), capabilities))
    }

    pub fn manager_with_platform(&self, platform: PlatformInfo) -> Manager {
        Manager::new(self.config(), Arc::new(GitCli), platform).expect("manager")
    }

    /// Create a package fixture repository under `repos/<name>` with the
    /// given `zkg.meta` content and an initial commit.
    pub fn package_repo(&self, name: &str, meta: &str) -> GitRepoFixture {
        let repo = GitRepoFixture::init(self.path().join("repos").join(name));
        repo.write("zkg.meta", meta);
        repo.write("scripts/__load__.zeek", "@load ./main\n");
        repo.write("scripts/main.zeek", "event zeek_init() { }\n");
        repo.commit("Initial commit");
        repo
    }

    /// Create a source fixture listing the given package URLs in its
    /// root `zkg.index`.
    pub fn source_repo(&self, name: &str, package_urls: &[&str]) -> GitRepoFixture {
        let repo = GitRepoFixture::init(self.path().join("sources").join(name));
        repo.write("zkg.index", &format!("{}\n", package_urls.join("\n")));
        repo.commit("Add package index");
        repo
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

/// A minimal `zkg.meta` declaring a script-only package.
pub fn script_package_meta() -> String {
    "[package]\ndescription = A test package\nscript_dir = scripts\n".to_string()
}
