//! Typed builder for invocations of the system `git` binary.
//!
//! Every git operation in the engine goes through [`GitCommand`], which
//! assembles arguments as discrete parameters (never a shell string),
//! captures stdout/stderr, and converts non-zero exits into
//! [`ZkgError::GitCommand`] with the stderr attached. Network-facing
//! operations (clone/fetch/pull/push/ls-remote) get a small bounded retry
//! with exponential backoff before the failure is surfaced.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::debug;

use crate::core::ZkgError;

/// Number of attempts for network-facing git operations.
const NETWORK_RETRIES: usize = 3;

/// A single git command invocation under construction.
#[derive(Debug, Clone)]
pub struct GitCommand {
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
    retry_network: bool,
    context: Option<String>,
}

/// Captured output of a completed git command.
#[derive(Debug)]
pub struct GitCommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl GitCommand {
    pub fn new() -> Self {
        Self {
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
            retry_network: false,
            context: None,
        }
    }

    /// Set the working directory for the invocation.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Label used in the error when the command fails.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Clone a repository. `shallow` requests `--depth 1 --no-single-branch`,
    /// which the callers only use when the target ref is a tag or branch.
    pub fn clone_repo(url: &str, target: impl AsRef<Path>, shallow: bool) -> Self {
        let mut cmd = Self::new()
            .arg("clone")
            .arg("--recurse-submodules")
            .with_context(format!("clone {url}"));
        if shallow {
            cmd = cmd.args(["--depth", "1", "--no-single-branch"]);
        }
        cmd.retry_network = true;
        cmd.arg(url).arg(target.as_ref().display().to_string())
    }

    pub fn fetch() -> Self {
        let mut cmd = Self::new()
            .args(["fetch", "--tags", "--recurse-submodules=yes"])
            .with_context("fetch");
        cmd.retry_network = true;
        cmd
    }

    pub fn pull() -> Self {
        let mut cmd = Self::new()
            .args(["pull", "--recurse-submodules=yes"])
            .with_context("pull");
        cmd.retry_network = true;
        cmd
    }

    pub fn push() -> Self {
        let mut cmd = Self::new().args(["push", "--no-verify"]).with_context("push");
        cmd.retry_network = true;
        cmd
    }

    pub fn checkout(ref_name: &str) -> Self {
        Self::new()
            .args(["checkout", "--recurse-submodules", ref_name])
            .with_context(format!("checkout {ref_name}"))
    }

    pub fn list_tags() -> Self {
        Self::new().args(["tag", "--list"]).with_context("tag --list")
    }

    pub fn list_remote_branches() -> Self {
        Self::new()
            .args(["branch", "--remotes", "--format=%(refname:short)"])
            .with_context("branch --remotes")
    }

    pub fn rev_parse(ref_name: &str) -> Self {
        Self::new()
            .args(["rev-parse", ref_name])
            .with_context(format!("rev-parse {ref_name}"))
    }

    pub fn cat_file_commit(text: &str) -> Self {
        Self::new()
            .args(["cat-file", "-t", text])
            .with_context(format!("cat-file {text}"))
    }

    pub fn symbolic_ref_head() -> Self {
        Self::new()
            .args(["symbolic-ref", "refs/remotes/origin/HEAD", "--short"])
            .with_context("symbolic-ref origin/HEAD")
    }

    pub fn remote_url() -> Self {
        Self::new()
            .args(["config", "--local", "--get", "remote.origin.url"])
            .with_context("get remote url")
    }

    pub fn archive(ref_name: &str, output: impl AsRef<Path>) -> Self {
        Self::new()
            .arg("archive")
            .arg("--format=tar")
            .arg(format!("--output={}", output.as_ref().display()))
            .arg(ref_name)
            .with_context(format!("archive {ref_name}"))
    }

    pub fn submodule_update() -> Self {
        Self::new()
            .args(["submodule", "update", "--init", "--recursive"])
            .with_context("submodule update")
    }

    pub fn init() -> Self {
        Self::new().arg("init").with_context("init")
    }

    pub fn add_all() -> Self {
        Self::new().args(["add", "--all"]).with_context("add --all")
    }

    pub fn commit(message: &str) -> Self {
        Self::new()
            .args(["commit", "--no-verify", "--message", message])
            .with_context("commit")
    }

    pub fn reset_hard() -> Self {
        Self::new().args(["reset", "--hard"]).with_context("reset --hard")
    }

    pub fn clean_untracked() -> Self {
        Self::new().args(["clean", "-f", "-x", "-d"]).with_context("clean")
    }

    pub fn status_porcelain() -> Self {
        Self::new()
            .args(["status", "--porcelain"])
            .with_context("status")
    }

    pub fn count_behind(branch: &str) -> Self {
        Self::new()
            .args(["rev-list", "--count"])
            .arg(format!("{branch}..origin/{branch}"))
            .with_context(format!("rev-list {branch}..origin/{branch}"))
    }

    /// Run the command, returning captured output or a [`ZkgError`].
    pub async fn execute(self) -> Result<GitCommandOutput> {
        let attempts = if self.retry_network { NETWORK_RETRIES } else { 1 };
        let strategy = ExponentialBackoff::from_millis(250)
            .max_delay(Duration::from_secs(5))
            .take(attempts - 1);

        let this = self;
        Retry::spawn(strategy, move || {
            let cmd = this.clone();
            async move { cmd.execute_once().await }
        })
        .await
    }

    async fn execute_once(self) -> Result<GitCommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(&self.args);
        // Never fall back to interactive credential prompting; a missing
        // credential should fail the command, not hang the engine.
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        debug!(args = ?self.args, cwd = ?self.current_dir, "running git");

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                anyhow::Error::from(ZkgError::GitNotFound)
            } else {
                anyhow::Error::from(e).context("failed to spawn git")
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let operation = self
                .context
                .unwrap_or_else(|| self.args.first().cloned().unwrap_or_default());
            return Err(ZkgError::GitCommand {
                operation,
                stderr: if stderr.trim().is_empty() {
                    format!("exit code {:?}", output.status.code())
                } else {
                    stderr.trim().to_string()
                },
            }
            .into());
        }

        Ok(GitCommandOutput { stdout, stderr })
    }

    /// Run the command and return trimmed stdout.
    pub async fn execute_stdout(self) -> Result<String> {
        Ok(self.execute().await?.stdout.trim().to_string())
    }

    /// Run the command, discarding output.
    pub async fn execute_success(self) -> Result<()> {
        self.execute().await.map(|_| ())
    }
}

impl Default for GitCommand {
    fn default() -> Self {
        Self::new()
    }
}

/// Check that a git binary is invocable at all.
pub async fn ensure_git_available() -> Result<()> {
    GitCommand::new()
        .arg("--version")
        .with_context("version probe")
        .execute_success()
        .await
        .context("git is required for all package operations")
}
