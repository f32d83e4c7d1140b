//! VCS driver: typed operations over one git repository.
//!
//! The engine performs no network transport of its own; everything remote
//! goes through the system `git` binary (the same approach Cargo takes with
//! `git-fetch-with-cli`), which keeps SSH agents, credential helpers, and
//! platform git configuration working untouched.
//!
//! The driver is split in two:
//!
//! - [`GitCommand`]: a typed builder for individual git invocations.
//! - [`Vcs`]: the capability trait the rest of the engine consumes, with
//!   [`GitCli`] as the production implementation. Tests substitute their
//!   own driver (or drive `GitCli` against local fixture repositories).
//!
//! Interrupted clones are tolerated: [`ensure_clone`] detects a directory
//! that is not a valid repository (or whose remote no longer matches) and
//! re-clones it on next use rather than failing.

pub mod command_builder;

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::core::fsutil;
use crate::core::ZkgError;
pub use command_builder::{ensure_git_available, GitCommand, GitCommandOutput};

/// Capability set over a single repository working copy.
///
/// All paths refer to the repository root on the local filesystem. The
/// trait exists so the resolver and pipeline can be exercised against a
/// substitute driver; production code uses [`GitCli`].
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Clone `url` into `dest`. Shallow clones are requested only when the
    /// target ref is a tag or branch, never a raw commit hash.
    async fn clone_repo(&self, url: &str, dest: &Path, shallow: bool) -> Result<()>;

    /// Fetch tags and refs from origin.
    async fn fetch(&self, repo: &Path) -> Result<()>;

    /// Pull the current branch up to the remote tip.
    async fn pull(&self, repo: &Path) -> Result<()>;

    /// All tag names in the repository.
    async fn list_tags(&self, repo: &Path) -> Result<Vec<String>>;

    /// All remote branch names, without the `origin/` prefix.
    async fn list_branches(&self, repo: &Path) -> Result<Vec<String>>;

    /// Check out a tag, branch, or commit.
    async fn checkout(&self, repo: &Path, reference: &str) -> Result<()>;

    /// The commit hash of HEAD.
    async fn current_commit(&self, repo: &Path) -> Result<String>;

    /// The default branch name as advertised by origin, falling back to
    /// whichever of `main`/`master` exists.
    async fn default_branch(&self, repo: &Path) -> Result<String>;

    /// Write a tar archive of `reference` to `dest`.
    async fn archive(&self, repo: &Path, reference: &str, dest: &Path) -> Result<()>;

    /// Initialize submodules recursively.
    async fn submodule_update(&self, repo: &Path) -> Result<()>;

    /// `git init` a fresh repository.
    async fn init(&self, dest: &Path) -> Result<()>;

    /// Stage all content and commit; returns the new commit hash.
    async fn commit_all(&self, repo: &Path, message: &str) -> Result<String>;

    /// Discard local modifications and untracked files.
    async fn reset_clean(&self, repo: &Path) -> Result<()>;

    /// Whether the working tree has uncommitted changes.
    async fn is_dirty(&self, repo: &Path) -> Result<bool>;

    /// Whether `text` names a commit object in the repository.
    async fn is_commit(&self, repo: &Path, text: &str) -> bool;

    /// The configured origin URL.
    async fn remote_url(&self, repo: &Path) -> Result<String>;

    /// Stage a single path (used when pushing aggregated metadata).
    async fn add_path(&self, repo: &Path, path: &str) -> Result<()>;

    /// Push the current branch.
    async fn push(&self, repo: &Path) -> Result<()>;

    /// Number of commits the local `branch` is behind `origin/branch`.
    async fn commits_behind(&self, repo: &Path, branch: &str) -> Result<u64>;

    /// Whether `path` holds a valid (non-partial) repository.
    fn is_valid_repo(&self, path: &Path) -> bool;
}

/// Production [`Vcs`] implementation backed by the system git binary.
#[derive(Debug, Default, Clone)]
pub struct GitCli;

#[async_trait]
impl Vcs for GitCli {
    async fn clone_repo(&self, url: &str, dest: &Path, shallow: bool) -> Result<()> {
        GitCommand::clone_repo(url, dest, shallow)
            .execute_success()
            .await
            .map_err(|e| match e.downcast::<ZkgError>() {
                Ok(ZkgError::GitCommand { stderr, .. }) => ZkgError::GitClone {
                    url: url.to_string(),
                    reason: stderr,
                }
                .into(),
                Ok(other) => other.into(),
                Err(e) => e,
            })
    }

    async fn fetch(&self, repo: &Path) -> Result<()> {
        GitCommand::fetch().current_dir(repo).execute_success().await
    }

    async fn pull(&self, repo: &Path) -> Result<()> {
        GitCommand::pull().current_dir(repo).execute_success().await
    }

    async fn list_tags(&self, repo: &Path) -> Result<Vec<String>> {
        let out = GitCommand::list_tags()
            .current_dir(repo)
            .execute_stdout()
            .await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    async fn list_branches(&self, repo: &Path) -> Result<Vec<String>> {
        let out = GitCommand::list_remote_branches()
            .current_dir(repo)
            .execute_stdout()
            .await?;
        Ok(out
            .lines()
            .filter_map(|l| l.strip_prefix("origin/"))
            .filter(|l| *l != "HEAD")
            .map(str::to_string)
            .collect())
    }

    async fn checkout(&self, repo: &Path, reference: &str) -> Result<()> {
        GitCommand::checkout(reference)
            .current_dir(repo)
            .execute_success()
            .await
            .map_err(|e| match e.downcast::<ZkgError>() {
                Ok(ZkgError::GitCommand { stderr, .. }) => ZkgError::GitCheckout {
                    reference: reference.to_string(),
                    reason: stderr,
                }
                .into(),
                Ok(other) => other.into(),
                Err(e) => e,
            })
    }

    async fn current_commit(&self, repo: &Path) -> Result<String> {
        GitCommand::rev_parse("HEAD")
            .current_dir(repo)
            .execute_stdout()
            .await
    }

    async fn default_branch(&self, repo: &Path) -> Result<String> {
        if let Ok(head) = GitCommand::symbolic_ref_head()
            .current_dir(repo)
            .execute_stdout()
            .await
        {
            if let Some(branch) = head.strip_prefix("origin/") {
                return Ok(branch.to_string());
            }
        }

        // Repositories cloned shallowly or created locally may not carry an
        // origin/HEAD ref; probe the conventional names.
        for candidate in ["main", "master"] {
            if GitCommand::rev_parse(&format!("refs/heads/{candidate}"))
                .current_dir(repo)
                .execute_success()
                .await
                .is_ok()
            {
                return Ok(candidate.to_string());
            }
        }

        Err(ZkgError::GitCommand {
            operation: "default branch discovery".into(),
            stderr: format!("no origin/HEAD, main, or master in {}", repo.display()),
        }
        .into())
    }

    async fn archive(&self, repo: &Path, reference: &str, dest: &Path) -> Result<()> {
        GitCommand::archive(reference, dest)
            .current_dir(repo)
            .execute_success()
            .await
    }

    async fn submodule_update(&self, repo: &Path) -> Result<()> {
        GitCommand::submodule_update()
            .current_dir(repo)
            .execute_success()
            .await
    }

    async fn init(&self, dest: &Path) -> Result<()> {
        GitCommand::init().current_dir(dest).execute_success().await
    }

    async fn commit_all(&self, repo: &Path, message: &str) -> Result<String> {
        GitCommand::add_all()
            .current_dir(repo)
            .execute_success()
            .await?;
        GitCommand::commit(message)
            .current_dir(repo)
            .execute_success()
            .await?;
        self.current_commit(repo).await
    }

    async fn reset_clean(&self, repo: &Path) -> Result<()> {
        GitCommand::reset_hard()
            .current_dir(repo)
            .execute_success()
            .await?;
        GitCommand::clean_untracked()
            .current_dir(repo)
            .execute_success()
            .await
    }

    async fn is_dirty(&self, repo: &Path) -> Result<bool> {
        let out = GitCommand::status_porcelain()
            .current_dir(repo)
            .execute_stdout()
            .await?;
        Ok(!out.is_empty())
    }

    async fn is_commit(&self, repo: &Path, text: &str) -> bool {
        // Only full or abbreviated hex hashes qualify; branch and tag names
        // would also cat-file as commits.
        if text.len() < 7 || !text.chars().all(|c| c.is_ascii_hexdigit()) {
            return false;
        }
        matches!(
            GitCommand::cat_file_commit(text)
                .current_dir(repo)
                .execute_stdout()
                .await
                .as_deref(),
            Ok("commit")
        )
    }

    async fn remote_url(&self, repo: &Path) -> Result<String> {
        GitCommand::remote_url()
            .current_dir(repo)
            .execute_stdout()
            .await
    }

    async fn add_path(&self, repo: &Path, path: &str) -> Result<()> {
        GitCommand::new()
            .arg("add")
            .arg(path)
            .with_context(format!("add {path}"))
            .current_dir(repo)
            .execute_success()
            .await
    }

    async fn push(&self, repo: &Path) -> Result<()> {
        GitCommand::push().current_dir(repo).execute_success().await
    }

    async fn commits_behind(&self, repo: &Path, branch: &str) -> Result<u64> {
        let out = GitCommand::count_behind(branch)
            .current_dir(repo)
            .execute_stdout()
            .await?;
        out.parse()
            .with_context(|| format!("unexpected rev-list output: {out}"))
    }

    fn is_valid_repo(&self, path: &Path) -> bool {
        path.join(".git").exists()
    }
}

/// Ensure a usable clone of `url` exists at `dest`.
///
/// A missing directory is cloned fresh. A directory that is not a valid
/// repository (a clone interrupted mid-transfer) or whose origin URL no
/// longer matches is deleted and re-cloned.
pub async fn ensure_clone(vcs: &dyn Vcs, url: &str, dest: &Path, shallow: bool) -> Result<()> {
    if dest.exists() {
        if vcs.is_valid_repo(dest) {
            match vcs.remote_url(dest).await {
                Ok(existing) if existing == url => return Ok(()),
                Ok(existing) => {
                    debug!(%url, %existing, path = %dest.display(), "remote changed, recloning");
                }
                Err(_) => {
                    debug!(path = %dest.display(), "cannot read remote, recloning");
                }
            }
        } else {
            debug!(path = %dest.display(), "partial clone detected, recloning");
        }
        fsutil::delete_path(dest)?;
    }

    vcs.clone_repo(url, dest, shallow).await
}
