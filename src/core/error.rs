//! Error handling for zkg.
//!
//! The error system is built around a single strongly-typed enum,
//! [`ZkgError`], with one variant per failure category the engine can hit.
//! Call sites propagate errors through [`anyhow::Result`] with `.context()`
//! so that CLI output keeps the original error kind intact while adding
//! operation-level detail.
//!
//! # Error Categories
//!
//! - **Metadata**: [`ZkgError::BadMetadata`] for malformed package metadata
//! - **Resolution**: [`ZkgError::Dependency`], [`ZkgError::VersionResolution`],
//!   [`ZkgError::AliasConflict`]
//! - **Pipeline**: [`ZkgError::BuildFailed`], [`ZkgError::TestFailed`],
//!   [`ZkgError::Stage`]
//! - **State**: [`ZkgError::Manifest`], [`ZkgError::Lock`]
//! - **Git**: [`ZkgError::GitNotFound`], [`ZkgError::GitCommand`],
//!   [`ZkgError::GitClone`], [`ZkgError::GitCheckout`]

use thiserror::Error;

/// The main error type for zkg operations.
///
/// Each variant names the offending entity so callers can surface a
/// precise message without re-parsing error strings.
#[derive(Error, Debug)]
pub enum ZkgError {
    /// Malformed package metadata; aborts the package's inclusion in a plan.
    #[error("bad metadata for package '{package}': {reason}")]
    BadMetadata {
        /// Name or URL of the package whose metadata is malformed
        package: String,
        /// What exactly is wrong, naming the offending field
        reason: String,
    },

    /// Unsatisfiable constraint intersection, missing dependency, or a
    /// circular dependency chain.
    #[error("dependency error: {reason}")]
    Dependency {
        /// Human-readable description naming requesters and constraints
        reason: String,
    },

    /// An alias collides with an already-installed package.
    #[error("alias conflict: {reason}")]
    AliasConflict {
        /// Which alias collides and with which installed package
        reason: String,
    },

    /// No candidate version of a package satisfies all constraints.
    #[error("no version of '{package}' satisfies constraints: {reason}")]
    VersionResolution {
        /// The package that could not be resolved
        package: String,
        /// The constraints that could not be met
        reason: String,
    },

    /// A package `build_command` returned a non-zero exit code.
    #[error("build of '{package}' failed, see log in {log}")]
    BuildFailed {
        /// The package whose build failed
        package: String,
        /// Path to the captured build log
        log: String,
    },

    /// A package `test_command` returned a non-zero exit code.
    #[error("tests for '{package}' failed with exit code {code}")]
    TestFailed {
        /// The package whose tests failed
        package: String,
        /// The exit code of the test command
        code: i32,
        /// Directory preserving test stdout/stderr for inspection
        dir: String,
    },

    /// A filesystem operation in the staging pipeline failed.
    #[error("stage error: {operation} at {path}")]
    Stage {
        /// The staging operation that failed
        operation: String,
        /// The path it failed on
        path: String,
    },

    /// The on-disk manifest is corrupt or its schema is unreadable.
    #[error("manifest error in {file}: {reason}")]
    Manifest {
        /// Path to the manifest file
        file: String,
        /// Why it could not be read or migrated
        reason: String,
    },

    /// Another engine instance holds the state-directory lock.
    #[error("state directory is locked by another zkg process: {path}")]
    Lock {
        /// Path to the lock file
        path: String,
    },

    /// Git executable not found in PATH.
    #[error("git is not installed or not found in PATH")]
    GitNotFound,

    /// A git command returned a non-zero exit code.
    #[error("git {operation} failed: {stderr}")]
    GitCommand {
        /// The git operation that failed (e.g. "fetch", "checkout")
        operation: String,
        /// The error output from the git command
        stderr: String,
    },

    /// Cloning a repository failed.
    #[error("failed to clone repository: {url}")]
    GitClone {
        /// The repository URL that failed to clone
        url: String,
        /// The reason reported by git
        reason: String,
    },

    /// Checking out a reference failed.
    #[error("failed to checkout '{reference}': {reason}")]
    GitCheckout {
        /// The tag, branch, or commit that failed to check out
        reference: String,
        /// The reason reported by git
        reason: String,
    },

    /// User configuration file problems.
    #[error("configuration error: {reason}")]
    Config {
        /// Description of the configuration problem
        reason: String,
    },

    /// Template control file or instantiation problems.
    #[error("template error: {reason}")]
    Template {
        /// Description of the template problem
        reason: String,
    },

    /// Bundle archive problems.
    #[error("bundle error: {reason}")]
    Bundle {
        /// Description of the bundle problem
        reason: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (manifest) parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Semantic version parsing error.
    #[error("semver error: {0}")]
    Semver(#[from] semver::Error),
}

impl ZkgError {
    /// Shorthand for a [`ZkgError::Dependency`] with a formatted reason.
    pub fn dependency(reason: impl Into<String>) -> Self {
        Self::Dependency {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`ZkgError::Stage`] naming the operation and path.
    pub fn stage(operation: impl Into<String>, path: impl AsRef<std::path::Path>) -> Self {
        Self::Stage {
            operation: operation.into(),
            path: path.as_ref().display().to_string(),
        }
    }

    /// Shorthand for a [`ZkgError::BadMetadata`].
    pub fn bad_metadata(package: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BadMetadata {
            package: package.into(),
            reason: reason.into(),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = anyhow::Result<T>;
