//! zkg - package manager for Zeek-style network-security analysis
//! platforms.
//!
//! The engine resolves, fetches, builds, tests, installs, upgrades,
//! bundles, and removes third-party packages (version-controlled source
//! repositories carrying scripts and/or native plugins) into one or more
//! installation trees on the local host.
//!
//! # Architecture Overview
//!
//! Everything revolves around a state directory holding long-lived git
//! clones, a JSON manifest of installed packages, and scratch space for
//! transactional operations:
//!
//! - [`meta`] - package metadata model (INI with `%(name)s` interpolation)
//! - [`config`] - the user configuration file and `autoconfig`
//! - [`source`] - package sources: git repositories listing packages by URL
//! - [`git`] - the VCS driver, shelling out to the system git binary
//! - [`package`] - package identity, status, and resolution-time info
//! - [`version`] - version kinds (tag / branch / commit) and constraints
//! - [`resolver`] - the version solver producing ordered install plans
//! - [`stage`] - the staging pipeline: build, test, install, rollback
//! - [`manifest`] - the persisted installed-package record
//! - [`bundle`] - offline-transfer archives of package sets
//! - [`template`] - package scaffolding from template repositories
//! - [`manager`] - the orchestrator tying it all together
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zkg::config::Config;
//! use zkg::git::GitCli;
//! use zkg::manager::{InstallOptions, Manager};
//! use zkg::platform::PlatformInfo;
//! use zkg::resolver::Request;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load(std::path::Path::new("~/.zkg/config"))?;
//! let platform = PlatformInfo::discover().await;
//! let mut manager = Manager::new(config, Arc::new(GitCli), platform)?;
//! manager.open_configured_sources().await;
//!
//! manager
//!     .install(&[Request::new("frobnicator", "")], &InstallOptions::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod cli;
pub mod config;
pub mod core;
pub mod git;
pub mod lock;
pub mod manager;
pub mod manifest;
pub mod meta;
pub mod package;
pub mod platform;
pub mod resolver;
pub mod source;
pub mod stage;
pub mod template;
pub mod version;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

/// The engine's own version, checked against `zkg`/`bro-pkg` dependency
/// constraints during resolution.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
