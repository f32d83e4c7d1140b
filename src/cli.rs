//! Thin command-line veneer over the orchestrator.
//!
//! Argument parsing and terminal UX stay deliberately minimal here; the
//! engine's behavior lives in [`crate::manager`]. Every subcommand maps
//! onto one orchestrator verb and exits non-zero on any failure.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

use crate::config::Config;
use crate::git::GitCli;
use crate::manager::{InstallOptions, ListFilter, Manager};
use crate::meta::uservar::UserVar;
use crate::platform::PlatformInfo;
use crate::resolver::Request;

#[derive(Parser)]
#[command(name = "zkg", version = crate::VERSION, about = "Zeek package manager")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true)]
    pub configfile: Option<PathBuf>,

    /// NAME=VALUE user variable overrides.
    #[arg(long = "user-var", global = true, value_name = "NAME=VALUE")]
    pub user_vars: Vec<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Install packages.
    Install {
        /// Package names, paths, or git URLs, optionally `name@version`.
        packages: Vec<String>,
        #[arg(long)]
        skiptests: bool,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        nosuggestions: bool,
    },
    /// Remove installed packages.
    #[command(alias = "uninstall")]
    Remove { packages: Vec<String> },
    /// Remove packages and their backed-up config files.
    Purge { packages: Vec<String> },
    /// Refresh sources and outdated state.
    Refresh {
        #[arg(long)]
        aggregate: bool,
        #[arg(long)]
        fail_on_aggregate_problems: bool,
        #[arg(long)]
        push: bool,
    },
    /// Upgrade installed packages to their latest versions.
    Upgrade {
        packages: Vec<String>,
        #[arg(long)]
        skiptests: bool,
        #[arg(long)]
        force: bool,
    },
    /// Mark packages as loaded.
    Load { packages: Vec<String> },
    /// Unmark packages as loaded.
    Unload { packages: Vec<String> },
    /// Pin packages to their installed versions.
    Pin { packages: Vec<String> },
    /// Allow pinned packages to be upgraded again.
    Unpin { packages: Vec<String> },
    /// List installed packages.
    List {
        #[arg(value_enum, default_value = "installed")]
        filter: CliListFilter,
    },
    /// Search source packages.
    Search { query: String },
    /// Show package details.
    Info {
        package: String,
        #[arg(long, default_value = "")]
        version: String,
    },
    /// Run a package's test suite.
    Test {
        package: String,
        #[arg(long, default_value = "")]
        version: String,
    },
    /// Create a bundle of installed packages.
    Bundle {
        bundle_file: PathBuf,
        /// Bundle only the named packages instead of everything.
        #[arg(long)]
        manifest: Vec<String>,
        #[arg(long)]
        nolocalclones: bool,
    },
    /// Install packages from a bundle.
    Unbundle { bundle_file: PathBuf },
    /// Instantiate a package from a template.
    Create {
        #[arg(long)]
        packagedir: PathBuf,
        #[arg(long)]
        template: Option<String>,
        #[arg(long)]
        template_version: Option<String>,
        #[arg(long)]
        features: Vec<String>,
        #[arg(long)]
        force: bool,
    },
    /// Show template parameters and features.
    TemplateInfo {
        template: Option<String>,
        #[arg(long)]
        template_version: Option<String>,
    },
    /// Print the configuration.
    Config,
    /// Generate a configuration from the platform's config tool.
    Autoconfig,
    /// Print environment variables for using staged artifacts.
    Env,
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub enum CliListFilter {
    All,
    Installed,
    Loaded,
    Unloaded,
    Pinned,
    Outdated,
}

impl From<CliListFilter> for ListFilter {
    fn from(filter: CliListFilter) -> Self {
        match filter {
            CliListFilter::All => ListFilter::All,
            CliListFilter::Installed => ListFilter::Installed,
            CliListFilter::Loaded => ListFilter::Loaded,
            CliListFilter::Unloaded => ListFilter::Unloaded,
            CliListFilter::Pinned => ListFilter::Pinned,
            CliListFilter::Outdated => ListFilter::Outdated,
        }
    }
}

/// Split `name@version` package arguments.
fn parse_package_arg(arg: &str) -> Request {
    // Only an @ past the last path separator is a version request; scp
    // URLs keep their user@host form.
    let slash = arg.rfind('/').map(|i| i + 1).unwrap_or(0);
    match arg[slash..].rfind('@') {
        Some(at) => Request::new(&arg[..slash + at], &arg[slash + at + 1..]),
        None => Request::new(arg, ""),
    }
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.configfile.clone().unwrap_or_else(|| {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_default()
            .join(".zkg")
            .join("config")
    })
}

/// Run the CLI to completion. Non-zero process exit on any error.
pub async fn run(cli: Cli) -> Result<()> {
    let config_file = config_path(&cli);
    let config = if config_file.is_file() {
        Config::load(&config_file)?
    } else {
        let mut config = Config::default();
        config.apply_defaults();
        config
    };

    let platform = PlatformInfo::discover().await;

    if let Commands::Autoconfig = cli.command {
        let config = crate::config::autoconfig(&platform);
        print!("{}", config.to_ini().to_string());
        return Ok(());
    }

    let mut manager = Manager::new(config, Arc::new(GitCli), platform)?;
    let mut overrides = BTreeMap::new();
    for arg in &cli.user_vars {
        let (name, value) = UserVar::parse_arg(arg).map_err(anyhow::Error::msg)?;
        overrides.insert(name, value);
    }
    manager.set_user_var_overrides(overrides);

    match cli.command {
        Commands::Install {
            packages,
            skiptests,
            force,
            nosuggestions,
        } => {
            manager.open_configured_sources().await;
            let requests: Vec<Request> = packages.iter().map(|p| parse_package_arg(p)).collect();
            let opts = InstallOptions {
                skiptests,
                force,
                ignore_suggestions: nosuggestions,
                ..Default::default()
            };
            manager.install(&requests, &opts).await?;
        }
        Commands::Remove { packages } => {
            for package in packages {
                if !manager.remove(&package).await? {
                    anyhow::bail!("no such package installed: {package}");
                }
            }
        }
        Commands::Purge { packages } => {
            for package in packages {
                if !manager.purge(&package).await? {
                    anyhow::bail!("no such package installed: {package}");
                }
            }
        }
        Commands::Refresh {
            aggregate,
            fail_on_aggregate_problems,
            push,
        } => {
            manager.open_configured_sources().await;
            if aggregate || push {
                let names: Vec<String> = manager.config().sources.keys().cloned().collect();
                for name in names {
                    let issues = manager
                        .refresh_source(&name, aggregate, fail_on_aggregate_problems, push)
                        .await?;
                    for (url, problem) in issues {
                        eprintln!("{} {url}: {problem}", "warning:".yellow());
                    }
                }
                manager.refresh_installed_packages().await?;
            } else {
                manager.refresh().await?;
            }
        }
        Commands::Upgrade {
            packages,
            skiptests,
            force,
        } => {
            manager.open_configured_sources().await;
            let opts = InstallOptions {
                skiptests,
                force,
                ..Default::default()
            };
            let targets = if packages.is_empty() {
                manager
                    .list(ListFilter::Outdated)
                    .into_iter()
                    .map(|p| p.package.qualified_name())
                    .collect()
            } else {
                packages
            };
            for package in targets {
                manager.upgrade(&package, &opts).await?;
            }
        }
        Commands::Load { packages } => {
            for package in packages {
                manager.load(&package)?;
            }
        }
        Commands::Unload { packages } => {
            for package in packages {
                manager.unload(&package)?;
            }
        }
        Commands::Pin { packages } => {
            for package in packages {
                let ipkg = manager.pin(&package)?;
                println!("pinned {} ({})", ipkg.package.qualified_name(), ipkg.status.current_version);
            }
        }
        Commands::Unpin { packages } => {
            for package in packages {
                let ipkg = manager.unpin(&package)?;
                println!("unpinned {}", ipkg.package.qualified_name());
            }
        }
        Commands::List { filter } => {
            for ipkg in manager.list(filter.into()) {
                let mut flags = Vec::new();
                if ipkg.status.is_loaded {
                    flags.push("loaded");
                }
                if ipkg.status.is_pinned {
                    flags.push("pinned");
                }
                if ipkg.status.is_outdated {
                    flags.push("outdated");
                }
                println!(
                    "{} ({}) [{}]",
                    ipkg.package.qualified_name().bold(),
                    ipkg.status.current_version,
                    flags.join(", ")
                );
            }
        }
        Commands::Search { query } => {
            manager.open_configured_sources().await;
            for package in manager.search(&query) {
                println!("{}", package.qualified_name());
            }
        }
        Commands::Info { package, version } => {
            manager.open_configured_sources().await;
            let info = manager.info(&package, &version, true).await?;
            println!("{}", info.package.qualified_name().bold());
            println!("  description: {}", info.metadata.description());
            println!("  versions: {}", info.versions.join(", "));
            if let Some(status) = &info.status {
                println!(
                    "  installed: {} ({})",
                    status.current_version,
                    status
                        .tracking_method
                        .map(|m| m.to_string())
                        .unwrap_or_default()
                );
            }
        }
        Commands::Test { package, version } => {
            manager.open_configured_sources().await;
            let (passed, dir) = manager.test(&package, &version).await?;
            if passed {
                println!("{}", "all tests passed".green());
            } else {
                anyhow::bail!("tests failed, inspect {}", dir.display());
            }
        }
        Commands::Bundle {
            bundle_file,
            manifest,
            nolocalclones,
        } => {
            manager.open_configured_sources().await;
            let packages = if manifest.is_empty() {
                None
            } else {
                let mut list = Vec::new();
                for name in manifest {
                    let request = parse_package_arg(&name);
                    let info = manager.info(&request.path, &request.version, true).await?;
                    let version = if request.version.is_empty() {
                        info.status
                            .as_ref()
                            .map(|s| s.current_version.clone())
                            .unwrap_or_else(|| info.best_version())
                    } else {
                        request.version
                    };
                    list.push((info.package.git_url, version));
                }
                Some(list)
            };
            let digest = manager
                .bundle(&bundle_file, packages, !nolocalclones)
                .await?;
            println!("bundle created: {} (sha256 {digest})", bundle_file.display());
        }
        Commands::Unbundle { bundle_file } => {
            manager.unbundle(&bundle_file).await?;
        }
        Commands::Create {
            packagedir,
            template,
            template_version,
            features,
            force,
        } => {
            manager
                .create(
                    &packagedir,
                    template.as_deref(),
                    template_version.as_deref(),
                    &features,
                    force,
                )
                .await?;
        }
        Commands::TemplateInfo {
            template,
            template_version,
        } => {
            let info = manager
                .template_info(template.as_deref(), template_version.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::Config => {
            print!("{}", manager.config().to_ini().to_string());
        }
        Commands::Autoconfig => unreachable!("handled above"),
        Commands::Env => {
            for (key, value) in manager.env() {
                println!("export {key}={value}");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_args_split_version_suffix() {
        let request = parse_package_arg("foo@1.0.0");
        assert_eq!(request.path, "foo");
        assert_eq!(request.version, "1.0.0");

        let request = parse_package_arg("git@github.com:zeek/foo");
        assert_eq!(request.path, "git@github.com:zeek/foo");
        assert_eq!(request.version, "");

        let request = parse_package_arg("https://example.com/alice/foo@v2.0.0");
        assert_eq!(request.path, "https://example.com/alice/foo");
        assert_eq!(request.version, "v2.0.0");
    }
}
