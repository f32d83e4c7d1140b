//! Source management: adding, refreshing, and aggregating package
//! sources.

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::core::fsutil;
use crate::core::ZkgError;
use crate::git::ensure_clone;
use crate::lock::StateLock;
use crate::meta::ini::Ini;
use crate::meta::PackageMetadata;
use crate::package::{name_from_path, BUILTIN_SOURCE};
use crate::source::{Source, AGGREGATE_DATA_FILE};
use crate::version::sorted_version_tags;

use super::Manager;

/// Per-package problems encountered while aggregating a source:
/// (repository URL, description).
pub type AggregationIssues = Vec<(String, String)>;

impl Manager {
    /// Register a package source, cloning it on first use.
    pub async fn add_source(&mut self, name: &str, git_url: &str) -> Result<()> {
        if name == BUILTIN_SOURCE {
            return Err(ZkgError::Config {
                reason: format!("{name} is a reserved source name"),
            }
            .into());
        }
        if let Some(existing) = self.sources.get(name) {
            if existing.git_url == git_url {
                debug!(source = %name, "duplicate source");
                return Ok(());
            }
            return Err(ZkgError::Config {
                reason: format!(
                    "source \"{name}\" already exists with different URL: {}",
                    existing.git_url
                ),
            }
            .into());
        }

        let clone_path = self.layout.source_clonedir().join(name);
        let source = Source::open(self.vcs.as_ref(), name, &clone_path, git_url).await?;
        self.sources.insert(name.to_string(), source);
        Ok(())
    }

    /// Open every source named in the configuration. Failures are
    /// warnings; a dead source should not brick every other operation.
    pub async fn open_configured_sources(&mut self) {
        let configured: Vec<(String, String)> = self
            .config
            .sources
            .iter()
            .map(|(n, u)| (n.clone(), u.clone()))
            .collect();
        for (name, url) in configured {
            if let Err(e) = self.add_source(&name, &url).await {
                warn!(source = %name, error = %e, "failed to open package source");
            }
        }
    }

    /// Refresh one source: fetch its index and pre-aggregated metadata,
    /// optionally re-aggregate locally and push the result.
    ///
    /// With `fail_on_problems`, the first metadata problem aborts;
    /// otherwise problems come back as warnings.
    pub async fn refresh_source(
        &mut self,
        name: &str,
        aggregate: bool,
        fail_on_problems: bool,
        push: bool,
    ) -> Result<AggregationIssues> {
        let _lock = StateLock::acquire(&self.layout.state_dir)?;
        let Some(source) = self.sources.get(name).cloned() else {
            return Err(ZkgError::Config {
                reason: format!("source name does not exist: {name}"),
            }
            .into());
        };

        source
            .refresh(self.vcs.as_ref(), &self.layout.scratch_dir())
            .await?;

        let mut issues = AggregationIssues::new();
        if aggregate {
            issues = self.aggregate_source_locally(&source, fail_on_problems).await?;
        }

        if push {
            if source.aggregate_path().is_file() {
                self.vcs
                    .add_path(&source.clone_path, AGGREGATE_DATA_FILE)
                    .await?;
            }
            if self.vcs.is_dirty(&source.clone_path).await? {
                self.vcs
                    .commit_all(&source.clone_path, "Update aggregated metadata.")
                    .await?;
                info!(source = %name, "committed package source metadata update");
            }
            self.vcs.push(&source.clone_path).await?;
        }

        Ok(issues)
    }

    /// Refresh every configured source and the outdated state of
    /// installed packages. Independent source fetches run concurrently;
    /// each gets its own scratch subdirectory.
    pub async fn refresh(&mut self) -> Result<()> {
        let lock = StateLock::acquire(&self.layout.state_dir)?;
        let sources: Vec<Source> = self.sources.values().cloned().collect();
        let scratch = self.layout.scratch_dir().join("refresh");

        let vcs = self.vcs.clone();
        let refreshes = sources.iter().map(|source| {
            let scratch = scratch.join(&source.name);
            let vcs = vcs.clone();
            async move { source.refresh(vcs.as_ref(), &scratch).await }
        });
        for result in futures::future::join_all(refreshes).await {
            result?;
        }

        drop(lock);
        self.refresh_installed_packages().await
    }

    /// Crawl every package listed by a source, collect metadata at each
    /// package's default version, and write the source's aggregate file.
    async fn aggregate_source_locally(
        &self,
        source: &Source,
        fail_on_problems: bool,
    ) -> Result<AggregationIssues> {
        let mut aggregate = Ini::new();
        let mut issues = AggregationIssues::new();
        let scratch = self.layout.scratch_dir().join("aggregate");

        let prev = source.read_aggregate();
        let prev_sections: Vec<String> = prev
            .as_ref()
            .map(|ini| ini.section_names().map(str::to_string).collect())
            .unwrap_or_default();

        for index_file in source.package_index_files() {
            let directory = index_file
                .parent()
                .and_then(|p| p.strip_prefix(&source.clone_path).ok())
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();

            for url in crate::source::read_index_urls(&index_file)? {
                let pkg_name = name_from_path(&url);
                let clone_path = scratch.join(&pkg_name);
                fsutil::delete_path(&clone_path)?;

                let result: Result<(String, PackageMetadata)> = async {
                    ensure_clone(self.vcs.as_ref(), &url, &clone_path, true).await?;
                    let tags = sorted_version_tags(self.vcs.list_tags(&clone_path).await?);
                    let version = match tags.last() {
                        Some(tag) => tag.clone(),
                        None => self.vcs.default_branch(&clone_path).await?,
                    };
                    self.vcs.checkout(&clone_path, &version).await?;
                    let metadata = PackageMetadata::parse_dir(&clone_path, &pkg_name)?;
                    Ok((version, metadata))
                }
                .await;

                let (version, metadata) = match result {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        if fail_on_problems {
                            return Err(e.context(format!("aggregation failed for {url}")));
                        }
                        warn!(%url, error = %e, "skipping aggregation");
                        issues.push((url.clone(), e.to_string()));
                        continue;
                    }
                };

                let qualified = if directory.is_empty() {
                    pkg_name.clone()
                } else {
                    format!("{directory}/{pkg_name}")
                };
                let section = aggregate.section_mut(&qualified);
                for (key, value) in metadata.fields() {
                    section.set(key.clone(), value.clone());
                }
                section.set("url", url.clone());
                section.set("version", version);
            }
        }

        let added: Vec<&str> = aggregate
            .section_names()
            .filter(|n| !prev_sections.iter().any(|p| p == n))
            .collect();
        let removed: Vec<&String> = prev_sections
            .iter()
            .filter(|p| !aggregate.has_section(p))
            .collect();
        debug!(
            source = %source.name,
            additions = added.len(),
            removals = removed.len(),
            "metadata aggregation complete"
        );

        fsutil::atomic_write(&source.aggregate_path(), aggregate.to_string().as_bytes())?;
        Ok(issues)
    }
}
