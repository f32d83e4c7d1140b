//! Package sources: named git repositories listing packages by URL.
//!
//! A source contains one or more index files. The current format,
//! `zkg.index`, is a newline-separated list of package URLs; the legacy
//! `bro-pkg.index` is an INI whose sections name packages with `url=` and
//! `tags=` keys. Both are accepted, in any subdirectory of the source.
//!
//! Alongside the indices a source may carry an `aggregate.meta` file: the
//! pre-aggregated metadata of every listed package, refreshed by the
//! `aggregate` operation so clients can answer `info`/`search` queries
//! without cloning anything.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::debug;
use walkdir::WalkDir;

use crate::core::fsutil;
use crate::git::{ensure_clone, Vcs};
use crate::meta::ini::Ini;
use crate::package::{name_from_path, Package};

/// Current index file name.
pub const INDEX_FILENAME: &str = "zkg.index";
/// Legacy index file name, still accepted.
pub const LEGACY_INDEX_FILENAME: &str = "bro-pkg.index";
/// Aggregated metadata file at the source root.
pub const AGGREGATE_DATA_FILE: &str = "aggregate.meta";

/// A configured package source with a local clone.
#[derive(Debug, Clone)]
pub struct Source {
    pub name: String,
    pub git_url: String,
    pub clone_path: PathBuf,
}

impl Source {
    /// Open (or create) the local clone of a source.
    ///
    /// A `url@version` suffix selects a ref to check out; otherwise the
    /// clone stays on its default branch. An existing clone whose origin
    /// URL no longer matches is re-cloned.
    pub async fn open(
        vcs: &dyn Vcs,
        name: &str,
        clone_path: &Path,
        git_url: &str,
    ) -> Result<Self> {
        let (url, version) = split_version_suffix(git_url);
        ensure_clone(vcs, &url, clone_path, true).await?;

        if let Some(version) = version {
            vcs.checkout(clone_path, &version).await?;
        }

        Ok(Self {
            name: name.to_string(),
            git_url: url,
            clone_path: clone_path.to_path_buf(),
        })
    }

    /// Fetch and fast-forward the source clone, preserving any locally
    /// aggregated metadata unless the remote's own copy changed.
    pub async fn refresh(&self, vcs: &dyn Vcs, scratch_dir: &Path) -> Result<()> {
        debug!(source = %self.name, url = %self.git_url, "refreshing source");

        let aggregate = self.clone_path.join(AGGREGATE_DATA_FILE);
        let ours = scratch_dir.join(AGGREGATE_DATA_FILE);
        let theirs_orig = scratch_dir.join(format!("{AGGREGATE_DATA_FILE}.orig"));
        fsutil::delete_path(&ours)?;
        fsutil::delete_path(&theirs_orig)?;
        fsutil::make_dir(scratch_dir)?;

        if aggregate.is_file() {
            std::fs::copy(&aggregate, &ours)?;
        }

        vcs.reset_clean(&self.clone_path).await?;

        if aggregate.is_file() {
            std::fs::copy(&aggregate, &theirs_orig)?;
        }

        vcs.fetch(&self.clone_path).await?;
        vcs.pull(&self.clone_path).await?;

        if ours.is_file() {
            if aggregate.is_file() {
                if theirs_orig.is_file() && fsutil::files_identical(&aggregate, &theirs_orig)? {
                    // Their copy didn't move; our local aggregation wins.
                    std::fs::copy(&ours, &aggregate)?;
                    debug!("aggregate file in source unchanged, restored local one");
                } else {
                    debug!("aggregate file in source changed, discarded local one");
                }
            } else {
                std::fs::copy(&ours, &aggregate)?;
                debug!("no aggregate file in source, restored local one");
            }
        }

        Ok(())
    }

    /// Paths of every index file in the source, sorted.
    pub fn package_index_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.clone_path)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git")
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_type().is_file()
                    && (e.file_name() == INDEX_FILENAME || e.file_name() == LEGACY_INDEX_FILENAME)
            })
            .map(|e| e.into_path())
            .collect();
        files.sort();
        files
    }

    /// Every package listed in the source, with any aggregated metadata
    /// attached.
    pub fn packages(&self) -> Result<Vec<Package>> {
        let aggregate = self.read_aggregate();
        let mut packages = Vec::new();

        for index_file in self.package_index_files() {
            let directory = index_file
                .parent()
                .and_then(|p| p.strip_prefix(&self.clone_path).ok())
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();

            for url in read_index_urls(&index_file)? {
                let pkg_name = name_from_path(&url);
                let mut package = Package::from_source(&url, &self.name, &directory);

                let agg_key = if directory.is_empty() {
                    pkg_name.clone()
                } else {
                    format!("{directory}/{pkg_name}")
                };
                if let Some(agg) = &aggregate {
                    if let Some(section) = agg.section(&agg_key) {
                        package.metadata = section.to_map();
                    }
                }
                packages.push(package);
            }
        }

        Ok(packages)
    }

    /// The aggregated metadata document, if the source carries one.
    pub fn read_aggregate(&self) -> Option<Ini> {
        let path = self.clone_path.join(AGGREGATE_DATA_FILE);
        if !path.is_file() {
            return None;
        }
        Ini::parse_file(&path, true).ok()
    }

    pub fn aggregate_path(&self) -> PathBuf {
        self.clone_path.join(AGGREGATE_DATA_FILE)
    }
}

/// Split a `url@ref` suffix off a source URL. scp-style URLs
/// (`git@host:path`) keep their leading `@`.
fn split_version_suffix(git_url: &str) -> (String, Option<String>) {
    // Only an @ after the last path separator denotes a version request.
    if let Some(slash) = git_url.rfind('/') {
        if let Some(at) = git_url[slash..].rfind('@') {
            let at = slash + at;
            return (
                git_url[..at].to_string(),
                Some(git_url[at + 1..].to_string()),
            );
        }
    }
    (git_url.to_string(), None)
}

/// Read package URLs from an index file in either accepted format.
pub fn read_index_urls(index_file: &Path) -> Result<Vec<String>> {
    if index_file.file_name().map(|n| n == LEGACY_INDEX_FILENAME).unwrap_or(false) {
        // Legacy INI: one section per package with a url= key.
        let ini = Ini::parse_file(index_file, true).map_err(anyhow::Error::msg)?;
        let mut urls = Vec::new();
        for (_, section) in ini.sections() {
            if let Some(url) = section.get("url") {
                urls.push(url.to_string());
            }
        }
        return Ok(urls);
    }

    let content = std::fs::read_to_string(index_file)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_modern_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join(INDEX_FILENAME);
        std::fs::write(
            &index,
            "https://example.com/alice/foo\n\n# comment\nhttps://example.com/bob/bar\n",
        )
        .unwrap();
        let urls = read_index_urls(&index).unwrap();
        assert_eq!(
            urls,
            vec!["https://example.com/alice/foo", "https://example.com/bob/bar"]
        );
    }

    #[test]
    fn reads_legacy_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join(LEGACY_INDEX_FILENAME);
        std::fs::write(
            &index,
            "[foo]\nurl = https://example.com/alice/foo\ntags = detection\n",
        )
        .unwrap();
        let urls = read_index_urls(&index).unwrap();
        assert_eq!(urls, vec!["https://example.com/alice/foo"]);
    }

    #[test]
    fn version_suffix_parsing() {
        assert_eq!(
            split_version_suffix("https://example.com/pkgs@v2"),
            ("https://example.com/pkgs".to_string(), Some("v2".to_string()))
        );
        assert_eq!(
            split_version_suffix("git@github.com:zeek/packages"),
            ("git@github.com:zeek/packages".to_string(), None)
        );
    }

    #[test]
    fn packages_pick_up_aggregate_metadata() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("alice")).unwrap();
        std::fs::write(
            dir.path().join("alice").join(INDEX_FILENAME),
            "https://example.com/alice/foo\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join(AGGREGATE_DATA_FILE),
            "[alice/foo]\nurl = https://example.com/alice/foo\nversion = 1.0.0\ndescription = A package\n",
        )
        .unwrap();

        let source = Source {
            name: "zeek".into(),
            git_url: "https://example.com/packages".into(),
            clone_path: dir.path().to_path_buf(),
        };
        let packages = source.packages().unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].qualified_name(), "zeek/alice/foo");
        assert_eq!(
            packages[0].metadata.get("description").map(String::as_str),
            Some("A package")
        );
    }
}
