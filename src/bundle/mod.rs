//! Bundles: self-contained archives of a package set for offline transfer.
//!
//! A bundle is a gzip'd tar holding a top-level `manifest.txt` plus one
//! subdirectory per package containing its git clone at the resolved ref.
//! The manifest is INI-shaped: a `[bundle]` section of `url = version`
//! lines (key case preserved, since keys are URLs), and an optional `[meta]`
//! section recording the built-in capabilities the source host relied on,
//! so the destination host can warn when it lacks them.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::core::ZkgError;
use crate::meta::ini::Ini;

/// Name of the manifest file inside a bundle.
pub const BUNDLE_MANIFEST_FILE: &str = "manifest.txt";

/// Parsed contents of a bundle manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleManifest {
    /// (git URL, version) per bundled package, in manifest order.
    pub packages: Vec<(String, String)>,
    /// (name, version) of built-in capabilities the source host had.
    pub builtin_packages: Vec<(String, String)>,
}

impl BundleManifest {
    pub fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();
        let bundle = ini.section_mut("bundle");
        for (url, version) in &self.packages {
            bundle.set(url.clone(), version.clone());
        }
        if !self.builtin_packages.is_empty() {
            let entries: Vec<String> = self
                .builtin_packages
                .iter()
                .map(|(name, version)| format!("{name}={version}"))
                .collect();
            ini.section_mut("meta")
                .set("builtin_packages", entries.join(","));
        }
        ini
    }

    pub fn from_ini(ini: &Ini) -> Result<Self> {
        let bundle = ini.section("bundle").ok_or_else(|| ZkgError::Bundle {
            reason: "no [bundle] section in manifest file".to_string(),
        })?;
        let packages = bundle
            .iter()
            .map(|(url, version)| (url.to_string(), version.to_string()))
            .collect();

        let mut builtin_packages = Vec::new();
        if let Some(meta) = ini.section("meta") {
            if let Some(raw) = meta.get("builtin_packages") {
                for entry in raw.split(',').filter(|e| !e.trim().is_empty()) {
                    if let Some((name, version)) = entry.split_once('=') {
                        builtin_packages.push((name.trim().to_string(), version.trim().to_string()));
                    }
                }
            }
        }

        Ok(Self {
            packages,
            builtin_packages,
        })
    }

    /// Write into a bundle staging directory.
    pub fn write_to(&self, bundle_dir: &Path) -> Result<()> {
        let path = bundle_dir.join(BUNDLE_MANIFEST_FILE);
        std::fs::write(&path, self.to_ini().to_string())
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Read from an extracted bundle directory.
    pub fn read_from(bundle_dir: &Path) -> Result<Self> {
        let path = bundle_dir.join(BUNDLE_MANIFEST_FILE);
        if !path.is_file() {
            return Err(ZkgError::Bundle {
                reason: "invalid bundle: no manifest file".to_string(),
            }
            .into());
        }
        let ini = Ini::parse_file(&path, true).map_err(|reason| ZkgError::Bundle {
            reason: format!("invalid bundle manifest: {reason}"),
        })?;
        Self::from_ini(&ini)
    }
}

/// Pack `bundle_dir`'s contents into a gzip'd tar at `bundle_file`,
/// returning the archive's sha256 digest.
pub fn create_archive(bundle_dir: &Path, bundle_file: &Path) -> Result<String> {
    let file = File::create(bundle_file)
        .with_context(|| format!("failed to create {}", bundle_file.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", bundle_dir)
        .with_context(|| format!("failed to archive {}", bundle_dir.display()))?;
    let encoder = builder.into_inner().context("failed to finish archive")?;
    encoder.finish().context("failed to flush archive")?;

    archive_digest(bundle_file)
}

/// The sha256 digest of an archive file, hex-encoded.
pub fn archive_digest(bundle_file: &Path) -> Result<String> {
    let mut file = File::open(bundle_file)
        .with_context(|| format!("failed to open {}", bundle_file.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Extract a bundle archive into `dest`, refusing entries that would
/// escape the destination directory.
pub fn extract_archive(bundle_file: &Path, dest: &Path) -> Result<()> {
    let file = File::open(bundle_file)
        .with_context(|| format!("failed to open {}", bundle_file.display()))?;
    let decoder = GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);

    for entry in archive.entries().context("failed to read archive")? {
        let mut entry = entry.context("failed to read archive entry")?;
        let path = entry.path().context("archive entry has invalid path")?;
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(ZkgError::Bundle {
                reason: format!("archive entry escapes bundle directory: {}", path.display()),
            }
            .into());
        }
        entry
            .unpack_in(dest)
            .with_context(|| format!("failed to extract into {}", dest.display()))?;
    }
    Ok(())
}

/// Read just the manifest out of a bundle without a full extraction.
pub fn read_manifest_from_archive(bundle_file: &Path) -> Result<BundleManifest> {
    let file = File::open(bundle_file)
        .with_context(|| format!("failed to open {}", bundle_file.display()))?;
    let decoder = GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries().context("failed to read archive")? {
        let mut entry = entry.context("failed to read archive entry")?;
        let path = entry.path().context("archive entry has invalid path")?;
        let is_manifest = path
            .file_name()
            .map(|n| n == BUNDLE_MANIFEST_FILE)
            .unwrap_or(false)
            && path.components().filter(|c| matches!(c, Component::Normal(_))).count() <= 2;
        if is_manifest {
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            let ini = Ini::parse(&content, true).map_err(|reason| ZkgError::Bundle {
                reason: format!("invalid bundle manifest: {reason}"),
            })?;
            return BundleManifest::from_ini(&ini);
        }
    }

    Err(ZkgError::Bundle {
        reason: "invalid bundle: no manifest file".to_string(),
    }
    .into())
}

/// Write file content helper used when assembling bundle directories.
pub fn write_file(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    file.write_all(content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> BundleManifest {
        BundleManifest {
            packages: vec![
                ("https://example.com/alice/foo".to_string(), "1.0.0".to_string()),
                ("https://example.com/bob/bar".to_string(), "main".to_string()),
            ],
            builtin_packages: vec![("spicy-plugin".to_string(), "1.4.2".to_string())],
        }
    }

    #[test]
    fn manifest_roundtrips_through_ini() {
        let manifest = sample_manifest();
        let text = manifest.to_ini().to_string();
        let back = BundleManifest::from_ini(&Ini::parse(&text, true).unwrap()).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn archive_roundtrip_preserves_manifest_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let bundle_dir = dir.path().join("bundle");
        std::fs::create_dir_all(bundle_dir.join("foo")).unwrap();
        std::fs::write(bundle_dir.join("foo/zkg.meta"), "[package]\n").unwrap();
        sample_manifest().write_to(&bundle_dir).unwrap();

        let archive = dir.path().join("set.bundle");
        let digest = create_archive(&bundle_dir, &archive).unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(archive_digest(&archive).unwrap(), digest);

        let manifest = read_manifest_from_archive(&archive).unwrap();
        assert_eq!(manifest, sample_manifest());

        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        extract_archive(&archive, &out).unwrap();
        assert!(out.join("foo/zkg.meta").is_file());
        let extracted = BundleManifest::read_from(&out).unwrap();
        assert_eq!(extracted, sample_manifest());
    }

    #[test]
    fn missing_bundle_section_is_an_error() {
        let ini = Ini::parse("[meta]\nbuiltin_packages = a=1\n", true).unwrap();
        assert!(BundleManifest::from_ini(&ini).is_err());
    }
}
