//! Cross-platform filesystem helpers shared across the engine.
//!
//! These mirror the small set of primitives the staging pipeline relies on:
//! atomic writes for state files, recursive copy-over for staged package
//! directories, and symlink maintenance for the script tree and bin dir.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

/// Atomically write `content` to `path` (write-temp-then-rename).
///
/// The temporary file is created in the same directory as the target so the
/// rename cannot cross filesystems. Readers observe either the previous
/// content or the new content, never a partial write.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    std::io::Write::write_all(&mut tmp, content)
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("failed to persist {}", path.display()))?;
    Ok(())
}

/// Create a directory and all parents, tolerating its prior existence.
pub fn make_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory {}", path.display()))
}

/// Delete a file, symlink, or directory tree if it exists.
pub fn delete_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)
            .with_context(|| format!("failed to remove directory {}", path.display())),
        Ok(_) => fs::remove_file(path)
            .with_context(|| format!("failed to remove file {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to stat {}", path.display())),
    }
}

/// Replace `dst` with a copy of `src`, excluding any `.git` directory.
///
/// Copying goes through a sibling temp directory and a final rename so the
/// destination flips over in one step.
pub fn copy_over_path(src: &Path, dst: &Path, scratch: &Path) -> Result<()> {
    make_dir(scratch)?;
    let staging = tempfile::tempdir_in(scratch)
        .with_context(|| format!("failed to create scratch dir under {}", scratch.display()))?;
    let tmp_dst = staging.path().join("copy");

    copy_dir(src, &tmp_dst)?;
    delete_path(dst)?;
    if let Some(parent) = dst.parent() {
        make_dir(parent)?;
    }
    fs::rename(&tmp_dst, dst)
        .with_context(|| format!("failed to move copy into place at {}", dst.display()))?;
    Ok(())
}

/// Recursively copy a directory including any `.git` directory (used when
/// bundling existing clones, which must stay valid repositories).
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    copy_dir_impl(src, dst, false)
}

/// Recursively copy a directory, skipping `.git`, preserving symlinks.
pub fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    copy_dir_impl(src, dst, true)
}

fn copy_dir_impl(src: &Path, dst: &Path, skip_git: bool) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("failed to walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields children of src");
        if skip_git && rel.components().any(|c| c.as_os_str() == ".git") {
            continue;
        }
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            make_dir(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .with_context(|| format!("failed to read link {}", entry.path().display()))?;
            if let Some(parent) = target.parent() {
                make_dir(parent)?;
            }
            delete_path(&target)?;
            make_symlink(&link, &target)?;
        } else {
            if let Some(parent) = target.parent() {
                make_dir(parent)?;
            }
            fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "failed to copy {} to {}",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }
    Ok(())
}

/// Move a directory tree, falling back to copy-and-delete when the
/// rename crosses filesystems.
pub fn move_tree(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        make_dir(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_dir_all(src, dst)?;
            delete_path(src)
        }
    }
}

/// Create (or force-replace) a symlink at `link` pointing to `target`.
#[cfg(unix)]
pub fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    if fs::symlink_metadata(link).is_ok() {
        delete_path(link)?;
    }
    std::os::unix::fs::symlink(target, link).with_context(|| {
        format!(
            "failed to symlink {} -> {}",
            link.display(),
            target.display()
        )
    })
}

/// Create (or force-replace) a symlink at `link` pointing to `target`.
#[cfg(windows)]
pub fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    if fs::symlink_metadata(link).is_ok() {
        delete_path(link)?;
    }
    if target.is_dir() {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
    .with_context(|| {
        format!(
            "failed to symlink {} -> {}",
            link.display(),
            target.display()
        )
    })
}

/// Whether a path exists and carries an executable bit.
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Whether a path exists and carries an executable bit.
#[cfg(windows)]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Compare two files byte-for-byte.
pub fn files_identical(a: &Path, b: &Path) -> Result<bool> {
    let ca = fs::read(a).with_context(|| format!("failed to read {}", a.display()))?;
    let cb = fs::read(b).with_context(|| format!("failed to read {}", b.display()))?;
    Ok(ca == cb)
}
