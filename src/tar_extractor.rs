//! Fail-closed tar extraction.
//!
//! Member names are resolved lexically against the extraction root. Absolute
//! paths, drive prefixes and `..` segments are rejected outright rather than
//! clamped, symlink and hard-link targets must stay inside the root, and nothing
//! is written through an existing symlinked directory. The first violation aborts
//! extraction with [`ArchiveError::PathTraversal`]; members already written are
//! left in place.
//!
//! The lexical check alone cannot see links created later in the stream, so every
//! symlink under the root is also resolved against the filesystem after each
//! symlink member and once more when the stream ends (see [`check_symlinks`]).

use crate::error::{io_at, ArchiveError, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar_rs as tar;
use walkdir::WalkDir;

/// Resolves a member name to a path relative to the extraction root.
/// An empty result names the root itself.
pub fn normalize_member(member: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for comp in member.components() {
        match comp {
            Component::CurDir => {}
            Component::Normal(c) => out.push(c),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::traversal(member));
            }
        }
    }
    Ok(out)
}

/// Resolves the target of a symlink member living at `link_rel` (relative to
/// `root`). The target must be relative, must not climb above the root and must
/// not pass through a symlink that already exists under the root.
pub fn resolve_link_target(root: &Path, link_rel: &Path, target: &Path) -> Result<PathBuf> {
    let mut stack: Vec<&std::ffi::OsStr> = link_rel
        .parent()
        .map(|p| {
            p.components()
                .filter_map(|c| match c {
                    Component::Normal(n) => Some(n),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    for comp in target.components() {
        match comp {
            Component::CurDir => {}
            Component::Normal(c) => {
                stack.push(c);
                let on_disk: PathBuf = root.join(stack.iter().collect::<PathBuf>());
                if fs::symlink_metadata(&on_disk)
                    .map(|m| m.file_type().is_symlink())
                    .unwrap_or(false)
                {
                    return Err(ArchiveError::traversal(link_rel));
                }
            }
            Component::ParentDir => {
                if stack.pop().is_none() {
                    return Err(ArchiveError::traversal(link_rel));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::traversal(link_rel));
            }
        }
    }
    Ok(stack.iter().collect())
}

/// Rejects `rel` if any existing ancestor between `root` and it is a symlink.
fn check_ancestors(root: &Path, rel: &Path) -> Result<()> {
    let mut current = root.to_path_buf();
    let Some(parent) = rel.parent() else {
        return Ok(());
    };
    for comp in parent.components() {
        current.push(comp);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(ArchiveError::traversal(rel));
            }
            Ok(_) => {}
            // Nothing deeper exists yet, so nothing deeper can be a symlink.
            Err(_) => break,
        }
    }
    Ok(())
}

/// Removes whatever sits at `dest` without following symlinks.
fn clear_destination(dest: &Path) {
    if let Ok(metadata) = fs::symlink_metadata(dest) {
        log::debug!(
            "Removing existing entry at: {} (is_symlink: {})",
            dest.display(),
            metadata.is_symlink()
        );
        if metadata.is_dir() && !metadata.is_symlink() {
            fs::remove_dir_all(dest).ok();
        } else {
            fs::remove_file(dest).ok();
        }
    }
}

fn create_parent(dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(io_at(parent))?;
    }
    Ok(())
}

/// Hardlinks `target` to `dest`, copying when the filesystem refuses links.
fn link_or_copy(target: &Path, dest: &Path) -> Result<()> {
    clear_destination(dest);
    if let Err(e) = fs::hard_link(target, dest) {
        log::debug!(
            "hardlink failed ({}), falling back to copy: {} -> {}",
            e,
            target.display(),
            dest.display()
        );
        fs::copy(target, dest).map_err(io_at(dest))?;
    }
    Ok(())
}

/// Resolves every symlink under `root` on disk and removes the first one that
/// lands outside it, failing with [`ArchiveError::PathTraversal`]. Dangling links
/// pass; a later call catches them once their target appears.
pub fn check_symlinks(root: &Path) -> Result<()> {
    if !root.exists() {
        return Ok(());
    }
    let canonical_root = fs::canonicalize(root).map_err(io_at(root))?;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.path_is_symlink() {
            continue;
        }
        let Ok(resolved) = fs::canonicalize(entry.path()) else {
            continue;
        };
        if resolved.starts_with(&canonical_root) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        log::warn!(
            "Removing symlink {} which resolves outside the output directory",
            entry.path().display()
        );
        fs::remove_file(entry.path()).map_err(io_at(entry.path()))?;
        return Err(ArchiveError::traversal(rel));
    }
    Ok(())
}

/// Extracts a gzip-compressed layer blob under `root`.
/// Returns the root-relative paths of the regular files written.
pub fn extract_layer<R: Read>(blob: R, root: &Path) -> Result<Vec<PathBuf>> {
    extract_tar(GzDecoder::new(blob), root)
}

/// Extracts an uncompressed tar stream under `root`.
pub fn extract_tar<R: Read>(reader: R, root: &Path) -> Result<Vec<PathBuf>> {
    let mut archive = tar::Archive::new(reader);
    let mut written = Vec::new();

    for entry_result in archive.entries()? {
        let mut entry = entry_result?;
        let entry_type = entry.header().entry_type();
        let member = entry.path()?.into_owned();
        let rel = normalize_member(&member)?;
        check_ancestors(root, &rel)?;
        let dest = root.join(&rel);

        match entry_type {
            tar::EntryType::Directory => {
                if rel.as_os_str().is_empty() {
                    continue;
                }
                fs::create_dir_all(&dest).map_err(io_at(&dest))?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                if rel.as_os_str().is_empty() {
                    return Err(ArchiveError::traversal(&member));
                }
                #[cfg(unix)]
                let mode = entry.header().mode().ok();

                create_parent(&dest)?;
                clear_destination(&dest);
                log::debug!("Creating file: {}", dest.display());
                let mut out_file = File::create(&dest).map_err(io_at(&dest))?;
                std::io::copy(&mut entry, &mut out_file).map_err(io_at(&dest))?;

                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Some(mode) = mode {
                        // Owner keeps read/write whatever the archive says.
                        let perms = fs::Permissions::from_mode((mode & 0o777) | 0o600);
                        let _ = fs::set_permissions(&dest, perms);
                    }
                }
                written.push(rel);
            }
            tar::EntryType::Symlink => {
                let link_name = entry
                    .link_name()?
                    .ok_or_else(|| ArchiveError::traversal(&member))?
                    .into_owned();
                resolve_link_target(root, &rel, &link_name)?;
                create_parent(&dest)?;
                clear_destination(&dest);

                #[cfg(unix)]
                {
                    std::os::unix::fs::symlink(&link_name, &dest).map_err(io_at(&dest))?;
                    check_symlinks(root)?;
                }

                #[cfg(not(unix))]
                {
                    log::warn!("Symlink support not implemented on this platform: {}", dest.display());
                }
            }
            tar::EntryType::Link => {
                let link_name = entry
                    .link_name()?
                    .ok_or_else(|| ArchiveError::traversal(&member))?
                    .into_owned();
                let target_rel = normalize_member(&link_name)?;
                check_ancestors(root, &target_rel)?;
                let target = root.join(&target_rel);
                let target_meta = fs::symlink_metadata(&target);
                // Linking or copying a symlink would carry its target along.
                if target_meta.as_ref().is_ok_and(|m| m.file_type().is_symlink()) {
                    return Err(ArchiveError::traversal(&member));
                }
                if !target_meta.is_ok_and(|m| m.is_file()) {
                    log::warn!(
                        "Skipping hardlink with missing target: {} -> {}",
                        dest.display(),
                        target.display()
                    );
                    continue;
                }
                create_parent(&dest)?;
                link_or_copy(&target, &dest)?;
                written.push(rel);
            }
            _ => {
                log::debug!("Skipping unsupported entry type: {:?}", entry_type);
            }
        }
    }

    check_symlinks(root)?;
    Ok(written)
}
