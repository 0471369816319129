//! Single-file layer construction.
//!
//! A layer is one source file wrapped in a one-entry tar (entry name = the file's
//! forward-slash path relative to the packed root) and gzip-compressed. Nothing
//! host-dependent reaches the compressed bytes: the tar header has zero mtime,
//! uid and gid, empty owner names and a fixed mode, and the gzip header has zero
//! mtime and no file name. Identical input therefore yields identical bytes, and
//! the digest of those bytes is the layer's identity.

use crate::digest::{parse_digest, HashingWriter};
use crate::error::{io_at, ArchiveError, Result};
use flate2::{Compression, GzBuilder};
use oci_spec::image::{Descriptor, MediaType};
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path};
use tar_rs as tar;

/// OCI annotation carrying the file's relative path.
pub const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";

/// Per-call knobs for [`build_layer`].
#[derive(Debug, Clone)]
pub struct LayerOptions {
    pub media_type: MediaType,
    /// gzip level, 0-9.
    pub compression_level: u32,
    /// Files larger than this are refused before they are read.
    pub max_file_size: u64,
}

impl Default for LayerOptions {
    fn default() -> Self {
        Self {
            media_type: MediaType::ImageLayerGzip,
            compression_level: 6,
            max_file_size: 4 * 1024 * 1024 * 1024,
        }
    }
}

/// A finished layer: descriptor plus the compressed blob it describes.
#[derive(Debug, Clone)]
pub struct BuiltLayer {
    pub descriptor: Descriptor,
    pub blob: Vec<u8>,
}

impl BuiltLayer {
    pub fn title(&self) -> Option<&str> {
        layer_title(&self.descriptor)
    }
}

/// Reads the title annotation of a layer descriptor.
pub fn layer_title(descriptor: &Descriptor) -> Option<&str> {
    descriptor
        .annotations()
        .as_ref()
        .and_then(|a| a.get(TITLE_ANNOTATION))
        .map(String::as_str)
}

/// Builds the layer for `file`, titled by its path relative to `root`.
pub fn build_layer(file: &Path, root: &Path, options: &LayerOptions) -> Result<BuiltLayer> {
    let relative = file
        .strip_prefix(root)
        .map_err(|_| ArchiveError::FileNotFound(file.to_path_buf()))?;
    let title =
        relative_title(relative)?.ok_or_else(|| ArchiveError::FileNotFound(file.to_path_buf()))?;
    build_layer_titled(file, &title, options)
}

/// Builds the layer for `file` under an explicit archive-relative `title`.
pub fn build_layer_titled(file: &Path, title: &str, options: &LayerOptions) -> Result<BuiltLayer> {
    // fs::metadata follows symlinks, matching what fs::read will see.
    let metadata = match fs::metadata(file) {
        Ok(m) if m.is_file() => m,
        Ok(_) => return Err(ArchiveError::FileNotFound(file.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ArchiveError::FileNotFound(file.to_path_buf()))
        }
        Err(e) => return Err(io_at(file)(e)),
    };
    if metadata.len() > options.max_file_size {
        return Err(ArchiveError::FileTooLarge {
            path: file.to_path_buf(),
            size: metadata.len(),
            limit: options.max_file_size,
        });
    }

    let contents = fs::read(file).map_err(io_at(file))?;
    let mode = if is_executable(&metadata) { 0o755 } else { 0o644 };

    log::debug!("Compressing {} ({} bytes)", title, contents.len());
    let (blob, digest, size) = compress_entry(title, &contents, mode, options.compression_level)?;

    let mut annotations = HashMap::new();
    annotations.insert(TITLE_ANNOTATION.to_string(), title.to_string());
    let mut descriptor = Descriptor::new(options.media_type.clone(), size, parse_digest(&digest)?);
    descriptor.set_annotations(Some(annotations));

    Ok(BuiltLayer { descriptor, blob })
}

/// Joins the normal components of `relative` with `/`. `None` for an empty path or
/// one containing anything but plain names. Non-UTF-8 names fail with
/// [`ArchiveError::NonUtf8Path`].
pub fn relative_title(relative: &Path) -> Result<Option<String>> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => return Err(ArchiveError::NonUtf8Path(relative.to_path_buf())),
            },
            Component::CurDir => {}
            _ => return Ok(None),
        }
    }
    if parts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parts.join("/")))
    }
}

fn compress_entry(
    title: &str,
    contents: &[u8],
    mode: u32,
    level: u32,
) -> Result<(Vec<u8>, String, u64)> {
    let encoder = GzBuilder::new()
        .mtime(0)
        .write(HashingWriter::new(Vec::new()), Compression::new(level.min(9)));
    let mut builder = tar::Builder::new(encoder);

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_username("")?;
    header.set_groupname("")?;
    builder.append_data(&mut header, title, contents)?;

    let encoder = builder.into_inner()?;
    let (blob, digest, size) = encoder.finish()?.finish();
    Ok((blob, digest, size))
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}
