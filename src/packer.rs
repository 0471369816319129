//! Directory → archive pipeline.
//!
//! [`ModelPacker::pack`] walks a source directory in lexicographic order of
//! relative path, turns every regular file into a layer on a bounded worker pool,
//! adds the config blob, assembles the manifest and bundles everything into
//! `<model_name>-<version>.tar` next to the source directory. The container is
//! written to a temporary file in that directory and renamed into place only on
//! success.
//!
//! Appending is a two-step protocol:
//! 1. [`ModelPacker::add_layer`] stores one new blob and returns its descriptor.
//!    The archive's manifest is not touched, so the new blob is present but
//!    unreferenced.
//! 2. To advertise it, build a new manifest with [`crate::manifest::extend_manifest`]
//!    and install it with [`ModelPacker::replace_manifest`].

use crate::archive::{self, blob_member, ArchiveReader, PackedModel, ARCHIVE_EXTENSION, MANIFEST_FILE};
use crate::blob_store::{BlobStore, FsBlobStore};
use crate::config::{ConfigBlob, ModelConfig};
use crate::error::{io_at, ArchiveError, Result};
use crate::layer::{self, LayerOptions};
use crate::manifest;
use crate::notifier::Notifier;
use oci_spec::image::{Descriptor, ImageManifest, MediaType};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tar_rs as tar;
use walkdir::WalkDir;

/// Two zero records close a tar stream.
const END_MARKER_LEN: u64 = 1024;

/// Tunables for [`ModelPacker`].
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Worker threads building layers concurrently.
    pub jobs: usize,
    /// Per-file ceiling in bytes. Each in-flight file is buffered whole, so peak
    /// memory is roughly `jobs * max_file_size`.
    pub max_file_size: u64,
    /// gzip level, 0-9. Part of content identity: changing it changes digests.
    pub compression_level: u32,
    /// Layer media type overrides keyed by layer title.
    pub media_types: BTreeMap<String, String>,
}

impl Default for PackOptions {
    fn default() -> Self {
        let layer = LayerOptions::default();
        Self {
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_file_size: layer.max_file_size,
            compression_level: layer.compression_level,
            media_types: BTreeMap::new(),
        }
    }
}

impl PackOptions {
    fn layer_options(&self, title: &str) -> LayerOptions {
        LayerOptions {
            media_type: self
                .media_types
                .get(title)
                .map(|m| MediaType::from(m.as_str()))
                .unwrap_or(MediaType::ImageLayerGzip),
            compression_level: self.compression_level,
            max_file_size: self.max_file_size,
        }
    }
}

/// A regular file found under the source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Forward-slash path relative to the root; becomes the layer title.
    pub title: String,
    /// Path to read the bytes from (the link itself for dereferenced symlinks).
    pub path: PathBuf,
}

pub struct ModelPacker {
    options: PackOptions,
    notifier: Notifier,
}

impl ModelPacker {
    pub fn new(notifier: Notifier) -> Self {
        Self {
            options: PackOptions::default(),
            notifier,
        }
    }

    pub fn with_options(mut self, options: PackOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &PackOptions {
        &self.options
    }

    /// Packs `source_dir` into `<parent>/<model_name>-<version>.tar` and returns that path.
    ///
    /// # Errors
    /// - [`ArchiveError::NotADirectory`] / [`ArchiveError::InvalidName`] before anything is written.
    /// - [`ArchiveError::SymlinkEscape`] / [`ArchiveError::FileTooLarge`] while building layers;
    ///   no output file appears in that case.
    pub fn pack(&self, source_dir: &Path, config: &ModelConfig) -> Result<PathBuf> {
        if !source_dir.is_dir() {
            return Err(ArchiveError::NotADirectory(source_dir.to_path_buf()));
        }
        let file_name = archive_file_name(config)?;
        let root = fs::canonicalize(source_dir).map_err(io_at(source_dir))?;
        let parent = root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.clone());
        let output = parent.join(file_name);

        self.notifier.info(&format!(
            "Packing {} as {}",
            root.display(),
            config.archive_stem()
        ));

        let scratch = tempfile::tempdir().map_err(io_at(std::env::temp_dir()))?;
        let store = FsBlobStore::create(scratch.path())?;
        let packed = self.build(&root, config, &store)?;

        self.notifier.info("Writing archive...");
        let staged = tempfile::NamedTempFile::new_in(&parent).map_err(io_at(&parent))?;
        let (staged, digest) = archive::write_archive(&store, &packed, staged)?;
        staged.as_file().sync_all().map_err(io_at(staged.path()))?;
        staged.persist(&output).map_err(|e| ArchiveError::IoAt {
            path: output.clone(),
            source: e.error,
        })?;

        log::info!(
            "Packed {} layers into {} ({})",
            packed.manifest.layers().len(),
            output.display(),
            digest
        );
        self.notifier.finish();
        Ok(output)
    }

    /// Builds every blob for `root` into `store` and returns the config blob and
    /// manifest. Manifest layer order is the traversal order of [`collect_files`].
    pub fn build(
        &self,
        root: &Path,
        config: &ModelConfig,
        store: &dyn BlobStore,
    ) -> Result<PackedModel> {
        if !root.is_dir() {
            return Err(ArchiveError::NotADirectory(root.to_path_buf()));
        }
        let files = collect_files(root)?;
        self.notifier
            .info(&format!("Building {} layers...", files.len()));

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.jobs.max(1))
            .build()?;
        let progress = self
            .notifier
            .create_progress_bar(files.len() as u64, "layers");
        let options = &self.options;

        // Indexed collect keeps results in traversal order, not completion order.
        let layers: Vec<Descriptor> = pool.install(|| {
            files
                .par_iter()
                .map(|file| {
                    let built = layer::build_layer_titled(
                        &file.path,
                        &file.title,
                        &options.layer_options(&file.title),
                    )?;
                    store.put(built.descriptor.digest(), &built.blob)?;
                    if let Some(bar) = &progress {
                        bar.inc(1);
                    }
                    log::debug!("Layer {} -> {}", file.title, built.descriptor.digest());
                    Ok(built.descriptor)
                })
                .collect::<Result<Vec<_>>>()
        })?;
        if let Some(bar) = progress {
            bar.finish_and_clear();
        }

        let config_blob = ConfigBlob::build(config)?;
        store.put(config_blob.descriptor.digest(), &config_blob.bytes)?;
        let manifest = manifest::build_manifest(config_blob.descriptor.clone(), layers)?;

        Ok(PackedModel {
            config: config_blob,
            manifest,
        })
    }

    /// Step one of the append protocol: stores `file` as a new layer blob in the
    /// existing archive and returns its descriptor. The manifest is NOT updated.
    ///
    /// The layer is titled with the file's base name. The blob is written in place
    /// over the end-of-archive marker; if that write fails the marker is restored
    /// and the archive reads as it did before.
    pub fn add_layer(&self, archive_path: &Path, file: &Path) -> Result<Descriptor> {
        self.add_layer_as(archive_path, file, MediaType::ImageLayerGzip)
    }

    /// [`ModelPacker::add_layer`] with an explicit layer media type.
    pub fn add_layer_as(
        &self,
        archive_path: &Path,
        file: &Path,
        media_type: MediaType,
    ) -> Result<Descriptor> {
        if !file.is_file() {
            return Err(ArchiveError::FileNotFound(file.to_path_buf()));
        }
        let name = file
            .file_name()
            .ok_or_else(|| ArchiveError::FileNotFound(file.to_path_buf()))?;
        let title = name
            .to_str()
            .ok_or_else(|| ArchiveError::NonUtf8Path(file.to_path_buf()))?
            .to_string();
        let options = LayerOptions {
            media_type,
            compression_level: self.options.compression_level,
            max_file_size: self.options.max_file_size,
        };
        let built = layer::build_layer_titled(file, &title, &options)?;
        let member = blob_member(built.descriptor.digest());

        let reader = ArchiveReader::open(archive_path)?;
        if reader.contains(&member) {
            self.notifier
                .info(&format!("Blob {} already present, nothing appended", member));
            return Ok(built.descriptor);
        }

        let original_len = fs::metadata(archive_path)
            .map_err(io_at(archive_path))?
            .len();
        if let Err(err) = append_member(archive_path, reader.data_end(), &member, &built.blob) {
            log::warn!(
                "Appending to {} failed, restoring the end-of-archive marker",
                archive_path.display()
            );
            if let Err(restore) = restore_tail(archive_path, reader.data_end(), original_len) {
                log::error!("Could not restore {}: {}", archive_path.display(), restore);
            }
            return Err(err);
        }

        self.notifier.info(&format!(
            "Appended {} as {} (manifest unchanged)",
            title,
            built.descriptor.digest()
        ));
        Ok(built.descriptor)
    }

    /// Step two of the append protocol: rewrites the archive with `manifest` as
    /// its `manifest.json`, keeping every other member. The rewrite goes to a
    /// temporary file that replaces the archive atomically.
    pub fn replace_manifest(&self, archive_path: &Path, manifest: &ImageManifest) -> Result<()> {
        let reader = ArchiveReader::open(archive_path)?;
        for layer in manifest.layers() {
            if !reader.contains(&blob_member(layer.digest())) {
                log::warn!(
                    "New manifest references {} which is not stored in {}",
                    layer.digest(),
                    archive_path.display()
                );
            }
        }

        let parent = archive_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let staged = tempfile::NamedTempFile::new_in(parent).map_err(io_at(parent))?;
        let mut builder = tar::Builder::new(staged);

        let source = fs::File::open(archive_path).map_err(io_at(archive_path))?;
        let mut old = tar::Archive::new(source);
        for entry in old.entries().map_err(io_at(archive_path))? {
            let mut entry = entry.map_err(io_at(archive_path))?;
            let path = entry.path().map_err(io_at(archive_path))?.into_owned();
            if path == Path::new(MANIFEST_FILE) {
                continue;
            }
            let mut header = entry.header().clone();
            builder
                .append_data(&mut header, &path, &mut entry)
                .map_err(io_at(archive_path))?;
        }
        archive::append_file(&mut builder, MANIFEST_FILE, &manifest::to_json(manifest)?)?;

        let staged = builder.into_inner().map_err(io_at(archive_path))?;
        staged.as_file().sync_all().map_err(io_at(staged.path()))?;
        staged.persist(archive_path).map_err(|e| ArchiveError::IoAt {
            path: archive_path.to_path_buf(),
            source: e.error,
        })?;
        self.notifier.info(&format!(
            "Replaced manifest of {} ({} layers)",
            archive_path.display(),
            manifest.layers().len()
        ));
        Ok(())
    }
}

/// `<model_name>-<version>.tar`, which must name a single entry of the output directory.
fn archive_file_name(config: &ModelConfig) -> Result<String> {
    let name = format!("{}.{}", config.archive_stem(), ARCHIVE_EXTENSION);
    let mut components = Path::new(&name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == name.as_str() => Ok(name),
        _ => Err(ArchiveError::InvalidName(config.archive_stem())),
    }
}

/// Overwrites the end-of-archive marker at `data_end` with `member`; the
/// builder writes a fresh marker when it finishes.
fn append_member(archive_path: &Path, data_end: u64, member: &str, blob: &[u8]) -> Result<()> {
    let mut handle = OpenOptions::new()
        .read(true)
        .write(true)
        .open(archive_path)
        .map_err(io_at(archive_path))?;
    handle.set_len(data_end).map_err(io_at(archive_path))?;
    handle
        .seek(SeekFrom::Start(data_end))
        .map_err(io_at(archive_path))?;
    let mut builder = tar::Builder::new(handle);
    archive::append_file(&mut builder, member, blob)?;
    let handle = builder.into_inner().map_err(io_at(archive_path))?;
    handle.sync_all().map_err(io_at(archive_path))?;
    Ok(())
}

/// Drops anything written past `data_end` and zero-fills the file back out to
/// `len`, which puts the end-of-archive marker back.
fn restore_tail(archive_path: &Path, data_end: u64, len: u64) -> Result<()> {
    let handle = OpenOptions::new()
        .write(true)
        .open(archive_path)
        .map_err(io_at(archive_path))?;
    handle.set_len(data_end).map_err(io_at(archive_path))?;
    handle
        .set_len(len.max(data_end + END_MARKER_LEN))
        .map_err(io_at(archive_path))?;
    handle.sync_all().map_err(io_at(archive_path))?;
    Ok(())
}

/// Lists the regular files under `root`, sorted by forward-slash relative path.
///
/// Symlinks are dereferenced when they resolve to a regular file inside `root`,
/// skipped when they point at a directory or nowhere, and rejected with
/// [`ArchiveError::SymlinkEscape`] when they resolve outside `root`.
pub fn collect_files(root: &Path) -> Result<Vec<SourceFile>> {
    let canonical_root = fs::canonicalize(root).map_err(io_at(root))?;
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type();

        if file_type.is_dir() {
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let Some(title) = layer::relative_title(relative)? else {
            continue;
        };

        if file_type.is_symlink() {
            let target = match fs::canonicalize(path) {
                Ok(target) => target,
                Err(_) => {
                    log::warn!("Skipping dangling symlink {}", path.display());
                    continue;
                }
            };
            if !target.starts_with(&canonical_root) {
                return Err(ArchiveError::SymlinkEscape(path.to_path_buf()));
            }
            if !target.is_file() {
                log::warn!("Skipping symlink to non-file {}", path.display());
                continue;
            }
        } else if !file_type.is_file() {
            log::debug!("Skipping special file {}", path.display());
            continue;
        }

        files.push(SourceFile {
            title,
            path: path.to_path_buf(),
        });
    }

    files.sort_by(|a, b| a.title.cmp(&b.title));
    Ok(files)
}
