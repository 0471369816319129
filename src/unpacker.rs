//! Archive → directory, and digest verification.
//!
//! Unpacking checks every outer member name before reading any layer, then
//! materializes the manifest's layers in order through [`crate::tar_extractor`].
//! The archive's own `config.json` and `manifest.json` are copied to
//! [`METADATA_DIR`] under the output directory.
//!
//! Verification re-hashes each layer blob the manifest references and reports a
//! verdict per layer instead of failing, so one pass lists every bad layer.

use crate::archive::{blob_member, ArchiveReader, CONFIG_FILE, MANIFEST_FILE};
use crate::config::{ConfigBlob, ModelConfig};
use crate::digest::sha256_reader;
use crate::error::{io_at, ArchiveError, Result};
use crate::layer::layer_title;
use crate::notifier::Notifier;
use crate::tar_extractor::{self, normalize_member, resolve_link_target};
use oci_spec::image::{Digest, ImageManifest};
use std::fs;
use std::path::Path;
use tar_rs as tar;

/// Directory under the unpack output that receives the archive metadata.
pub const METADATA_DIR: &str = ".modeloci";

/// Verdict for one manifest layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerVerification {
    pub digest: Digest,
    pub title: Option<String>,
    /// `false` when the blob is missing or its recomputed digest differs.
    pub valid: bool,
}

/// Everything `inspect` reports about an archive.
#[derive(Debug, Clone)]
pub struct Inspection {
    /// `None` when the root `config.json` is absent or unreadable.
    pub config: Option<ModelConfig>,
    pub manifest: ImageManifest,
    pub verification: Vec<LayerVerification>,
}

impl Inspection {
    pub fn all_valid(&self) -> bool {
        self.verification.iter().all(|v| v.valid)
    }
}

pub struct ModelUnpacker {
    notifier: Notifier,
}

impl ModelUnpacker {
    pub fn new(notifier: Notifier) -> Self {
        Self { notifier }
    }

    /// Extracts `archive_path` into `output_dir` and returns the archive's config.
    ///
    /// # Errors
    /// - [`ArchiveError::PathTraversal`] if any outer member or layer entry would
    ///   land outside `output_dir`. Files written before the offending entry stay.
    /// - [`ArchiveError::MissingConfig`] / [`ArchiveError::MissingManifest`] if the
    ///   container is not one of ours.
    pub fn unpack(&self, archive_path: &Path, output_dir: &Path) -> Result<ModelConfig> {
        fs::create_dir_all(output_dir).map_err(io_at(output_dir))?;
        let reader = ArchiveReader::open(archive_path)?;
        self.notifier
            .info(&format!("Unpacking {}", archive_path.display()));

        check_members(&reader, output_dir)?;

        let config = reader.config()?;
        let manifest = reader.manifest()?;
        warn_on_config_mismatch(&reader, &manifest);

        let layers = manifest.layers();
        let progress = self
            .notifier
            .create_progress_bar(layers.len() as u64, "layers");
        for (i, layer) in layers.iter().enumerate() {
            let member = blob_member(layer.digest());
            let blob = reader.open_member(&member)?.ok_or_else(|| ArchiveError::IoAt {
                path: archive_path.join(&member),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "layer blob referenced by the manifest is missing",
                ),
            })?;
            let written = tar_extractor::extract_layer(blob, output_dir)?;
            log::debug!(
                "Layer {} ({}) -> {} file(s)",
                layer_title(layer).unwrap_or("<untitled>"),
                layer.digest(),
                written.len()
            );
            match &progress {
                Some(bar) => bar.inc(1),
                None => self
                    .notifier
                    .progress(i as u64 + 1, layers.len() as u64, "Extracted layers"),
            }
        }
        if let Some(bar) = progress {
            bar.finish_and_clear();
        }

        let metadata_dir = output_dir.join(METADATA_DIR);
        fs::create_dir_all(&metadata_dir).map_err(io_at(&metadata_dir))?;
        let config_out = metadata_dir.join(CONFIG_FILE);
        fs::write(&config_out, reader.config_bytes()?).map_err(io_at(&config_out))?;
        if let Some(bytes) = reader.read_member(MANIFEST_FILE)? {
            let manifest_out = metadata_dir.join(MANIFEST_FILE);
            fs::write(&manifest_out, bytes).map_err(io_at(&manifest_out))?;
        }

        log::info!(
            "Unpacked {} layers into {}",
            layers.len(),
            output_dir.display()
        );
        self.notifier.finish();
        Ok(config)
    }

    /// Re-hashes every layer blob the manifest references, in manifest order.
    ///
    /// Only a missing or unparsable manifest is an error. A missing blob or a digest
    /// mismatch is reported as `valid: false` for that layer.
    pub fn verify_layers(&self, archive_path: &Path) -> Result<Vec<LayerVerification>> {
        let reader = ArchiveReader::open(archive_path)?;
        let manifest = reader.manifest()?;
        verify_with(&reader, &manifest)
    }

    /// Config, manifest and per-layer verdicts in one read of the archive.
    pub fn inspect(&self, archive_path: &Path) -> Result<Inspection> {
        let reader = ArchiveReader::open(archive_path)?;
        let manifest = reader.manifest()?;
        let config = match reader.config() {
            Ok(config) => Some(config),
            Err(e) => {
                self.notifier.warn(&format!("{}", e));
                None
            }
        };
        let verification = verify_with(&reader, &manifest)?;
        Ok(Inspection {
            config,
            manifest,
            verification,
        })
    }
}

fn verify_with(reader: &ArchiveReader, manifest: &ImageManifest) -> Result<Vec<LayerVerification>> {
    let mut report = Vec::with_capacity(manifest.layers().len());
    for layer in manifest.layers() {
        let expected = layer.digest();
        let valid = match reader.open_member(&blob_member(expected))? {
            Some(blob) => {
                let actual = sha256_reader(blob).map_err(io_at(reader.path()))?;
                if actual != expected.to_string() {
                    log::warn!(
                        "Digest mismatch for {}: found {}",
                        expected,
                        actual
                    );
                }
                actual == expected.to_string()
            }
            None => {
                log::warn!("Blob for {} is missing", expected);
                false
            }
        };
        report.push(LayerVerification {
            digest: expected.clone(),
            title: layer_title(layer).map(str::to_string),
            valid,
        });
    }
    Ok(report)
}

/// Rejects the container if any member name or link target would escape `output_dir`.
fn check_members(reader: &ArchiveReader, output_dir: &Path) -> Result<()> {
    for member in reader.members() {
        let rel = normalize_member(&member.path)?;
        if let Some(link) = &member.link_name {
            match member.entry_type {
                tar::EntryType::Symlink => {
                    resolve_link_target(output_dir, &rel, link)?;
                }
                tar::EntryType::Link => {
                    normalize_member(link)?;
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn warn_on_config_mismatch(reader: &ArchiveReader, manifest: &ImageManifest) {
    let declared = manifest.config().digest();
    let stored = reader
        .read_member(&blob_member(declared))
        .ok()
        .flatten();
    let root_copy = reader
        .config()
        .ok()
        .and_then(|config| ConfigBlob::build(&config).ok());
    match (stored, root_copy) {
        (None, _) => log::warn!("Config blob {} is not stored in the archive", declared),
        (Some(_), Some(copy)) if copy.descriptor.digest() != declared => log::warn!(
            "config.json does not match the manifest's config blob {}",
            declared
        ),
        _ => {}
    }
}
