//! Manifest assembly and parsing.
//!
//! The manifest is the archive's bill of materials: one config descriptor and the
//! layer descriptors in pack-time traversal order. Building it checks shape only
//! (every digest must be a well-formed `sha256:` digest); whether a digest matches
//! the stored bytes is the verifier's question.

use crate::digest::parse_digest;
use crate::error::{ArchiveError, Result};
use oci_spec::image::{Descriptor, ImageManifest, ImageManifestBuilder, MediaType, SCHEMA_VERSION};
use std::path::Path;

pub fn build_manifest(config: Descriptor, layers: Vec<Descriptor>) -> Result<ImageManifest> {
    check_shape(&config)?;
    for layer in &layers {
        check_shape(layer)?;
    }
    let manifest = ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageManifest)
        .config(config)
        .layers(layers)
        .build()?;
    Ok(manifest)
}

/// Second half of the append protocol: a new manifest advertising `extra` after
/// the existing layers. The input manifest is left untouched.
pub fn extend_manifest(manifest: &ImageManifest, extra: Vec<Descriptor>) -> Result<ImageManifest> {
    let mut layers = manifest.layers().clone();
    layers.extend(extra);
    build_manifest(manifest.config().clone(), layers)
}

pub fn to_json(manifest: &ImageManifest) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(manifest)?)
}

/// Parses manifest bytes read from `archive`. Any failure means the container is
/// not one of ours, so it surfaces as [`ArchiveError::MissingManifest`].
pub fn parse(bytes: &[u8], archive: &Path) -> Result<ImageManifest> {
    let manifest: ImageManifest =
        serde_json::from_slice(bytes).map_err(|e| ArchiveError::MissingManifest {
            archive: archive.to_path_buf(),
            reason: e.to_string(),
        })?;
    if manifest.schema_version() != SCHEMA_VERSION {
        return Err(ArchiveError::MissingManifest {
            archive: archive.to_path_buf(),
            reason: format!("unsupported schemaVersion {}", manifest.schema_version()),
        });
    }
    Ok(manifest)
}

fn check_shape(descriptor: &Descriptor) -> Result<()> {
    parse_digest(&descriptor.digest().to_string()).map(|_| ())
}
