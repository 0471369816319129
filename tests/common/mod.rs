//! Common utilities for integration tests

use flate2::{write::GzEncoder, Compression};
use modeloci::archive::{write_archive, ArchiveReader, PackedModel};
use modeloci::config::ConfigBlob;
use modeloci::digest::{parse_digest, sha256_digest};
use modeloci::layer::TITLE_ANNOTATION;
use modeloci::manifest::build_manifest;
use modeloci::{BlobStore, MemoryBlobStore, ModelConfig, ModelPacker, Notifier};
use oci_spec::image::{Descriptor, Digest, MediaType};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tar_rs as tar;

#[allow(dead_code)]
pub fn demo_config() -> ModelConfig {
    ModelConfig::new("demo", "1.0.0", "pytorch", "transformer")
}

/// Writes `files` (relative path, contents) under `root`.
pub fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (rel, bytes) in files {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }
}

/// Creates `<parent>/model` holding `files` and packs it.
#[allow(dead_code)]
pub fn pack_tree(parent: &Path, files: &[(&str, &[u8])], config: &ModelConfig) -> PathBuf {
    let src = parent.join("model");
    fs::create_dir_all(&src).unwrap();
    write_tree(&src, files);
    ModelPacker::new(Notifier::silent()).pack(&src, config).unwrap()
}

/// Tar bytes whose single entry carries `name` verbatim, bypassing the
/// path checks `tar::Header::set_path` would apply.
pub fn raw_entry_tar(name: &str, contents: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_old();
    header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, contents).unwrap();
    builder.into_inner().unwrap()
}

/// Tar bytes holding one symlink member per (name, target) pair, targets unchecked.
#[allow(dead_code)]
pub fn raw_symlink_tar(links: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, target) in links {
        let mut header = tar::Header::new_gnu();
        header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        header.set_link_name(target).unwrap();
        header.set_cksum();
        builder.append(&header, std::io::empty()).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Builds an archive whose only layer extracts to the entry `entry_name`.
#[allow(dead_code)]
pub fn archive_with_layer_entry(dir: &Path, entry_name: &str) -> PathBuf {
    archive_with_layer_tar(dir, entry_name, &raw_entry_tar(entry_name, b"escaped"))
}

/// Builds an archive with a single layer made of `layer_tar`, titled `title`.
#[allow(dead_code)]
pub fn archive_with_layer_tar(dir: &Path, title: &str, layer_tar: &[u8]) -> PathBuf {
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(layer_tar).unwrap();
    let blob = gz.finish().unwrap();

    let store = MemoryBlobStore::new();
    let digest = parse_digest(&sha256_digest(&blob)).unwrap();
    store.put(&digest, &blob).unwrap();
    let mut layer = Descriptor::new(MediaType::ImageLayerGzip, blob.len() as u64, digest);
    let mut annotations = HashMap::new();
    annotations.insert(TITLE_ANNOTATION.to_string(), title.to_string());
    layer.set_annotations(Some(annotations));

    let config = ConfigBlob::build(&demo_config()).unwrap();
    store.put(config.descriptor.digest(), &config.bytes).unwrap();
    let manifest = build_manifest(config.descriptor.clone(), vec![layer]).unwrap();

    let path = dir.join("malicious.tar");
    write_archive(&store, &PackedModel { config, manifest }, File::create(&path).unwrap()).unwrap();
    path
}

/// A container holding `members` verbatim (names unchecked), in order.
#[allow(dead_code)]
pub fn raw_container(dir: &Path, file_name: &str, members: &[(&str, &[u8])]) -> PathBuf {
    let mut bytes = Vec::new();
    for (name, contents) in members {
        let single = raw_entry_tar(name, contents);
        // Drop each single-entry tar's two-block end marker before concatenating.
        bytes.extend_from_slice(&single[..single.len() - 1024]);
    }
    bytes.extend_from_slice(&[0u8; 1024]);
    let path = dir.join(file_name);
    fs::write(&path, bytes).unwrap();
    path
}

/// Root `config.json` and `manifest.json` bytes for an archive with no layers.
#[allow(dead_code)]
pub fn empty_model_members() -> (Vec<u8>, Vec<u8>) {
    let config = ConfigBlob::build(&demo_config()).unwrap();
    let manifest = build_manifest(config.descriptor.clone(), Vec::new()).unwrap();
    (config.bytes, serde_json::to_vec_pretty(&manifest).unwrap())
}

/// Flips one byte in the middle of the stored blob for `digest`.
#[allow(dead_code)]
pub fn corrupt_blob(archive: &Path, digest: &Digest) {
    let reader = ArchiveReader::open(archive).unwrap();
    let member = reader
        .member(&modeloci::archive::blob_member(digest))
        .unwrap()
        .clone();
    let mut file = OpenOptions::new().read(true).write(true).open(archive).unwrap();
    let at = member.offset + member.size / 2;
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(at)).unwrap();
    file.read_exact(&mut byte).unwrap();
    file.seek(SeekFrom::Start(at)).unwrap();
    file.write_all(&[byte[0] ^ 0xff]).unwrap();
}

/// Every regular file under `root` as (forward-slash relative path, bytes), skipping `skip`.
#[allow(dead_code)]
pub fn read_tree(root: &Path, skip: &str) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.unwrap();
        let rel = entry.path().strip_prefix(root).unwrap();
        if rel.starts_with(skip) || !entry.file_type().is_file() {
            continue;
        }
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        out.push((name, fs::read(entry.path()).unwrap()));
    }
    out.sort();
    out
}
