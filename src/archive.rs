//! The archive container: an uncompressed tar holding
//!
//! ```text
//! blobs/sha256/<hex>   one member per blob (layers and the config blob)
//! config.json          human-readable copy of the config blob
//! manifest.json        the OCI image manifest
//! ```
//!
//! [`write_archive`] produces the container with fixed header metadata, so packing
//! the same content twice yields the same bytes. [`ArchiveReader`] indexes members
//! by name in one header pass and reads them back through seeks, never holding
//! more than one member's reader at a time.

use crate::blob_store::BlobStore;
use crate::config::{ConfigBlob, ModelConfig};
use crate::digest::{parse_digest, HashingWriter};
use crate::error::{io_at, ArchiveError, Result};
use crate::manifest;
use oci_spec::image::{Digest, ImageManifest};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use tar_rs as tar;

pub const BLOBS_DIR: &str = "blobs/sha256";
pub const CONFIG_FILE: &str = "config.json";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const ARCHIVE_EXTENSION: &str = "tar";

/// Container member name of the blob for `digest`.
pub fn blob_member(digest: &Digest) -> String {
    format!("{}/{}", BLOBS_DIR, digest.digest())
}

/// A config blob and manifest ready to be bundled with their layer blobs.
#[derive(Debug, Clone)]
pub struct PackedModel {
    pub config: ConfigBlob,
    pub manifest: ImageManifest,
}

/// Writes the container for `packed` into `writer`, pulling blobs from `store`.
/// Returns the writer and the digest of the container bytes.
pub fn write_archive<W: Write>(
    store: &dyn BlobStore,
    packed: &PackedModel,
    writer: W,
) -> Result<(W, String)> {
    let mut builder = tar::Builder::new(HashingWriter::new(writer));

    append_dir(&mut builder, "blobs/")?;
    append_dir(&mut builder, "blobs/sha256/")?;

    // Blobs sorted by hex; identical content appears once.
    let mut digests: BTreeSet<String> = BTreeSet::new();
    digests.insert(packed.config.descriptor.digest().to_string());
    for layer in packed.manifest.layers() {
        digests.insert(layer.digest().to_string());
    }
    let ordered: Vec<Digest> = digests
        .iter()
        .map(|d| parse_digest(d))
        .collect::<Result<_>>()?;

    for digest in &ordered {
        let bytes = match store.get(digest)? {
            Some(bytes) => bytes,
            None => {
                return Err(ArchiveError::IoAt {
                    path: PathBuf::from(blob_member(digest)),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "blob missing from staging store",
                    ),
                })
            }
        };
        append_file(&mut builder, &blob_member(digest), &bytes)?;
    }

    append_file(&mut builder, CONFIG_FILE, &packed.config.bytes)?;
    append_file(&mut builder, MANIFEST_FILE, &manifest::to_json(&packed.manifest)?)?;

    let hashing = builder.into_inner()?;
    let (writer, digest, size) = hashing.finish();
    log::debug!("Wrote container of {} bytes ({})", size, digest);
    Ok((writer, digest))
}

pub(crate) fn fixed_header(entry_type: tar::EntryType, size: u64, mode: u32) -> Result<tar::Header> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_username("")?;
    header.set_groupname("")?;
    Ok(header)
}

pub(crate) fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    bytes: &[u8],
) -> Result<()> {
    let mut header = fixed_header(tar::EntryType::Regular, bytes.len() as u64, 0o644)?;
    builder.append_data(&mut header, name, bytes)?;
    Ok(())
}

fn append_dir<W: Write>(builder: &mut tar::Builder<W>, name: &str) -> Result<()> {
    let mut header = fixed_header(tar::EntryType::Directory, 0, 0o755)?;
    builder.append_data(&mut header, name, std::io::empty())?;
    Ok(())
}

/// One container member as seen by a header scan.
#[derive(Debug, Clone)]
pub struct Member {
    /// Raw member path, exactly as stored.
    pub path: PathBuf,
    pub entry_type: tar::EntryType,
    pub link_name: Option<PathBuf>,
    /// Offset of the member's data within the container.
    pub offset: u64,
    pub size: u64,
}

/// Read access to a container by member name.
pub struct ArchiveReader {
    path: PathBuf,
    members: Vec<Member>,
    /// Normalized name -> index into `members`; later duplicates win, as in tar.
    index: BTreeMap<String, usize>,
    /// Offset just past the last member's data (where an end-of-archive marker starts).
    data_end: u64,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(io_at(path))?;
        let mut archive = tar::Archive::new(file);
        let mut members = Vec::new();
        let mut index = BTreeMap::new();
        let mut data_end = 0u64;

        for entry in archive.entries().map_err(io_at(path))? {
            let entry = entry.map_err(io_at(path))?;
            let member_path = entry.path().map_err(io_at(path))?.into_owned();
            let link_name = entry
                .link_name()
                .map_err(io_at(path))?
                .map(|l| l.into_owned());
            let offset = entry.raw_file_position();
            let size = entry.size();
            data_end = data_end.max(offset + size.div_ceil(512) * 512);

            if let Some(name) = normalized_name(&member_path) {
                index.insert(name, members.len());
            }
            members.push(Member {
                path: member_path,
                entry_type: entry.header().entry_type(),
                link_name,
                offset,
                size,
            });
        }

        log::debug!("Indexed {} members in {}", members.len(), path.display());
        Ok(Self {
            path: path.to_path_buf(),
            members,
            index,
            data_end,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.index.get(name).map(|&i| &self.members[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.member(name).is_some()
    }

    pub(crate) fn data_end(&self) -> u64 {
        self.data_end
    }

    /// Streams the data of member `name`, if present.
    pub fn open_member(&self, name: &str) -> Result<Option<impl Read>> {
        let Some(member) = self.member(name) else {
            return Ok(None);
        };
        let mut file = File::open(&self.path).map_err(io_at(&self.path))?;
        file.seek(SeekFrom::Start(member.offset))
            .map_err(io_at(&self.path))?;
        Ok(Some(file.take(member.size)))
    }

    pub fn read_member(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let Some(mut reader) = self.open_member(name)? else {
            return Ok(None);
        };
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(io_at(&self.path))?;
        Ok(Some(bytes))
    }

    pub fn manifest(&self) -> Result<ImageManifest> {
        let bytes = self
            .read_member(MANIFEST_FILE)?
            .ok_or_else(|| ArchiveError::MissingManifest {
                archive: self.path.clone(),
                reason: "no manifest.json member".to_string(),
            })?;
        manifest::parse(&bytes, &self.path)
    }

    /// Raw bytes of the root `config.json`.
    pub fn config_bytes(&self) -> Result<Vec<u8>> {
        self.read_member(CONFIG_FILE)?
            .ok_or_else(|| ArchiveError::MissingConfig(self.path.clone()))
    }

    pub fn config(&self) -> Result<ModelConfig> {
        let bytes = self.config_bytes()?;
        serde_json::from_slice(&bytes).map_err(|source| ArchiveError::InvalidConfig {
            archive: self.path.clone(),
            source,
        })
    }
}

/// Lookup key for a member path: `.` segments and trailing slashes dropped.
/// Paths that are absolute, climb with `..` or are not UTF-8 get no key.
fn normalized_name(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}
