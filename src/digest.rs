//! SHA-256 content digests in OCI form (`sha256:<lowercase-hex>`).
//!
//! Every digest in an archive comes from here: layer blobs, the config blob and
//! re-derived digests during verification. Readers are consumed in fixed-size
//! chunks so hashing never needs a whole blob in memory.

use crate::error::{ArchiveError, Result};
use oci_spec::image::{Digest, DigestAlgorithm};
use sha2::{Digest as _, Sha256};
use std::io::{self, Read, Write};
use std::str::FromStr;

pub const SHA256_PREFIX: &str = "sha256:";

const CHUNK_SIZE: usize = 64 * 1024;

/// Digest of an in-memory buffer.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("{SHA256_PREFIX}{:x}", Sha256::digest(bytes))
}

/// Digest of a stream, read in 64 KiB chunks.
pub fn sha256_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..read]);
    }
    Ok(format!("{SHA256_PREFIX}{:x}", hasher.finalize()))
}

/// Parses a `sha256:<hex>` string into a typed digest, rejecting other algorithms.
pub fn parse_digest(digest: &str) -> Result<Digest> {
    let parsed = Digest::from_str(digest).map_err(|e| ArchiveError::InvalidDigest {
        digest: digest.to_string(),
        reason: e.to_string(),
    })?;
    if *parsed.algorithm() != DigestAlgorithm::Sha256 {
        return Err(ArchiveError::InvalidDigest {
            digest: digest.to_string(),
            reason: format!("unsupported algorithm {}", parsed.algorithm()),
        });
    }
    Ok(parsed)
}

/// Forwards writes to `inner` while hashing and counting the bytes that went through.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes_written: u64,
}

impl<W> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_written: 0,
        }
    }

    /// Returns the inner writer, the digest and the byte count.
    pub fn finish(self) -> (W, String, u64) {
        let digest = format!("{SHA256_PREFIX}{:x}", self.hasher.finalize());
        (self.inner, digest, self.bytes_written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.bytes_written = self
            .bytes_written
            .saturating_add(u64::try_from(written).unwrap_or(u64::MAX));
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
