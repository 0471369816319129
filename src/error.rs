//! Error taxonomy for packing, unpacking and verifying model archives.
//!
//! Every failure the library can raise is an [`ArchiveError`]. Callers that need to
//! react by class (the CLI picks its exit code this way) use [`ArchiveError::category`].
//!
//! Digest mismatches are deliberately absent: verification reports them as data
//! (see [`crate::unpacker::LayerVerification`]) so a single pass can list every bad layer.

use std::io;
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad caller input, raised before anything is written.
    Input,
    /// The container is not one of our archives (manifest or config absent/unreadable).
    Format,
    /// An archive member tried to escape the extraction root.
    Security,
    /// Filesystem or encoding failure.
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("{} is {size} bytes, above the {limit} byte per-file ceiling", path.display())]
    FileTooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("archive name '{0}' must be a single file name (check model name and version)")]
    InvalidName(String),

    #[error("path {} is not valid UTF-8", .0.display())]
    NonUtf8Path(PathBuf),

    #[error("symlink {} resolves outside the packed directory", .0.display())]
    SymlinkEscape(PathBuf),

    #[error("malformed digest '{digest}': {reason}")]
    InvalidDigest { digest: String, reason: String },

    #[error("manifest.json missing or unreadable in {}: {reason}", archive.display())]
    MissingManifest { archive: PathBuf, reason: String },

    #[error("config.json not found in archive {}", .0.display())]
    MissingConfig(PathBuf),

    #[error("config.json in {} is not a valid model config: {source}", archive.display())]
    InvalidConfig {
        archive: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("archive member '{member}' escapes the output directory")]
    PathTraversal { member: String },

    #[error("I/O error on {}: {source}", path.display())]
    IoAt {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("failed to walk source directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid OCI structure: {0}")]
    Oci(#[from] oci_spec::OciSpecError),

    #[error("failed to start layer worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl ArchiveError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ArchiveError::NotADirectory(_)
            | ArchiveError::FileNotFound(_)
            | ArchiveError::FileTooLarge { .. }
            | ArchiveError::InvalidName(_)
            | ArchiveError::NonUtf8Path(_)
            | ArchiveError::SymlinkEscape(_)
            | ArchiveError::InvalidDigest { .. } => ErrorCategory::Input,
            ArchiveError::MissingManifest { .. }
            | ArchiveError::MissingConfig(_)
            | ArchiveError::InvalidConfig { .. } => ErrorCategory::Format,
            ArchiveError::PathTraversal { .. } => ErrorCategory::Security,
            ArchiveError::IoAt { .. }
            | ArchiveError::Io(_)
            | ArchiveError::Walk(_)
            | ArchiveError::Json(_)
            | ArchiveError::Oci(_)
            | ArchiveError::WorkerPool(_) => ErrorCategory::Io,
        }
    }

    pub(crate) fn traversal(member: impl AsRef<Path>) -> Self {
        ArchiveError::PathTraversal {
            member: member.as_ref().to_string_lossy().into_owned(),
        }
    }
}

/// Attaches the offending path to an I/O error.
pub(crate) fn io_at(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> ArchiveError {
    let path = path.into();
    move |source| ArchiveError::IoAt { path, source }
}
