pub mod archive;
pub mod blob_store;
pub mod config;
pub mod digest;
pub mod error;
pub mod layer;
pub mod manifest;
pub mod notifier;
pub mod packer;
pub mod tar_extractor;
pub mod unpacker;

// Re-exports for easy access
pub use blob_store::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use config::ModelConfig;
pub use error::{ArchiveError, ErrorCategory};
pub use notifier::Notifier;
pub use packer::{ModelPacker, PackOptions};
pub use unpacker::{Inspection, LayerVerification, ModelUnpacker};
