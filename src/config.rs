//! Model configuration and its content-addressed config blob.

use crate::digest::{parse_digest, sha256_digest};
use crate::error::Result;
use oci_spec::image::{Descriptor, MediaType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Describes the packaged model. Once embedded in a manifest it is immutable:
/// any change yields a different config blob digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_name: String,
    pub version: String,
    pub framework: String,
    pub architecture: String,
    /// Free-form metadata. Never interpreted by the archive engine.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ModelConfig {
    pub fn new(
        model_name: impl Into<String>,
        version: impl Into<String>,
        framework: impl Into<String>,
        architecture: impl Into<String>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            version: version.into(),
            framework: framework.into(),
            architecture: architecture.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Canonical JSON: fixed field order, sorted metadata keys, two-space indentation.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// `<model_name>-<version>`, the archive's base name.
    pub fn archive_stem(&self) -> String {
        format!("{}-{}", self.model_name, self.version)
    }
}

/// Serialized config plus its descriptor. The bytes are stored raw (uncompressed).
#[derive(Debug, Clone)]
pub struct ConfigBlob {
    pub bytes: Vec<u8>,
    pub descriptor: Descriptor,
}

impl ConfigBlob {
    pub fn build(config: &ModelConfig) -> Result<Self> {
        let bytes = config.to_canonical_json()?;
        let digest = parse_digest(&sha256_digest(&bytes))?;
        let descriptor = Descriptor::new(MediaType::ImageConfig, bytes.len() as u64, digest);
        Ok(Self { bytes, descriptor })
    }
}
