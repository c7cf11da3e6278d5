//! OCI image-spec data structures and modelkit annotations.
//!
//! Manifests, indexes, and descriptors are serialized with alphabetized
//! annotation maps so that packing the same inputs always yields the same
//! bytes (and therefore the same digests).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kitforge_core::{KitError, Result};
use serde::{Deserialize, Serialize};

use crate::digest;

/// Media type for OCI image manifests.
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media type for OCI image indexes.
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// Annotation naming the tag a manifest descriptor was stored under.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Annotation recording the original path of the file packed into a layer.
pub const FILEPATH_ANNOTATION: &str = "org.cncf.model.filepath";

/// Annotation carrying JSON-encoded file metadata for a layer.
pub const FILE_METADATA_ANNOTATION: &str = "org.cncf.model.file.metadata";

/// Annotation distinguishing prompt layers from generic code layers.
pub const LAYER_SUBTYPE_ANNOTATION: &str = "ml.kitops.modelkit.layer.subtype";

/// Subtype annotation value for prompt layers.
pub const LAYER_SUBTYPE_PROMPT: &str = "prompt";

/// Annotation embedding the Kitfile in modelpack-format manifests.
pub const KITFILE_ANNOTATION: &str = "ml.kitops.modelkit.kitfile";

/// A content descriptor: media type, digest, and size of a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,

    pub digest: String,

    pub size: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    /// Create a descriptor with no annotations.
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: i64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            annotations: None,
        }
    }

    /// Look up an annotation value.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(|s| s.as_str())
    }

    /// Add an annotation, creating the map if needed.
    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
    }

    /// The tag this descriptor was stored under, if any.
    pub fn ref_name(&self) -> Option<&str> {
        self.annotation(REF_NAME_ANNOTATION)
    }
}

/// An OCI image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType")]
    pub media_type: String,

    #[serde(
        rename = "artifactType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub artifact_type: Option<String>,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Manifest {
    /// Parse a manifest from raw JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(KitError::from)
    }

    /// Serialize to canonical JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(KitError::from)
    }

    /// Serialize and describe this manifest: returns (bytes, descriptor).
    pub fn to_descriptor(&self) -> Result<(Vec<u8>, Descriptor)> {
        let bytes = self.to_bytes()?;
        let desc = Descriptor::new(
            OCI_MANIFEST_MEDIA_TYPE,
            digest::sha256_digest(&bytes),
            bytes.len() as i64,
        );
        Ok((bytes, desc))
    }
}

/// An OCI image index, as stored in a repository's `index.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    /// A fresh, empty index.
    pub fn empty() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(OCI_INDEX_MEDIA_TYPE.to_string()),
            manifests: Vec::new(),
        }
    }
}

/// Contents of the `oci-layout` marker file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciLayout {
    #[serde(rename = "imageLayoutVersion")]
    pub image_layout_version: String,
}

impl Default for OciLayout {
    fn default() -> Self {
        Self {
            image_layout_version: "1.0.0".to_string(),
        }
    }
}

/// File metadata recorded in the `org.cncf.model.file.metadata` annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    #[serde(rename = "modTime")]
    pub mod_time: DateTime<Utc>,
    pub typeflag: u8,
}

/// Minimal modelpack config blob written for modelpack-format artifacts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<ModelDescriptor>,

    #[serde(rename = "modelfs")]
    pub model_fs: ModelFs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelFs {
    #[serde(rename = "type")]
    pub fs_type: String,

    #[serde(rename = "diffIds", default)]
    pub diff_ids: Vec<String>,
}
