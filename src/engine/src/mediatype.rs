//! Media types for modelkit layers.
//!
//! Two dialects share one algebra: the Kit format
//! (`application/vnd.kitops.modelkit.<base>.v1.tar[+<compression>]`) and the
//! CNCF ModelPack format
//! (`application/vnd.cncf.model.<base>.v1.<format>[+<compression>]`). Both
//! decompose into a base type, a format, and a compression.

use std::fmt;
use std::sync::OnceLock;

use kitforge_core::{KitError, Result};
use regex::Regex;

use crate::oci;

/// Config media type for Kit-format modelkits.
pub const KIT_CONFIG_MEDIA_TYPE: &str = "application/vnd.kitops.modelkit.config.v1+json";

/// Config media type for ModelPack-format artifacts.
pub const MODELPACK_CONFIG_MEDIA_TYPE: &str = "application/vnd.cncf.model.config.v1+json";

/// Artifact type carried on Kit-format manifests.
pub const KIT_MANIFEST_ARTIFACT_TYPE: &str = "application/vnd.kitops.modelkit.manifest.v1+json";

/// Artifact type carried on ModelPack-format manifests.
pub const MODELPACK_MANIFEST_ARTIFACT_TYPE: &str = "application/vnd.cncf.model.manifest.v1+json";

fn kit_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^application/vnd\.kitops\.modelkit\.(\w+)\.v1\.tar(?:\+(\w+))?$").unwrap()
    })
}

fn modelpack_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^application/vnd\.cncf\.model\.(\w+(?:\.\w+)?)\.v1\.(\w+)(?:\+?(\w+))?$")
            .unwrap()
    })
}

/// The kind of payload carried in a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseType {
    Config,
    Model,
    /// Model-related files; reused for the `model.config` type in ModelPack.
    ModelPart,
    Dataset,
    Code,
    Docs,
}

/// Layer compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
    GzipFastest,
    Zstd,
}

/// Layer payload format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Tar,
    Raw,
}

/// Which artifact dialect a manifest belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    Kit,
    ModelPack,
}

/// A parsed layer media type, in either dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    Kit {
        base: BaseType,
        compression: CompressionType,
    },
    ModelPack {
        base: BaseType,
        format: Format,
        compression: CompressionType,
    },
}

impl MediaType {
    /// A Kit-dialect media type.
    pub fn new_kit(base: BaseType, compression: CompressionType) -> Self {
        MediaType::Kit { base, compression }
    }

    /// A ModelPack-dialect media type.
    pub fn new_modelpack(base: BaseType, format: Format, compression: CompressionType) -> Self {
        MediaType::ModelPack {
            base,
            format,
            compression,
        }
    }

    pub fn base(&self) -> BaseType {
        match self {
            MediaType::Kit { base, .. } => *base,
            MediaType::ModelPack { base, .. } => *base,
        }
    }

    pub fn compression(&self) -> CompressionType {
        match self {
            MediaType::Kit { compression, .. } => *compression,
            MediaType::ModelPack { compression, .. } => *compression,
        }
    }

    pub fn format(&self) -> Format {
        match self {
            MediaType::Kit { .. } => Format::Tar,
            MediaType::ModelPack { format, .. } => *format,
        }
    }

    /// Short, human-oriented name for the layer kind.
    pub fn user_string(&self) -> String {
        match self {
            MediaType::Kit { base, .. } => kit_base_string(*base).to_string(),
            MediaType::ModelPack { base, .. } => modelpack_base_string(*base).to_string(),
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Kit { base, compression } => {
                if *base == BaseType::Config {
                    return f.write_str(KIT_CONFIG_MEDIA_TYPE);
                }
                let suffix = match compression {
                    CompressionType::None => "",
                    CompressionType::Gzip | CompressionType::GzipFastest => "+gzip",
                    CompressionType::Zstd => "+zstd",
                };
                write!(
                    f,
                    "application/vnd.kitops.modelkit.{}.v1.tar{}",
                    kit_base_string(*base),
                    suffix
                )
            }
            MediaType::ModelPack {
                base,
                format,
                compression,
            } => {
                if *base == BaseType::Config {
                    return f.write_str(MODELPACK_CONFIG_MEDIA_TYPE);
                }
                // ModelPack does not support compression for raw layers
                let tail = match format {
                    Format::Raw => "raw",
                    Format::Tar => match compression {
                        CompressionType::None => "tar",
                        CompressionType::Gzip | CompressionType::GzipFastest => "tar+gzip",
                        CompressionType::Zstd => "tar+zstd",
                    },
                };
                write!(
                    f,
                    "application/vnd.cncf.model.{}.v1.{}",
                    modelpack_base_string(*base),
                    tail
                )
            }
        }
    }
}

/// Parse a layer media type in either dialect.
pub fn parse_media_type(s: &str) -> Result<MediaType> {
    if s == KIT_CONFIG_MEDIA_TYPE {
        return Ok(MediaType::Kit {
            base: BaseType::Config,
            compression: CompressionType::None,
        });
    }
    if s == MODELPACK_CONFIG_MEDIA_TYPE {
        return Ok(MediaType::ModelPack {
            base: BaseType::Config,
            format: Format::Raw,
            compression: CompressionType::None,
        });
    }

    if let Some(captures) = kit_regex().captures(s) {
        let base = parse_kit_base_type(&captures[1])?;
        let compression = parse_compression(captures.get(2).map_or("", |m| m.as_str()))?;
        return Ok(MediaType::Kit { base, compression });
    }
    if let Some(captures) = modelpack_regex().captures(s) {
        let base = parse_modelpack_base_type(&captures[1])?;
        let format = parse_format(&captures[2])?;
        let compression = parse_compression(captures.get(3).map_or("", |m| m.as_str()))?;
        return Ok(MediaType::ModelPack {
            base,
            format,
            compression,
        });
    }
    Err(KitError::InvalidMediaType(format!(
        "unrecognized media type {}",
        s
    )))
}

/// Parse a compression name. The empty string means no compression.
pub fn parse_compression(c: &str) -> Result<CompressionType> {
    match c {
        "" | "none" => Ok(CompressionType::None),
        "gzip" => Ok(CompressionType::Gzip),
        "gzip-fastest" => Ok(CompressionType::GzipFastest),
        "zstd" => Ok(CompressionType::Zstd),
        _ => Err(KitError::InvalidMediaType(format!(
            "invalid compression {}",
            c
        ))),
    }
}

/// Parse a layer format name.
pub fn parse_format(f: &str) -> Result<Format> {
    match f {
        "tar" => Ok(Format::Tar),
        "raw" => Ok(Format::Raw),
        _ => Err(KitError::InvalidMediaType(format!("invalid format {}", f))),
    }
}

fn parse_kit_base_type(s: &str) -> Result<BaseType> {
    match s {
        "config" => Ok(BaseType::Config),
        "model" => Ok(BaseType::Model),
        "modelpart" => Ok(BaseType::ModelPart),
        "dataset" => Ok(BaseType::Dataset),
        "code" => Ok(BaseType::Code),
        "docs" => Ok(BaseType::Docs),
        _ => Err(KitError::InvalidMediaType(format!(
            "invalid base type {}",
            s
        ))),
    }
}

// Accepts both the ModelPack spellings this engine emits and the Kit
// spellings, which some producers reuse in ModelPack media types.
fn parse_modelpack_base_type(s: &str) -> Result<BaseType> {
    match s {
        "config" => Ok(BaseType::Config),
        "model" | "weight" => Ok(BaseType::Model),
        "modelpart" | "weight.config" => Ok(BaseType::ModelPart),
        "dataset" => Ok(BaseType::Dataset),
        "code" => Ok(BaseType::Code),
        "docs" | "doc" => Ok(BaseType::Docs),
        _ => Err(KitError::InvalidMediaType(format!(
            "invalid base type {}",
            s
        ))),
    }
}

fn kit_base_string(base: BaseType) -> &'static str {
    match base {
        BaseType::Config => "config",
        BaseType::Model => "model",
        BaseType::ModelPart => "modelpart",
        BaseType::Dataset => "dataset",
        BaseType::Code => "code",
        BaseType::Docs => "docs",
    }
}

fn modelpack_base_string(base: BaseType) -> &'static str {
    match base {
        BaseType::Config => "config",
        BaseType::Model => "weight",
        BaseType::ModelPart => "weight.config",
        BaseType::Dataset => "dataset",
        BaseType::Code => "code",
        BaseType::Docs => "doc",
    }
}

/// Validate a user-supplied compression flag.
///
/// zstd parses but is rejected here: no stable encoder implementation yet.
pub fn is_valid_compression(c: &str) -> Result<()> {
    match c {
        "none" | "gzip" | "gzip-fastest" => Ok(()),
        _ => Err(KitError::InvalidMediaType(
            "invalid compression type: must be one of 'none', 'gzip', or 'gzip-fastest'"
                .to_string(),
        )),
    }
}

/// Decide whether a manifest is Kit format or ModelPack format.
pub fn model_format_for_manifest(manifest: &crate::oci::Manifest) -> Result<ModelFormat> {
    if manifest.artifact_type.as_deref() == Some(KIT_MANIFEST_ARTIFACT_TYPE)
        || manifest.config.media_type == KIT_CONFIG_MEDIA_TYPE
    {
        return Ok(ModelFormat::Kit);
    }
    if manifest.artifact_type.as_deref() == Some(MODELPACK_MANIFEST_ARTIFACT_TYPE)
        || manifest.config.media_type == MODELPACK_CONFIG_MEDIA_TYPE
    {
        return Ok(ModelFormat::ModelPack);
    }
    Err(KitError::InvalidMediaType(format!(
        "manifest is not a Model manifest: artifactType is {}, config mediaType is {}",
        manifest.artifact_type.as_deref().unwrap_or(""),
        manifest.config.media_type
    )))
}

/// Render a media type for display, collapsing the OCI manifest type.
pub fn format_media_type_for_user(media_type: &str) -> String {
    if media_type == oci::OCI_MANIFEST_MEDIA_TYPE {
        return "manifest".to_string();
    }
    match parse_media_type(media_type) {
        Ok(parsed) => parsed.user_string(),
        Err(_) => "(invalid media type)".to_string(),
    }
}
