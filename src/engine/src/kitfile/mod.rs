//! The Kitfile: the YAML manifest describing a modelkit's contents.
//!
//! A Kitfile lists the package metadata, the model and its parts, datasets,
//! code, prompts, and docs. It is embedded in a packed modelkit as the
//! manifest's config blob, where the canonical form is also valid JSON.

pub mod resolver;

use std::io::Read;
use std::path::Path;

use kitforge_core::{config, KitError, Result};
use serde::{Deserialize, Serialize};

/// Layer anchoring for a Kitfile entry: the blob digest, the digest of the
/// uncompressed tar payload, and the compressed size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub digest: String,
    #[serde(rename = "diffID")]
    pub diff_id: String,
    pub size: i64,
}

/// Package-level metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Package {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
}

/// The model section: a primary model plus related parts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Model {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Filesystem path, or a reference to a parent modelkit.
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Arbitrary model parameters; restricted to the JSON-compatible subset
    /// of YAML.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<ModelPart>,
    #[serde(rename = "layerInfo", default, skip_serializing_if = "Option::is_none")]
    pub layer_info: Option<LayerInfo>,
}

/// A model part: tokenizer, adapter, or other model-adjacent file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub path: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub part_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(rename = "layerInfo", default, skip_serializing_if = "Option::is_none")]
    pub layer_info: Option<LayerInfo>,
}

/// A dataset entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(rename = "layerInfo", default, skip_serializing_if = "Option::is_none")]
    pub layer_info: Option<LayerInfo>,
}

/// A code entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Code {
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(rename = "layerInfo", default, skip_serializing_if = "Option::is_none")]
    pub layer_info: Option<LayerInfo>,
}

/// A documentation entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Docs {
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "layerInfo", default, skip_serializing_if = "Option::is_none")]
    pub layer_info: Option<LayerInfo>,
}

/// A prompt entry. Prompts pack as code-typed layers with a subtype
/// annotation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "layerInfo", default, skip_serializing_if = "Option::is_none")]
    pub layer_info: Option<LayerInfo>,
}

/// A complete Kitfile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Kitfile {
    #[serde(rename = "manifestVersion", default)]
    pub manifest_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<Package>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<Model>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code: Vec<Code>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datasets: Vec<Dataset>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub docs: Vec<Docs>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prompts: Vec<Prompt>,
}

impl Kitfile {
    /// Load a Kitfile from a reader and validate its structure.
    pub fn load(reader: impl Read) -> Result<Self> {
        let kitfile: Kitfile = serde_yaml::from_reader(reader)?;
        kitfile.validate()?;
        Ok(kitfile)
    }

    /// Load a Kitfile from a byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Self::load(bytes)
    }

    /// Load a Kitfile from a file on disk.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            KitError::NotFound(format!("Kitfile at {} ({})", path.display(), e))
        })?;
        Self::load(file)
    }

    /// Marshal to canonical YAML.
    pub fn to_yaml(&self) -> Result<Vec<u8>> {
        Ok(serde_yaml::to_string(self)?.into_bytes())
    }

    /// Marshal to JSON with alphabetized maps.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_vec(&value)?)
    }

    /// Structural validation: required fields and parameter shape.
    pub fn validate(&self) -> Result<()> {
        if self.manifest_version.is_empty() {
            return Err(KitError::InvalidKitfile(
                "manifestVersion is required".to_string(),
            ));
        }
        if let Some(model) = &self.model {
            if let Some(params) = &model.parameters {
                validate_json_compatible(params)?;
            }
        }
        Ok(())
    }

    /// Validation applied before packing: the Kitfile must name its package
    /// and every entry must carry a path.
    pub fn validate_for_pack(&self) -> Result<()> {
        self.validate()?;
        let name = self
            .package
            .as_ref()
            .and_then(|p| p.name.as_deref())
            .unwrap_or("");
        if name.is_empty() {
            return Err(KitError::InvalidKitfile(
                "package.name is required for packing".to_string(),
            ));
        }
        let mut paths: Vec<&str> = Vec::new();
        if let Some(model) = &self.model {
            if !model.path.is_empty() && !crate::reference::is_modelkit_reference(&model.path) {
                paths.push(&model.path);
            }
            paths.extend(model.parts.iter().map(|p| p.path.as_str()));
        }
        paths.extend(self.code.iter().map(|c| c.path.as_str()));
        paths.extend(self.prompts.iter().map(|p| p.path.as_str()));
        paths.extend(self.datasets.iter().map(|d| d.path.as_str()));
        paths.extend(self.docs.iter().map(|d| d.path.as_str()));
        for path in paths {
            if path.is_empty() {
                return Err(KitError::InvalidKitfile(
                    "every packed entry requires a path".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The de-duplicated, lexicographically sorted union of every license
    /// string in the document.
    pub fn collect_licenses(&self) -> Vec<String> {
        let mut licenses: Vec<String> = Vec::new();
        let mut push = |license: &Option<String>| {
            if let Some(l) = license {
                if !l.is_empty() {
                    licenses.push(l.clone());
                }
            }
        };
        if let Some(package) = &self.package {
            push(&package.license);
        }
        if let Some(model) = &self.model {
            push(&model.license);
            for part in &model.parts {
                push(&part.license);
            }
        }
        for dataset in &self.datasets {
            push(&dataset.license);
        }
        for code in &self.code {
            push(&code.license);
        }
        licenses.sort();
        licenses.dedup();
        licenses
    }
}

/// Find a Kitfile in a context directory, trying the default names in order.
pub fn find_kitfile_in_context(context_dir: &Path) -> Result<std::path::PathBuf> {
    for name in config::default_kitfile_names() {
        let candidate = context_dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(KitError::NotFound(format!(
        "Kitfile in {}",
        context_dir.display()
    )))
}

/// Reject YAML constructs that cannot survive a JSON round-trip: tags and
/// non-string mapping keys.
fn validate_json_compatible(value: &serde_yaml::Value) -> Result<()> {
    match value {
        serde_yaml::Value::Tagged(_) => Err(KitError::InvalidKitfile(
            "parameters must not use YAML tags".to_string(),
        )),
        serde_yaml::Value::Mapping(map) => {
            for (key, entry) in map {
                if !key.is_string() {
                    return Err(KitError::InvalidKitfile(
                        "parameters mapping keys must be strings".to_string(),
                    ));
                }
                validate_json_compatible(entry)?;
            }
            Ok(())
        }
        serde_yaml::Value::Sequence(seq) => {
            for entry in seq {
                validate_json_compatible(entry)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
