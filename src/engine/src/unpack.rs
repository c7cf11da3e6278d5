//! Unpacking: resolve a manifest, align its layers with the Kitfile, and
//! write the selected content to disk.
//!
//! The manifest's layer order decides *which layer* comes next; the
//! Kitfile's per-type declaration order decides *which entry* it belongs
//! to. Parent modelkit references recurse with filters tightened to model
//! layers only.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use kitforge_core::{config, KitError, Result};

use crate::filter::{should_unpack, FilterConf, FilterTarget};
use crate::kitfile::resolver::KitfileFetcher;
use crate::kitfile::{Code, Dataset, Docs, Kitfile, LayerInfo, Model, ModelPart, Prompt};
use crate::mediatype::{
    model_format_for_manifest, parse_media_type, BaseType, CompressionType, ModelFormat,
};
use crate::oci::{
    Descriptor, Manifest, FILEPATH_ANNOTATION, KITFILE_ANNOTATION, LAYER_SUBTYPE_ANNOTATION,
    LAYER_SUBTYPE_PROMPT,
};
use crate::paths::verify_subpath;
use crate::reference::{is_modelkit_reference, Reference};
use crate::store::{LocalRepository, LocalStore};

/// Options for unpacking a modelkit.
#[derive(Debug, Clone)]
pub struct UnpackOptions {
    /// The modelkit to unpack; must resolve in the local store.
    pub model_ref: Reference,
    /// Target directory.
    pub unpack_dir: PathBuf,
    /// Layer selection; empty unpacks everything.
    pub filters: Vec<FilterConf>,
    /// Replace existing files.
    pub overwrite: bool,
    /// Silently skip files that already exist.
    pub ignore_existing: bool,
}

/// Unpack a modelkit from the local store into a directory.
pub fn unpack_modelkit(store: &LocalStore, opts: &UnpackOptions) -> Result<()> {
    std::fs::create_dir_all(&opts.unpack_dir).map_err(|e| {
        KitError::Storage(format!(
            "failed to create unpack directory {}: {}",
            opts.unpack_dir.display(),
            e
        ))
    })?;
    unpack_recursive(store, opts, &mut Vec::new())
}

/// Load the Kitfile describing a manifest: the config blob for Kit-format
/// artifacts, the embedded annotation or a synthesized Kitfile for
/// ModelPack. Returns the Kitfile and whether it was synthesized.
pub fn kitfile_for_manifest(
    repo: &LocalRepository,
    manifest: &Manifest,
) -> Result<(Kitfile, bool)> {
    match model_format_for_manifest(manifest)? {
        ModelFormat::Kit => {
            let bytes = repo.fetch_bytes(&manifest.config)?;
            Ok((Kitfile::from_slice(&bytes)?, false))
        }
        ModelFormat::ModelPack => {
            if let Some(yaml) = manifest
                .annotations
                .as_ref()
                .and_then(|a| a.get(KITFILE_ANNOTATION))
            {
                return Ok((Kitfile::from_slice(yaml.as_bytes())?, false));
            }
            tracing::warn!("Artifact has no Kitfile; generating one from layer annotations");
            Ok((synthesize_kitfile(manifest)?, true))
        }
    }
}

impl KitfileFetcher for LocalStore {
    fn fetch(&self, reference: &Reference) -> Result<Kitfile> {
        let repo = self.repository(reference)?;
        let desc = repo.resolve(&reference.reference)?;
        let bytes = repo.fetch_bytes(&desc)?;
        let manifest = Manifest::from_slice(&bytes)?;
        kitfile_for_manifest(&repo, &manifest).map(|(kitfile, _)| kitfile)
    }
}

fn unpack_recursive(
    store: &LocalStore,
    opts: &UnpackOptions,
    visited: &mut Vec<String>,
) -> Result<()> {
    if visited.len() > config::MAX_MODEL_REF_CHAIN {
        return Err(KitError::DepthExceeded(visited.join("=>")));
    }

    let repo = store.repository(&opts.model_ref)?;
    let manifest_desc = repo.resolve(&opts.model_ref.reference)?;
    let manifest_bytes = repo.fetch_bytes(&manifest_desc)?;
    let manifest = Manifest::from_slice(&manifest_bytes)?;
    let (kitfile, synthesized) = kitfile_for_manifest(&repo, &manifest)?;

    if !synthesized {
        if let Some(model) = &kitfile.model {
            if is_modelkit_reference(&model.path) {
                tracing::info!(reference = %model.path, "Unpacking referenced modelkit");
                unpack_parent(store, &model.path, opts, visited)?;
            }
        }
        if should_unpack(FilterTarget::Kitfile, &opts.filters) {
            unpack_config(&kitfile, &opts.unpack_dir, opts.overwrite)?;
        }
    }

    let mut part_idx = 0;
    let mut code_idx = 0;
    let mut dataset_idx = 0;
    let mut docs_idx = 0;
    let mut prompt_idx = 0;

    for layer_desc in &manifest.layers {
        let media_type = match parse_media_type(&layer_desc.media_type) {
            Ok(media_type) => media_type,
            Err(_) => {
                // ModelPacks may carry layers this engine does not model,
                // e.g. embedded Kitfiles
                tracing::warn!(media_type = %layer_desc.media_type, "Unknown media type: skipping unpack");
                continue;
            }
        };

        let (layer_info, layer_path): (Option<&LayerInfo>, String) = match media_type.base() {
            BaseType::Model => {
                let Some(model) = kitfile.model.as_ref() else {
                    continue;
                };
                if !should_unpack(FilterTarget::Model(model), &opts.filters) {
                    continue;
                }
                tracing::info!(
                    name = model.name.as_deref().unwrap_or(""),
                    path = %model.path,
                    "Unpacking model"
                );
                (model.layer_info.as_ref(), model.path.clone())
            }
            BaseType::ModelPart => {
                let parts = kitfile
                    .model
                    .as_ref()
                    .map(|m| m.parts.as_slice())
                    .unwrap_or(&[]);
                let part = entry_at::<ModelPart>(parts, part_idx, "model part")?;
                part_idx += 1;
                if !should_unpack(FilterTarget::ModelPart(part), &opts.filters) {
                    continue;
                }
                tracing::info!(path = %part.path, "Unpacking model part");
                (part.layer_info.as_ref(), part.path.clone())
            }
            BaseType::Code => {
                // Code-type layers may be either regular code or prompts
                if layer_desc.annotation(LAYER_SUBTYPE_ANNOTATION) == Some(LAYER_SUBTYPE_PROMPT) {
                    let prompt = entry_at::<Prompt>(&kitfile.prompts, prompt_idx, "prompt")?;
                    prompt_idx += 1;
                    if !should_unpack(FilterTarget::Prompt(prompt), &opts.filters) {
                        continue;
                    }
                    tracing::info!(path = %prompt.path, "Unpacking prompt");
                    (prompt.layer_info.as_ref(), prompt.path.clone())
                } else {
                    let code = entry_at::<Code>(&kitfile.code, code_idx, "code")?;
                    code_idx += 1;
                    if !should_unpack(FilterTarget::Code(code), &opts.filters) {
                        continue;
                    }
                    tracing::info!(path = %code.path, "Unpacking code");
                    (code.layer_info.as_ref(), code.path.clone())
                }
            }
            BaseType::Dataset => {
                let dataset = entry_at::<Dataset>(&kitfile.datasets, dataset_idx, "dataset")?;
                dataset_idx += 1;
                if !should_unpack(FilterTarget::Dataset(dataset), &opts.filters) {
                    continue;
                }
                tracing::info!(
                    name = dataset.name.as_deref().unwrap_or(""),
                    path = %dataset.path,
                    "Unpacking dataset"
                );
                (dataset.layer_info.as_ref(), dataset.path.clone())
            }
            BaseType::Docs => {
                let docs = entry_at::<Docs>(&kitfile.docs, docs_idx, "docs")?;
                docs_idx += 1;
                if !should_unpack(FilterTarget::Docs(docs), &opts.filters) {
                    continue;
                }
                tracing::info!(path = %docs.path, "Unpacking docs");
                (docs.layer_info.as_ref(), docs.path.clone())
            }
            // ModelPacks may list the Kitfile among the layers; it is
            // unpacked separately
            BaseType::Config => continue,
        };

        let rel_prefix = match layer_info {
            Some(info) => {
                if info.digest != layer_desc.digest {
                    return Err(KitError::Integrity(format!(
                        "digest in config and manifest do not match in {}",
                        media_type.user_string()
                    )));
                }
                None
            }
            None => {
                // Older layers do not embed their path in the tar; it comes
                // from the Kitfile entry instead
                let (_, rel) = verify_subpath(&opts.unpack_dir, &layer_path)?;
                rel.parent().map(Path::to_path_buf)
            }
        };

        unpack_layer(
            &repo,
            layer_desc,
            rel_prefix.as_deref(),
            &opts.unpack_dir,
            opts.overwrite,
            opts.ignore_existing,
            media_type.compression(),
        )?;
    }

    tracing::debug!(
        parts = part_idx,
        code = code_idx,
        datasets = dataset_idx,
        docs = docs_idx,
        prompts = prompt_idx,
        "Unpacked layers"
    );
    Ok(())
}

fn entry_at<'a, T>(entries: &'a [T], index: usize, kind: &str) -> Result<&'a T> {
    entries.get(index).ok_or_else(|| {
        KitError::InvalidKitfile(format!(
            "manifest has more {} layers than the Kitfile declares",
            kind
        ))
    })
}

fn unpack_parent(
    store: &LocalStore,
    parent_ref: &str,
    opts: &UnpackOptions,
    visited: &mut Vec<String>,
) -> Result<()> {
    if let Some(idx) = visited.iter().position(|v| v == parent_ref) {
        let cycle = format!("[{}=>{}]", visited[idx..].join("=>"), parent_ref);
        return Err(KitError::CycleDetected(cycle));
    }

    // Only model layers are inherited from a parent
    let Some(filters) = crate::filter::restrict_to_model(&opts.filters) else {
        return Ok(());
    };

    let parent_opts = UnpackOptions {
        model_ref: Reference::parse(parent_ref)?,
        unpack_dir: opts.unpack_dir.clone(),
        filters,
        overwrite: opts.overwrite,
        ignore_existing: opts.ignore_existing,
    };
    visited.push(parent_ref.to_string());
    let result = unpack_recursive(store, &parent_opts, visited);
    visited.pop();
    result
}

/// Write the Kitfile to `<unpack_dir>/Kitfile`. A byte-identical existing
/// file is left alone; a differing one fails unless overwriting.
fn unpack_config(kitfile: &Kitfile, unpack_dir: &Path, overwrite: bool) -> Result<()> {
    let config_bytes = kitfile.to_yaml()?;
    let config_path = unpack_dir.join(config::DEFAULT_KITFILE_NAME);

    if let Ok(existing_meta) = std::fs::symlink_metadata(&config_path) {
        if !existing_meta.is_file() {
            return Err(KitError::Storage(format!(
                "path {} exists and is not a regular file",
                config_path.display()
            )));
        }
        if !overwrite {
            let existing = std::fs::read(&config_path)?;
            if existing == config_bytes {
                tracing::info!(path = %config_path.display(), "Found existing Kitfile");
                return Ok(());
            }
            return Err(KitError::Conflict(config_path.display().to_string()));
        }
    }

    tracing::info!(path = %config_path.display(), "Unpacking config");
    std::fs::write(&config_path, config_bytes)?;
    Ok(())
}

enum LayerReader<R: Read> {
    Gzip(Box<GzDecoder<R>>),
    Plain(R),
}

impl<R: Read> LayerReader<R> {
    fn into_inner(self) -> R {
        match self {
            LayerReader::Gzip(decoder) => decoder.into_inner(),
            LayerReader::Plain(reader) => reader,
        }
    }
}

impl<R: Read> Read for LayerReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            LayerReader::Gzip(decoder) => decoder.read(buf),
            LayerReader::Plain(reader) => reader.read(buf),
        }
    }
}

fn unpack_layer(
    repo: &LocalRepository,
    desc: &Descriptor,
    rel_prefix: Option<&Path>,
    unpack_dir: &Path,
    overwrite: bool,
    ignore_existing: bool,
    compression: CompressionType,
) -> Result<()> {
    let blob = repo.fetch(desc)?;
    let reader = match compression {
        CompressionType::Gzip | CompressionType::GzipFastest => {
            LayerReader::Gzip(Box::new(GzDecoder::new(blob)))
        }
        CompressionType::None => LayerReader::Plain(blob),
        CompressionType::Zstd => {
            return Err(KitError::Unsupported(
                "zstd-compressed layers are not supported".to_string(),
            ))
        }
    };

    if let Some(prefix) = rel_prefix {
        std::fs::create_dir_all(unpack_dir.join(prefix))?;
    }

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(false);
    extract_tar(&mut archive, rel_prefix, unpack_dir, overwrite, ignore_existing)?;

    // Drain whatever the tar reader left behind so the digest check covers
    // the full blob
    archive.into_inner().into_inner().finish()
}

fn extract_tar<R: Read>(
    archive: &mut tar::Archive<R>,
    rel_prefix: Option<&Path>,
    unpack_dir: &Path,
    overwrite: bool,
    ignore_existing: bool,
) -> Result<()> {
    for entry in archive.entries().map_err(KitError::Io)? {
        let mut entry = entry.map_err(KitError::Io)?;
        let entry_path = entry.path().map_err(KitError::Io)?.into_owned();
        let out_rel = match rel_prefix {
            Some(prefix) => prefix.join(&entry_path),
            None => entry_path.clone(),
        };
        // The output path must stay inside the unpack root
        let (out_path, _) = verify_subpath(unpack_dir, &out_rel)?;

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                match std::fs::symlink_metadata(&out_path) {
                    Ok(existing) if !existing.is_dir() => {
                        return Err(KitError::Storage(format!(
                            "path '{}' already exists and is not a directory",
                            out_path.display()
                        )));
                    }
                    Ok(_) => {}
                    Err(_) => {
                        tracing::debug!(path = %out_path.display(), "Creating directory");
                        std::fs::create_dir_all(&out_path)?;
                        set_mode(&out_path, entry.header().mode().unwrap_or(0o755));
                    }
                }
            }
            tar::EntryType::Regular => {
                if let Ok(existing) = std::fs::symlink_metadata(&out_path) {
                    if ignore_existing {
                        tracing::debug!(path = %out_path.display(), "File already exists; skipping");
                        continue;
                    }
                    if !overwrite {
                        return Err(KitError::Conflict(out_path.display().to_string()));
                    }
                    if !existing.is_file() {
                        return Err(KitError::Storage(format!(
                            "path '{}' already exists and is not a regular file",
                            out_path.display()
                        )));
                    }
                }
                if let Some(parent) = out_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                tracing::debug!(path = %out_path.display(), "Unpacking file");
                let mut file = File::create(&out_path)?;
                let written = io::copy(&mut entry, &mut file)?;
                if written != entry.header().size().unwrap_or(0) {
                    return Err(KitError::Storage(format!(
                        "could not unpack file {}",
                        out_path.display()
                    )));
                }
                set_mode(&out_path, entry.header().mode().unwrap_or(0o644));
            }
            _ => {
                return Err(KitError::Unsupported(format!(
                    "unrecognized type in archive: {}",
                    entry_path.display()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

/// Build a minimal Kitfile for a ModelPack manifest with no embedded
/// Kitfile, using layer media types and filepath annotations. Suitable only
/// for unpacking; a layer without a filepath annotation is unusable.
fn synthesize_kitfile(manifest: &Manifest) -> Result<Kitfile> {
    let mut kitfile = Kitfile {
        model: Some(Model::default()),
        ..Default::default()
    };
    for desc in &manifest.layers {
        let Some(filepath) = desc.annotation(FILEPATH_ANNOTATION) else {
            return Err(KitError::InvalidKitfile(format!(
                "unknown file path for layer: no {} annotation",
                FILEPATH_ANNOTATION
            )));
        };
        let media_type = parse_media_type(&desc.media_type)?;
        let model = kitfile.model.as_mut().expect("model is initialized above");
        match media_type.base() {
            BaseType::Model => model.path = filepath.to_string(),
            BaseType::ModelPart => model.parts.push(ModelPart {
                path: filepath.to_string(),
                ..Default::default()
            }),
            BaseType::Code => kitfile.code.push(Code {
                path: filepath.to_string(),
                ..Default::default()
            }),
            BaseType::Dataset => kitfile.datasets.push(Dataset {
                path: filepath.to_string(),
                ..Default::default()
            }),
            BaseType::Docs => kitfile.docs.push(Docs {
                path: filepath.to_string(),
                ..Default::default()
            }),
            BaseType::Config => {}
        }
    }
    Ok(kitfile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediatype::MODELPACK_CONFIG_MEDIA_TYPE;
    use crate::oci::OCI_MANIFEST_MEDIA_TYPE;

    fn modelpack_manifest(layers: Vec<Descriptor>) -> Manifest {
        Manifest {
            schema_version: 2,
            media_type: OCI_MANIFEST_MEDIA_TYPE.to_string(),
            artifact_type: None,
            config: Descriptor::new(MODELPACK_CONFIG_MEDIA_TYPE, "sha256:cfg", 2),
            layers,
            annotations: None,
        }
    }

    #[test]
    fn test_synthesize_kitfile_from_annotations() {
        let mut weight = Descriptor::new(
            "application/vnd.cncf.model.weight.v1.tar",
            "sha256:aa",
            10,
        );
        weight.annotate(FILEPATH_ANNOTATION, "weights/model.bin");
        let mut part = Descriptor::new(
            "application/vnd.cncf.model.weight.config.v1.tar",
            "sha256:bb",
            5,
        );
        part.annotate(FILEPATH_ANNOTATION, "weights/config.json");
        let mut dataset =
            Descriptor::new("application/vnd.cncf.model.dataset.v1.tar", "sha256:cc", 5);
        dataset.annotate(FILEPATH_ANNOTATION, "data/train.csv");

        let manifest = modelpack_manifest(vec![weight, part, dataset]);
        let kitfile = synthesize_kitfile(&manifest).unwrap();
        let model = kitfile.model.unwrap();
        assert_eq!(model.path, "weights/model.bin");
        assert_eq!(model.parts.len(), 1);
        assert_eq!(model.parts[0].path, "weights/config.json");
        assert_eq!(kitfile.datasets.len(), 1);
        assert_eq!(kitfile.datasets[0].path, "data/train.csv");
    }

    #[test]
    fn test_synthesize_kitfile_missing_annotation() {
        let weight = Descriptor::new(
            "application/vnd.cncf.model.weight.v1.tar",
            "sha256:aa",
            10,
        );
        let manifest = modelpack_manifest(vec![weight]);
        let err = synthesize_kitfile(&manifest).unwrap_err();
        assert!(err.to_string().contains(FILEPATH_ANNOTATION));
    }

    #[test]
    fn test_unpack_config_matches_existing() {
        let dir = tempfile::TempDir::new().unwrap();
        let kitfile = Kitfile {
            manifest_version: "1.0".to_string(),
            ..Default::default()
        };
        unpack_config(&kitfile, dir.path(), false).unwrap();
        // Identical content: no-op
        unpack_config(&kitfile, dir.path(), false).unwrap();

        // Differing content without overwrite: conflict
        std::fs::write(dir.path().join("Kitfile"), "something else").unwrap();
        match unpack_config(&kitfile, dir.path(), false) {
            Err(KitError::Conflict(_)) => {}
            other => panic!("expected conflict, got {:?}", other),
        }
        // Overwrite replaces it
        unpack_config(&kitfile, dir.path(), true).unwrap();
        let written = std::fs::read(dir.path().join("Kitfile")).unwrap();
        assert_eq!(written, kitfile.to_yaml().unwrap());
    }
}
