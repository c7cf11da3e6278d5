//! Packing: walk the filesystem into compressed tar layers and synthesize a
//! manifest in the local store.
//!
//! Layer bytes are hashed in a single pass: the tar stream feeds one hasher
//! (the diff-ID) while the compressed output feeds another (the layer
//! digest) along with a size counter.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use kitforge_core::{config, KitError, Result};
use tempfile::NamedTempFile;

use crate::digest::{self, HashingWriter};
use crate::ignore::IgnoreSet;
use crate::kitfile::resolver::{resolve_parent_chain, KitfileFetcher};
use crate::kitfile::{Kitfile, LayerInfo};
use crate::mediatype::{
    BaseType, CompressionType, Format, MediaType, KIT_CONFIG_MEDIA_TYPE,
    KIT_MANIFEST_ARTIFACT_TYPE, MODELPACK_CONFIG_MEDIA_TYPE, MODELPACK_MANIFEST_ARTIFACT_TYPE,
};
use crate::oci::{
    Descriptor, FileMetadata, Manifest, ModelConfig, ModelFs, FILEPATH_ANNOTATION,
    FILE_METADATA_ANNOTATION, KITFILE_ANNOTATION, LAYER_SUBTYPE_ANNOTATION, LAYER_SUBTYPE_PROMPT,
    OCI_MANIFEST_MEDIA_TYPE,
};
use crate::paths::verify_subpath;
use crate::reference::{is_modelkit_reference, Reference};
use crate::store::{LocalRepository, LocalStore};

/// Options for packing a modelkit.
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Directory the Kitfile's paths are resolved against.
    pub context_dir: PathBuf,
    /// Explicit Kitfile path; defaults to searching the context directory.
    pub kitfile_path: Option<PathBuf>,
    /// Full model reference to store the result under.
    pub tag: Option<String>,
    /// Layer compression.
    pub compression: CompressionType,
    /// Emit a ModelPack-format artifact instead of Kit format.
    pub use_modelpack: bool,
    /// Zero tar mtimes for bit-stable rebuilds.
    pub normalize_mtime: bool,
}

impl PackOptions {
    pub fn new(context_dir: impl Into<PathBuf>) -> Self {
        Self {
            context_dir: context_dir.into(),
            kitfile_path: None,
            tag: None,
            compression: CompressionType::Gzip,
            use_modelpack: false,
            normalize_mtime: false,
        }
    }
}

/// One planned layer: the entry's base type, its declared path, and whether
/// it is a prompt (packed as an annotated code layer).
#[derive(Debug, Clone)]
struct PlanEntry {
    base: BaseType,
    path: String,
    prompt: bool,
}

/// Pack a modelkit from a context directory into the local store.
///
/// Returns the stored manifest descriptor.
pub fn pack_modelkit(store: &LocalStore, opts: &PackOptions) -> Result<Descriptor> {
    let kitfile_path = match &opts.kitfile_path {
        Some(path) => path.clone(),
        None => crate::kitfile::find_kitfile_in_context(&opts.context_dir)?,
    };
    let kitfile = Kitfile::load_from_path(&kitfile_path)?;
    kitfile.validate_for_pack()?;

    let reference = match &opts.tag {
        Some(tag) => Reference::parse(tag)?,
        None => {
            let name = kitfile
                .package
                .as_ref()
                .and_then(|p| p.name.clone())
                .unwrap_or_default();
            Reference::parse(&name)?
        }
    };

    // A model that references a parent must resolve along a valid chain
    if let Some(model) = &kitfile.model {
        if is_modelkit_reference(&model.path) {
            resolve_parent_chain(store as &dyn KitfileFetcher, &kitfile)?;
        }
    }

    let mut ignore = IgnoreSet::from_context_dir(&opts.context_dir, config::IGNORE_FILE_NAME)?;
    ignore.add_always(config::IGNORE_FILE_NAME);
    if let Ok(rel) = kitfile_path.strip_prefix(&opts.context_dir) {
        ignore.add_always(rel.to_path_buf());
    }

    let repo = store.repository(&reference)?;
    let mut packed = kitfile.clone();
    let mut layers: Vec<Descriptor> = Vec::new();
    let mut diff_ids: Vec<String> = Vec::new();

    for entry in layer_plan(&kitfile) {
        let (descriptor, layer_info) = build_and_store_layer(
            &repo,
            &opts.context_dir,
            &entry,
            &ignore,
            opts.compression,
            opts.use_modelpack,
            opts.normalize_mtime,
        )?;
        tracing::info!(
            path = %entry.path,
            media_type = %descriptor.media_type,
            digest = %descriptor.digest,
            "Packed layer"
        );
        diff_ids.push(layer_info.diff_id.clone());
        attach_layer_info(&mut packed, &entry, layer_info);
        layers.push(descriptor);
    }

    let manifest_desc = if opts.use_modelpack {
        store_modelpack_manifest(&repo, &packed, layers, diff_ids, &reference)?
    } else {
        store_kit_manifest(&repo, &packed, layers, &reference)?
    };

    tracing::info!(
        reference = %reference.display(),
        digest = %manifest_desc.digest,
        "Packed modelkit"
    );
    Ok(manifest_desc)
}

/// The deterministic layer ordering: model, model parts, code, prompts,
/// datasets, docs, each in declaration order.
fn layer_plan(kitfile: &Kitfile) -> Vec<PlanEntry> {
    let mut plan = Vec::new();
    if let Some(model) = &kitfile.model {
        if !model.path.is_empty() && !is_modelkit_reference(&model.path) {
            plan.push(PlanEntry {
                base: BaseType::Model,
                path: model.path.clone(),
                prompt: false,
            });
        }
        for part in &model.parts {
            plan.push(PlanEntry {
                base: BaseType::ModelPart,
                path: part.path.clone(),
                prompt: false,
            });
        }
    }
    for code in &kitfile.code {
        plan.push(PlanEntry {
            base: BaseType::Code,
            path: code.path.clone(),
            prompt: false,
        });
    }
    for prompt in &kitfile.prompts {
        plan.push(PlanEntry {
            base: BaseType::Code,
            path: prompt.path.clone(),
            prompt: true,
        });
    }
    for dataset in &kitfile.datasets {
        plan.push(PlanEntry {
            base: BaseType::Dataset,
            path: dataset.path.clone(),
            prompt: false,
        });
    }
    for docs in &kitfile.docs {
        plan.push(PlanEntry {
            base: BaseType::Docs,
            path: docs.path.clone(),
            prompt: false,
        });
    }
    plan
}

/// Either gzip or a passthrough, so one tar pipeline serves both.
enum LayerCompressor<W: Write> {
    Gzip(GzEncoder<W>),
    Plain(W),
}

impl<W: Write> LayerCompressor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            LayerCompressor::Gzip(encoder) => encoder.finish(),
            LayerCompressor::Plain(writer) => Ok(writer),
        }
    }
}

impl<W: Write> Write for LayerCompressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LayerCompressor::Gzip(encoder) => encoder.write(buf),
            LayerCompressor::Plain(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LayerCompressor::Gzip(encoder) => encoder.flush(),
            LayerCompressor::Plain(writer) => writer.flush(),
        }
    }
}

fn build_and_store_layer(
    repo: &LocalRepository,
    context_dir: &Path,
    entry: &PlanEntry,
    ignore: &IgnoreSet,
    compression: CompressionType,
    use_modelpack: bool,
    normalize_mtime: bool,
) -> Result<(Descriptor, LayerInfo)> {
    let (abs, rel) = verify_subpath(context_dir, &entry.path)?;
    let source_meta = std::fs::metadata(&abs).map_err(|e| {
        KitError::NotFound(format!("layer path {} ({})", abs.display(), e))
    })?;

    let temp = NamedTempFile::new()
        .map_err(|e| KitError::Storage(format!("failed to create temp layer: {}", e)))?;
    let compressed_hasher = HashingWriter::new(temp);
    let compressor = match compression {
        CompressionType::None => LayerCompressor::Plain(compressed_hasher),
        CompressionType::Gzip => {
            LayerCompressor::Gzip(GzEncoder::new(compressed_hasher, Compression::default()))
        }
        CompressionType::GzipFastest => {
            LayerCompressor::Gzip(GzEncoder::new(compressed_hasher, Compression::fast()))
        }
        CompressionType::Zstd => {
            return Err(KitError::Unsupported(
                "zstd compression is not supported".to_string(),
            ))
        }
    };
    let tar_hasher = HashingWriter::new(compressor);
    let mut builder = tar::Builder::new(tar_hasher);

    if source_meta.is_dir() {
        append_dir_tree(&mut builder, context_dir, &abs, &rel, ignore, normalize_mtime)?;
    } else {
        append_file(&mut builder, &abs, &rel, &source_meta, normalize_mtime)?;
    }

    let tar_hasher = builder
        .into_inner()
        .map_err(|e| KitError::Storage(format!("failed to finalize layer tar: {}", e)))?;
    let (compressor, diff_hex, _) = tar_hasher.finalize();
    let compressed_hasher = compressor
        .finish()
        .map_err(|e| KitError::Storage(format!("failed to finish compression: {}", e)))?;
    let (temp, digest_hex, size) = compressed_hasher.finalize();

    let media_type = if use_modelpack {
        MediaType::new_modelpack(entry.base, Format::Tar, compression)
    } else {
        MediaType::new_kit(entry.base, compression)
    };
    let mut descriptor = Descriptor::new(
        media_type.to_string(),
        digest::format_digest(&digest_hex),
        size as i64,
    );
    descriptor.annotate(FILEPATH_ANNOTATION, entry.path.clone());
    if source_meta.is_file() {
        let metadata = file_metadata_for(&abs, &source_meta, normalize_mtime);
        descriptor.annotate(FILE_METADATA_ANNOTATION, serde_json::to_string(&metadata)?);
    }
    if entry.prompt {
        descriptor.annotate(LAYER_SUBTYPE_ANNOTATION, LAYER_SUBTYPE_PROMPT);
    }

    let file = temp.reopen().map_err(KitError::Io)?;
    repo.push_blob(&descriptor, file)?;

    let layer_info = LayerInfo {
        digest: descriptor.digest.clone(),
        diff_id: digest::format_digest(&diff_hex),
        size: size as i64,
    };
    Ok((descriptor, layer_info))
}

/// Append a directory subtree in sorted order, directories before the files
/// they contain. Tar names are context-relative.
fn append_dir_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    context_dir: &Path,
    abs_dir: &Path,
    rel_dir: &Path,
    ignore: &IgnoreSet,
    normalize_mtime: bool,
) -> Result<()> {
    let mut entries: Vec<(PathBuf, bool)> = Vec::new();
    for entry in walkdir::WalkDir::new(abs_dir).follow_links(false) {
        let entry = entry.map_err(|e| {
            KitError::Storage(format!("failed to walk {}: {}", abs_dir.display(), e))
        })?;
        let rel = rel_dir.join(
            entry
                .path()
                .strip_prefix(abs_dir)
                .unwrap_or_else(|_| Path::new("")),
        );
        if rel.as_os_str().is_empty() {
            continue;
        }
        let is_dir = entry.file_type().is_dir();
        let context_rel = entry.path().strip_prefix(context_dir).unwrap_or(&rel);
        if ignore.matches(context_rel, is_dir) {
            continue;
        }
        entries.push((rel, is_dir));
    }
    entries.sort();

    for (rel, is_dir) in entries {
        let abs = context_dir.join(&rel);
        let meta = std::fs::metadata(&abs)?;
        if is_dir {
            let mut header = base_header(&meta, normalize_mtime);
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            builder
                .append_data(&mut header, &rel, io::empty())
                .map_err(KitError::Io)?;
        } else {
            append_file(builder, &abs, &rel, &meta, normalize_mtime)?;
        }
    }
    Ok(())
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    abs: &Path,
    rel: &Path,
    meta: &std::fs::Metadata,
    normalize_mtime: bool,
) -> Result<()> {
    let mut header = base_header(meta, normalize_mtime);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(meta.len());
    let file = File::open(abs)?;
    builder
        .append_data(&mut header, rel, file)
        .map_err(KitError::Io)?;
    Ok(())
}

/// A ustar header with uid/gid zeroed and permission bits preserved.
fn base_header(meta: &std::fs::Metadata, normalize_mtime: bool) -> tar::Header {
    let mut header = tar::Header::new_ustar();
    header.set_mode(permission_bits(meta));
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(if normalize_mtime { 0 } else { mtime_secs(meta) });
    header
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}

fn mtime_secs(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn file_metadata_for(abs: &Path, meta: &std::fs::Metadata, normalize_mtime: bool) -> FileMetadata {
    let mod_time: DateTime<Utc> = if normalize_mtime {
        DateTime::<Utc>::from(UNIX_EPOCH)
    } else {
        meta.modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| DateTime::<Utc>::from(UNIX_EPOCH))
    };
    FileMetadata {
        name: abs
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        mode: permission_bits(meta),
        uid: 0,
        gid: 0,
        size: meta.len() as i64,
        mod_time,
        typeflag: 0,
    }
}

/// Attach layer info to the packed Kitfile entry this layer came from.
///
/// Plan order and Kitfile declaration order agree, so the first entry of
/// the matching kind without layer info is the one.
fn attach_layer_info(kitfile: &mut Kitfile, entry: &PlanEntry, info: LayerInfo) {
    match (entry.base, entry.prompt) {
        (BaseType::Model, _) => {
            if let Some(model) = kitfile.model.as_mut() {
                model.layer_info = Some(info);
            }
        }
        (BaseType::ModelPart, _) => {
            if let Some(model) = kitfile.model.as_mut() {
                if let Some(part) = model.parts.iter_mut().find(|p| p.layer_info.is_none()) {
                    part.layer_info = Some(info);
                }
            }
        }
        (BaseType::Code, false) => {
            if let Some(code) = kitfile.code.iter_mut().find(|c| c.layer_info.is_none()) {
                code.layer_info = Some(info);
            }
        }
        (BaseType::Code, true) => {
            if let Some(prompt) = kitfile.prompts.iter_mut().find(|p| p.layer_info.is_none()) {
                prompt.layer_info = Some(info);
            }
        }
        (BaseType::Dataset, _) => {
            if let Some(dataset) = kitfile.datasets.iter_mut().find(|d| d.layer_info.is_none()) {
                dataset.layer_info = Some(info);
            }
        }
        (BaseType::Docs, _) => {
            if let Some(docs) = kitfile.docs.iter_mut().find(|d| d.layer_info.is_none()) {
                docs.layer_info = Some(info);
            }
        }
        (BaseType::Config, _) => {}
    }
}

fn store_kit_manifest(
    repo: &LocalRepository,
    kitfile: &Kitfile,
    layers: Vec<Descriptor>,
    reference: &Reference,
) -> Result<Descriptor> {
    let config_bytes = kitfile.to_json()?;
    let config_desc = Descriptor::new(
        KIT_CONFIG_MEDIA_TYPE,
        digest::sha256_digest(&config_bytes),
        config_bytes.len() as i64,
    );
    repo.push_blob(&config_desc, &config_bytes[..])?;

    let mut manifest = Manifest {
        schema_version: 2,
        media_type: OCI_MANIFEST_MEDIA_TYPE.to_string(),
        artifact_type: Some(KIT_MANIFEST_ARTIFACT_TYPE.to_string()),
        config: config_desc,
        layers,
        annotations: None,
    };
    manifest
        .annotations
        .get_or_insert_with(Default::default)
        .insert(
            config::CLI_VERSION_ANNOTATION.to_string(),
            crate::VERSION.to_string(),
        );
    store_manifest(repo, &manifest, reference)
}

fn store_modelpack_manifest(
    repo: &LocalRepository,
    kitfile: &Kitfile,
    layers: Vec<Descriptor>,
    diff_ids: Vec<String>,
    reference: &Reference,
) -> Result<Descriptor> {
    let model_config = ModelConfig {
        descriptor: None,
        model_fs: ModelFs {
            fs_type: "layers".to_string(),
            diff_ids,
        },
    };
    let config_bytes = serde_json::to_vec(&model_config)?;
    let config_desc = Descriptor::new(
        MODELPACK_CONFIG_MEDIA_TYPE,
        digest::sha256_digest(&config_bytes),
        config_bytes.len() as i64,
    );
    repo.push_blob(&config_desc, &config_bytes[..])?;

    let kitfile_yaml = String::from_utf8(kitfile.to_yaml()?)
        .map_err(|e| KitError::Serialization(e.to_string()))?;
    let mut manifest = Manifest {
        schema_version: 2,
        media_type: OCI_MANIFEST_MEDIA_TYPE.to_string(),
        artifact_type: Some(MODELPACK_MANIFEST_ARTIFACT_TYPE.to_string()),
        config: config_desc,
        layers,
        annotations: None,
    };
    let annotations = manifest.annotations.get_or_insert_with(Default::default);
    annotations.insert(KITFILE_ANNOTATION.to_string(), kitfile_yaml);
    annotations.insert(
        config::CLI_VERSION_ANNOTATION.to_string(),
        crate::VERSION.to_string(),
    );
    store_manifest(repo, &manifest, reference)
}

fn store_manifest(
    repo: &LocalRepository,
    manifest: &Manifest,
    reference: &Reference,
) -> Result<Descriptor> {
    let bytes = manifest.to_bytes()?;
    let tag = if reference.has_reference() && !reference.is_digest() {
        Some(reference.reference.as_str())
    } else {
        None
    };
    repo.add_manifest(&bytes, tag)
}
