//! Local content-addressed modelkit store.
//!
//! Each repository is an OCI Image Layout on disk:
//!
//! ```text
//! <root>/<registry>/<repository>/
//!   oci-layout            (layout marker)
//!   index.json            (manifest descriptors, tagged via refName)
//!   blobs/sha256/<hex>    (content-addressed blobs)
//! ```
//!
//! Blobs are shared across manifests by digest. Writers serialize on a
//! per-repository lock file; `index.json` and blobs are written to temp
//! files and atomically renamed into place.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use kitforge_core::{KitError, Result};

use crate::digest::{self, HashingWriter, VerifyingReader};
use crate::oci::{Descriptor, ImageIndex, Manifest, OciLayout, REF_NAME_ANNOTATION};
use crate::reference::Reference;

const LOCK_FILE_NAME: &str = ".index.lock";
const LOCK_ATTEMPTS: u32 = 200;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(25);

/// Summary of one stored manifest, for listings.
#[derive(Debug, Clone)]
pub struct ManifestInfo {
    pub repository: String,
    pub digest: String,
    pub size: i64,
    pub tags: Vec<String>,
}

/// The local store root, holding one OCI layout per repository.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Open (creating if necessary) a store rooted at `root`. Idempotent.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .map_err(|e| KitError::Storage(format!("failed to create store root: {}", e)))?;
        Ok(Self { root })
    }

    /// The store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open the repository layout for a reference, creating it if missing.
    pub fn repository(&self, reference: &Reference) -> Result<LocalRepository> {
        let rel = format!("{}/{}", reference.registry, reference.repository);
        for segment in rel.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(KitError::InvalidReference {
                    reference: rel.clone(),
                    message: "malformed repository path".to_string(),
                });
            }
        }
        LocalRepository::open(self.root.join(&rel), rel)
    }

    /// Enumerate every manifest in every repository of the store.
    pub fn list(&self) -> Result<Vec<ManifestInfo>> {
        let mut infos = Vec::new();
        for repo_name in self.list_repositories()? {
            let repo = LocalRepository::open(self.root.join(&repo_name), repo_name.clone())?;
            let index = repo.read_index()?;
            let mut by_digest: Vec<(String, i64, Vec<String>)> = Vec::new();
            for desc in &index.manifests {
                let tags: Vec<String> =
                    desc.ref_name().map(str::to_string).into_iter().collect();
                match by_digest.iter_mut().find(|(d, _, _)| d == &desc.digest) {
                    Some((_, _, existing)) => existing.extend(tags),
                    None => by_digest.push((desc.digest.clone(), desc.size, tags)),
                }
            }
            for (digest, size, tags) in by_digest {
                infos.push(ManifestInfo {
                    repository: repo_name.clone(),
                    digest,
                    size,
                    tags,
                });
            }
        }
        Ok(infos)
    }

    fn list_repositories(&self) -> Result<Vec<String>> {
        let mut repos = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            if dir.join("oci-layout").is_file() && dir.join("index.json").is_file() {
                let rel = dir
                    .strip_prefix(&self.root)
                    .unwrap_or(&dir)
                    .to_string_lossy()
                    .replace('\\', "/");
                repos.push(rel);
                continue;
            }
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    pending.push(entry.path());
                }
            }
        }
        repos.sort();
        Ok(repos)
    }
}

/// One repository's OCI Image Layout on disk.
pub struct LocalRepository {
    root: PathBuf,
    name: String,
}

impl LocalRepository {
    fn open(root: PathBuf, name: String) -> Result<Self> {
        let blobs = root.join("blobs").join(digest::SHA256);
        std::fs::create_dir_all(&blobs)
            .map_err(|e| KitError::Storage(format!("failed to create blobs directory: {}", e)))?;

        let layout_path = root.join("oci-layout");
        if !layout_path.exists() {
            let content = serde_json::to_vec(&OciLayout::default())?;
            write_atomic(&root, &layout_path, &content)?;
        }
        let index_path = root.join("index.json");
        if !index_path.exists() {
            let content = serde_json::to_vec(&ImageIndex::empty())?;
            write_atomic(&root, &index_path, &content)?;
        }
        Ok(Self { root, name })
    }

    /// Repository name relative to the store root.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the blob addressed by a digest.
    pub fn blob_path(&self, blob_digest: &str) -> Result<PathBuf> {
        let (algorithm, hex) = digest::split_digest(blob_digest)?;
        Ok(self.root.join("blobs").join(algorithm).join(hex))
    }

    /// Whether the blob for a digest is present.
    pub fn has_blob(&self, blob_digest: &str) -> bool {
        self.blob_path(blob_digest)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    /// Ingest a blob, streaming it through a digest hasher.
    ///
    /// The blob lands at its content address only when both digest and size
    /// match the descriptor; a mismatch removes the temp file and fails.
    /// Pushing an already-present digest is a no-op.
    pub fn push_blob(&self, expected: &Descriptor, mut reader: impl Read) -> Result<()> {
        let target = self.blob_path(&expected.digest)?;
        if target.is_file() {
            tracing::debug!(digest = %expected.digest, "Blob already stored");
            return Ok(());
        }

        let temp = tempfile::NamedTempFile::new_in(&self.root)
            .map_err(|e| KitError::Storage(format!("failed to create temp blob: {}", e)))?;
        let mut writer = HashingWriter::new(temp);
        std::io::copy(&mut reader, &mut writer)?;
        let (temp, hex, written) = writer.finalize();
        temp.as_file().sync_all().ok();

        let actual = digest::format_digest(&hex);
        if actual != expected.digest {
            return Err(KitError::Integrity(format!(
                "blob digest mismatch: expected {}, got {}",
                expected.digest, actual
            )));
        }
        if written as i64 != expected.size {
            return Err(KitError::Integrity(format!(
                "blob size mismatch: expected {}, got {}",
                expected.size, written
            )));
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        temp.persist(&target)
            .map_err(|e| KitError::Storage(format!("failed to store blob: {}", e)))?;
        tracing::debug!(digest = %expected.digest, size = written, "Stored blob");
        Ok(())
    }

    /// Open a blob for reading, verifying its digest as it streams.
    ///
    /// The digest check fires at EOF; callers that do not read to the end
    /// can drain via `VerifyingReader::finish`.
    pub fn fetch(&self, desc: &Descriptor) -> Result<VerifyingReader<File>> {
        let path = self.blob_path(&desc.digest)?;
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                KitError::NotFound(format!("blob {}", desc.digest))
            } else {
                KitError::Io(e)
            }
        })?;
        Ok(VerifyingReader::new(file, desc.digest.clone()))
    }

    /// Read a whole blob into memory, verifying its digest.
    pub fn fetch_bytes(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        let mut reader = self.fetch(desc)?;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                KitError::Integrity(e.to_string())
            } else {
                KitError::Io(e)
            }
        })?;
        Ok(bytes)
    }

    /// Resolve a tag or digest to its manifest descriptor.
    ///
    /// An empty reference resolves only when the repository holds exactly
    /// one manifest.
    pub fn resolve(&self, reference: &str) -> Result<Descriptor> {
        let index = self.read_index()?;
        if reference.is_empty() {
            let mut digests: Vec<&Descriptor> = Vec::new();
            for desc in &index.manifests {
                if !digests.iter().any(|d| d.digest == desc.digest) {
                    digests.push(desc);
                }
            }
            return match digests.len() {
                1 => Ok(strip_ref_name(digests[0])),
                _ => Err(KitError::NotFound(format!(
                    "unambiguous manifest in repository {}",
                    self.name
                ))),
            };
        }
        for desc in &index.manifests {
            if desc.digest == reference || desc.ref_name() == Some(reference) {
                return Ok(strip_ref_name(desc));
            }
        }
        Err(KitError::NotFound(format!(
            "reference {} in repository {}",
            reference, self.name
        )))
    }

    /// Store manifest bytes as a blob and register them in the index,
    /// optionally under a tag. Returns the manifest descriptor.
    pub fn add_manifest(&self, manifest_bytes: &[u8], tag: Option<&str>) -> Result<Descriptor> {
        let desc = Descriptor::new(
            crate::oci::OCI_MANIFEST_MEDIA_TYPE,
            digest::sha256_digest(manifest_bytes),
            manifest_bytes.len() as i64,
        );
        self.push_blob(&desc, manifest_bytes)?;
        match tag {
            Some(tag) => self.tag(&desc, tag)?,
            None => {
                let _lock = self.lock()?;
                let mut index = self.read_index()?;
                if !index.manifests.iter().any(|d| {
                    d.digest == desc.digest && d.ref_name().is_none()
                }) {
                    index.manifests.push(desc.clone());
                    self.write_index(&index)?;
                }
            }
        }
        Ok(desc)
    }

    /// Tag a manifest descriptor. At most one manifest holds a tag at a
    /// time; retagging moves the tag.
    pub fn tag(&self, manifest: &Descriptor, tag: &str) -> Result<()> {
        let _lock = self.lock()?;
        let mut index = self.read_index()?;
        index.manifests.retain(|d| d.ref_name() != Some(tag));
        // An untagged entry for the same digest is subsumed by the tagged one
        index
            .manifests
            .retain(|d| !(d.digest == manifest.digest && d.ref_name().is_none()));
        let mut tagged = strip_ref_name(manifest);
        tagged.annotate(REF_NAME_ANNOTATION, tag);
        index.manifests.push(tagged);
        self.write_index(&index)?;
        tracing::debug!(repository = %self.name, tag, digest = %manifest.digest, "Tagged manifest");
        Ok(())
    }

    /// Remove a tag entry. Blobs are untouched.
    pub fn untag(&self, tag: &str) -> Result<()> {
        let _lock = self.lock()?;
        let mut index = self.read_index()?;
        let before = index.manifests.len();
        index.manifests.retain(|d| d.ref_name() != Some(tag));
        if index.manifests.len() == before {
            return Err(KitError::NotFound(format!(
                "tag {} in repository {}",
                tag, self.name
            )));
        }
        self.write_index(&index)?;
        tracing::debug!(repository = %self.name, tag, "Removed tag");
        Ok(())
    }

    /// Delete a manifest: drops every index entry pointing at it, then
    /// garbage-collects blobs no remaining manifest references.
    pub fn delete(&self, manifest: &Descriptor) -> Result<()> {
        let _lock = self.lock()?;
        let mut index = self.read_index()?;
        let before = index.manifests.len();
        index.manifests.retain(|d| d.digest != manifest.digest);
        if index.manifests.len() == before {
            return Err(KitError::NotFound(format!(
                "manifest {} in repository {}",
                manifest.digest, self.name
            )));
        }
        self.write_index(&index)?;
        self.garbage_collect(&index)?;
        tracing::info!(repository = %self.name, digest = %manifest.digest, "Deleted manifest");
        Ok(())
    }

    /// All index entries, with their tags in the refName annotation.
    pub fn list_manifests(&self) -> Result<Vec<Descriptor>> {
        Ok(self.read_index()?.manifests)
    }

    fn read_index(&self) -> Result<ImageIndex> {
        let path = self.root.join("index.json");
        let content = std::fs::read(&path)
            .map_err(|e| KitError::Storage(format!("failed to read index.json: {}", e)))?;
        serde_json::from_slice(&content)
            .map_err(|e| KitError::Storage(format!("failed to parse index.json: {}", e)))
    }

    fn write_index(&self, index: &ImageIndex) -> Result<()> {
        let content = serde_json::to_vec(index)?;
        write_atomic(&self.root, &self.root.join("index.json"), &content)
    }

    /// Remove blob files not reachable from any indexed manifest.
    fn garbage_collect(&self, index: &ImageIndex) -> Result<()> {
        let mut referenced: Vec<String> = Vec::new();
        for desc in &index.manifests {
            referenced.push(desc.digest.clone());
            let Ok(bytes) = self.fetch_bytes(&strip_ref_name(desc)) else {
                continue;
            };
            let Ok(manifest) = Manifest::from_slice(&bytes) else {
                continue;
            };
            referenced.push(manifest.config.digest.clone());
            for layer in &manifest.layers {
                referenced.push(layer.digest.clone());
            }
        }

        let blobs_dir = self.root.join("blobs").join(digest::SHA256);
        let entries = match std::fs::read_dir(&blobs_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        for entry in entries.flatten() {
            let hex = entry.file_name().to_string_lossy().to_string();
            let full = digest::format_digest(&hex);
            if !referenced.contains(&full) {
                tracing::debug!(digest = %full, "Garbage-collecting unreferenced blob");
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    fn lock(&self) -> Result<IndexLock> {
        IndexLock::acquire(self.root.join(LOCK_FILE_NAME))
    }
}

/// Advisory per-repository write lock, held for the duration of an index
/// mutation.
struct IndexLock {
    path: PathBuf,
}

impl IndexLock {
    fn acquire(path: PathBuf) -> Result<IndexLock> {
        for _ in 0..LOCK_ATTEMPTS {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(IndexLock { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => return Err(KitError::Io(e)),
            }
        }
        Err(KitError::Storage(format!(
            "timed out waiting for store lock at {}",
            path.display()
        )))
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn strip_ref_name(desc: &Descriptor) -> Descriptor {
    let mut stripped = desc.clone();
    if let Some(annotations) = stripped.annotations.as_mut() {
        annotations.remove(REF_NAME_ANNOTATION);
        if annotations.is_empty() {
            stripped.annotations = None;
        }
    }
    stripped
}

fn write_atomic(dir: &Path, target: &Path, content: &[u8]) -> Result<()> {
    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| KitError::Storage(format!("failed to create temp file: {}", e)))?;
    temp.write_all(content)?;
    temp.as_file().sync_all().ok();
    temp.persist(target)
        .map_err(|e| KitError::Storage(format!("failed to write {}: {}", target.display(), e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::OCI_MANIFEST_MEDIA_TYPE;
    use tempfile::TempDir;

    fn test_repo(tmp: &TempDir) -> LocalRepository {
        let store = LocalStore::open(tmp.path()).unwrap();
        let reference = Reference::parse("localhost/test/repo").unwrap();
        store.repository(&reference).unwrap()
    }

    fn blob_descriptor(content: &[u8]) -> Descriptor {
        Descriptor::new(
            "application/octet-stream",
            digest::sha256_digest(content),
            content.len() as i64,
        )
    }

    fn store_manifest(repo: &LocalRepository, layers: &[&[u8]], tag: Option<&str>) -> Descriptor {
        let config_bytes = b"{}".to_vec();
        let config = blob_descriptor(&config_bytes);
        repo.push_blob(&config, &config_bytes[..]).unwrap();
        let mut layer_descs = Vec::new();
        for content in layers {
            let desc = blob_descriptor(content);
            repo.push_blob(&desc, &content[..]).unwrap();
            layer_descs.push(desc);
        }
        let manifest = Manifest {
            schema_version: 2,
            media_type: OCI_MANIFEST_MEDIA_TYPE.to_string(),
            artifact_type: None,
            config,
            layers: layer_descs,
            annotations: None,
        };
        let bytes = manifest.to_bytes().unwrap();
        repo.add_manifest(&bytes, tag).unwrap()
    }

    #[test]
    fn test_open_initializes_layout() {
        let tmp = TempDir::new().unwrap();
        let repo = test_repo(&tmp);
        assert!(repo.root.join("oci-layout").is_file());
        assert!(repo.root.join("index.json").is_file());
        assert!(repo.root.join("blobs/sha256").is_dir());
        // Idempotent
        let store = LocalStore::open(tmp.path()).unwrap();
        let reference = Reference::parse("localhost/test/repo").unwrap();
        store.repository(&reference).unwrap();
    }

    #[test]
    fn test_push_and_fetch_blob() {
        let tmp = TempDir::new().unwrap();
        let repo = test_repo(&tmp);
        let content = b"layer contents";
        let desc = blob_descriptor(content);
        repo.push_blob(&desc, &content[..]).unwrap();
        assert!(repo.has_blob(&desc.digest));
        assert_eq!(repo.fetch_bytes(&desc).unwrap(), content);
    }

    #[test]
    fn test_push_blob_digest_mismatch() {
        let tmp = TempDir::new().unwrap();
        let repo = test_repo(&tmp);
        let mut desc = blob_descriptor(b"expected");
        desc.size = 5;
        match repo.push_blob(&desc, &b"other"[..]) {
            Err(KitError::Integrity(_)) => {}
            other => panic!("expected integrity error, got {:?}", other),
        }
        assert!(!repo.has_blob(&desc.digest));
    }

    #[test]
    fn test_push_blob_size_mismatch() {
        let tmp = TempDir::new().unwrap();
        let repo = test_repo(&tmp);
        let content = b"data";
        let mut desc = blob_descriptor(content);
        desc.size = 99;
        assert!(matches!(
            repo.push_blob(&desc, &content[..]),
            Err(KitError::Integrity(_))
        ));
    }

    #[test]
    fn test_push_existing_blob_is_noop() {
        let tmp = TempDir::new().unwrap();
        let repo = test_repo(&tmp);
        let content = b"shared";
        let desc = blob_descriptor(content);
        repo.push_blob(&desc, &content[..]).unwrap();
        // Second push with garbage content succeeds without touching the blob
        repo.push_blob(&desc, &b"ignored"[..]).unwrap();
        assert_eq!(repo.fetch_bytes(&desc).unwrap(), content);
    }

    #[test]
    fn test_fetch_missing_blob() {
        let tmp = TempDir::new().unwrap();
        let repo = test_repo(&tmp);
        let desc = blob_descriptor(b"never stored");
        assert!(matches!(repo.fetch(&desc), Err(KitError::NotFound(_))));
    }

    #[test]
    fn test_fetch_detects_tampering() {
        let tmp = TempDir::new().unwrap();
        let repo = test_repo(&tmp);
        let content = b"original bytes";
        let desc = blob_descriptor(content);
        repo.push_blob(&desc, &content[..]).unwrap();

        // Flip one byte in the stored blob
        let path = repo.blob_path(&desc.digest).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        match repo.fetch_bytes(&desc) {
            Err(KitError::Integrity(_)) => {}
            other => panic!("expected integrity error, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_by_tag_and_digest() {
        let tmp = TempDir::new().unwrap();
        let repo = test_repo(&tmp);
        let desc = store_manifest(&repo, &[b"layer"], Some("v1"));

        let by_tag = repo.resolve("v1").unwrap();
        assert_eq!(by_tag.digest, desc.digest);
        let by_digest = repo.resolve(&desc.digest).unwrap();
        assert_eq!(by_digest.digest, desc.digest);
        assert!(matches!(repo.resolve("v2"), Err(KitError::NotFound(_))));
    }

    #[test]
    fn test_resolve_empty_reference() {
        let tmp = TempDir::new().unwrap();
        let repo = test_repo(&tmp);
        assert!(repo.resolve("").is_err());
        let desc = store_manifest(&repo, &[b"only"], Some("v1"));
        assert_eq!(repo.resolve("").unwrap().digest, desc.digest);
    }

    #[test]
    fn test_retag_moves_tag() {
        let tmp = TempDir::new().unwrap();
        let repo = test_repo(&tmp);
        let first = store_manifest(&repo, &[b"first"], Some("latest"));
        let second = store_manifest(&repo, &[b"second"], Some("latest"));
        assert_ne!(first.digest, second.digest);
        assert_eq!(repo.resolve("latest").unwrap().digest, second.digest);
        // Only one entry holds the tag
        let tagged: Vec<_> = repo
            .list_manifests()
            .unwrap()
            .into_iter()
            .filter(|d| d.ref_name() == Some("latest"))
            .collect();
        assert_eq!(tagged.len(), 1);
    }

    #[test]
    fn test_multiple_tags_same_manifest() {
        let tmp = TempDir::new().unwrap();
        let repo = test_repo(&tmp);
        let desc = store_manifest(&repo, &[b"layer"], Some("v1"));
        repo.tag(&desc, "latest").unwrap();
        assert_eq!(repo.resolve("v1").unwrap().digest, desc.digest);
        assert_eq!(repo.resolve("latest").unwrap().digest, desc.digest);
    }

    #[test]
    fn test_untag_keeps_blobs() {
        let tmp = TempDir::new().unwrap();
        let repo = test_repo(&tmp);
        let desc = store_manifest(&repo, &[b"kept layer"], Some("v1"));
        repo.untag("v1").unwrap();
        assert!(matches!(repo.resolve("v1"), Err(KitError::NotFound(_))));
        // Manifest blob still present
        assert!(repo.has_blob(&desc.digest));
        assert!(matches!(repo.untag("v1"), Err(KitError::NotFound(_))));
    }

    #[test]
    fn test_delete_garbage_collects() {
        let tmp = TempDir::new().unwrap();
        let repo = test_repo(&tmp);
        let shared = b"shared layer";
        let only_first = b"first only";
        let first = store_manifest(&repo, &[shared, only_first], Some("v1"));
        let _second = store_manifest(&repo, &[shared], Some("v2"));

        repo.delete(&first).unwrap();
        assert!(matches!(repo.resolve("v1"), Err(KitError::NotFound(_))));
        // Shared blob survives, exclusive blob is swept
        assert!(repo.has_blob(&blob_descriptor(shared).digest));
        assert!(!repo.has_blob(&blob_descriptor(only_first).digest));
        assert!(!repo.has_blob(&first.digest));
        // Other manifest is unaffected
        assert!(repo.resolve("v2").is_ok());
    }

    #[test]
    fn test_store_list() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let reference = Reference::parse("localhost/models/alpha").unwrap();
        let repo = store.repository(&reference).unwrap();
        let desc = store_manifest(&repo, &[b"layer"], Some("v1"));

        let infos = store.list().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].repository, "localhost/models/alpha");
        assert_eq!(infos[0].digest, desc.digest);
        assert_eq!(infos[0].tags, vec!["v1"]);
    }

    #[test]
    fn test_push_idempotent_descriptor() {
        let tmp = TempDir::new().unwrap();
        let repo = test_repo(&tmp);
        let content = b"idempotent";
        let desc = blob_descriptor(content);
        repo.push_blob(&desc, &content[..]).unwrap();
        let before = std::fs::metadata(repo.blob_path(&desc.digest).unwrap()).unwrap();
        repo.push_blob(&desc, &content[..]).unwrap();
        let after = std::fs::metadata(repo.blob_path(&desc.digest).unwrap()).unwrap();
        assert_eq!(
            before.modified().unwrap(),
            after.modified().unwrap(),
            "re-push should not rewrite the blob"
        );
    }
}
