//! High-level modelkit operations over the local store and remote
//! registries. These are the entry points thin frontends call.

use kitforge_core::{KitError, Result};

use crate::oci::{Descriptor, Manifest};
use crate::pack::{pack_modelkit, PackOptions};
use crate::reference::Reference;
use crate::remote::Repository;
use crate::store::{LocalStore, ManifestInfo};
use crate::unpack::{unpack_modelkit, UnpackOptions};

/// Pack a context directory into the local store.
pub fn pack(store: &LocalStore, opts: &PackOptions) -> Result<Descriptor> {
    pack_modelkit(store, opts)
}

/// Unpack a modelkit from the local store.
pub fn unpack(store: &LocalStore, opts: &UnpackOptions) -> Result<()> {
    unpack_modelkit(store, opts)
}

/// Resolve a reference in the local store.
pub fn resolve(store: &LocalStore, reference: &Reference) -> Result<Descriptor> {
    let repo = store.repository(reference)?;
    repo.resolve(&reference.reference)
}

/// Enumerate every modelkit in the local store.
pub fn list(store: &LocalStore) -> Result<Vec<ManifestInfo>> {
    store.list()
}

/// Push a locally stored modelkit to its registry.
///
/// Blobs already present remotely are skipped; the manifest goes up last so
/// the remote never references missing content.
pub async fn push(
    store: &LocalStore,
    remote: &Repository,
    reference: &Reference,
) -> Result<Descriptor> {
    let repo = store.repository(reference)?;
    let manifest_desc = repo.resolve(&reference.reference)?;
    let manifest_bytes = repo.fetch_bytes(&manifest_desc)?;
    let manifest = Manifest::from_slice(&manifest_bytes)?;

    let mut blobs = vec![manifest.config.clone()];
    blobs.extend(manifest.layers.iter().cloned());
    for desc in blobs {
        if remote.blob_exists(&desc.digest).await? {
            tracing::debug!(digest = %desc.digest, "Blob already present remotely");
            continue;
        }
        let path = repo.blob_path(&desc.digest)?;
        let mut file = std::fs::File::open(&path).map_err(|e| {
            KitError::NotFound(format!("blob {} ({})", desc.digest, e))
        })?;
        remote.push_blob(&desc, &mut file).await?;
        tracing::info!(digest = %desc.digest, size = desc.size, "Pushed blob");
    }

    let manifest_ref = if reference.has_reference() {
        reference.reference.clone()
    } else {
        manifest_desc.digest.clone()
    };
    remote.push_manifest(&manifest_ref, &manifest_bytes).await?;
    tracing::info!(reference = %reference.display(), "Pushed modelkit");
    Ok(manifest_desc)
}

/// Pull a modelkit from a registry into the local store.
pub async fn pull(
    store: &LocalStore,
    remote: &Repository,
    reference: &Reference,
) -> Result<Descriptor> {
    let remote_desc = remote.resolve(&reference.reference).await?;
    let manifest_bytes = remote.fetch_manifest_bytes(&remote_desc).await?;
    let manifest = Manifest::from_slice(&manifest_bytes)?;

    let repo = store.repository(reference)?;
    let mut blobs = vec![manifest.config.clone()];
    blobs.extend(manifest.layers.iter().cloned());
    for desc in blobs {
        if repo.has_blob(&desc.digest) {
            tracing::debug!(digest = %desc.digest, "Blob already stored locally");
            continue;
        }
        let bytes = remote.fetch_blob(&desc).await?;
        repo.push_blob(&desc, &bytes[..])?;
        tracing::info!(digest = %desc.digest, size = desc.size, "Pulled blob");
    }

    let tag = if reference.has_reference() && !reference.is_digest() {
        Some(reference.reference.as_str())
    } else {
        None
    };
    let stored = repo.add_manifest(&manifest_bytes, tag)?;
    tracing::info!(
        reference = %reference.display(),
        digest = %stored.digest,
        "Pulled modelkit"
    );
    Ok(stored)
}

/// Remove a modelkit from the local store.
///
/// A tag without `force` only removes the tag; a digest reference or
/// `force` deletes the manifest and garbage-collects its blobs.
pub fn remove_local(store: &LocalStore, reference: &Reference, force: bool) -> Result<()> {
    let repo = store.repository(reference)?;
    if !reference.is_digest() && !force {
        tracing::info!(reference = %reference.display(), "Untagging modelkit");
        return repo.untag(&reference.reference);
    }
    let desc = repo.resolve(&reference.reference)?;
    tracing::info!(reference = %reference.display(), "Deleting modelkit");
    repo.delete(&desc)
}

/// Remove a modelkit from a remote registry.
///
/// A tag without `force` is only untagged, assuming the remote prunes
/// untagged manifests; otherwise the manifest itself is deleted, removing
/// every tag that points at it.
pub async fn remove_remote(
    remote: &Repository,
    reference: &Reference,
    force: bool,
) -> Result<()> {
    let desc = remote.resolve(&reference.reference).await?;
    if !reference.is_digest() && !force {
        tracing::info!(reference = %reference.display(), "Untagging remote modelkit");
        return remote.untag(&reference.reference).await;
    }
    tracing::info!(reference = %reference.display(), digest = %desc.digest, "Deleting remote modelkit");
    remote.delete_manifest(&desc).await
}
