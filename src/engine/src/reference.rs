//! Model reference parsing.
//!
//! References take the form `[registry/]repository[:tag][@algorithm:hex]`.
//! When no registry is present the reference addresses the local store.

use std::fmt;

use kitforge_core::{KitError, Result};

use crate::digest;

/// Registry sentinel used for references that only address the local store.
pub const LOCAL_REGISTRY: &str = "localhost";

/// Parsed model reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Registry host, possibly with a port (e.g. "ghcr.io", "registry.local:5000")
    pub registry: String,
    /// Repository path (e.g. "jozu/phi3")
    pub repository: String,
    /// Sub-reference: empty, a tag, or a digest
    pub reference: String,
}

impl Reference {
    /// Parse a model reference string.
    ///
    /// Supports formats:
    /// - `myrepo` → localhost/myrepo (local store only)
    /// - `myrepo:v1` → localhost/myrepo:v1
    /// - `ghcr.io/org/model:tag`
    /// - `ghcr.io/org/model@sha256:abc...`
    pub fn parse(reference: &str) -> Result<Self> {
        let raw = reference.trim();
        if raw.is_empty() {
            return Err(invalid(reference, "empty reference"));
        }

        // Split off the digest first (@ separator)
        let (name_tag, sub_digest) = match raw.rsplit_once('@') {
            Some((name, digest_part)) => {
                if !digest::is_valid_digest(digest_part) {
                    return Err(invalid(reference, "expected digest in algorithm:hex form"));
                }
                (name, Some(digest_part.to_string()))
            }
            None => (raw, None),
        };

        // Split the tag: a colon after the last slash
        let (name, tag) = match name_tag.rfind('/') {
            Some(slash_pos) => match name_tag[slash_pos + 1..].rfind(':') {
                Some(colon_pos) => {
                    let split = slash_pos + 1 + colon_pos;
                    (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
                }
                None => (name_tag, None),
            },
            None => match name_tag.rfind(':') {
                Some(colon_pos) => (
                    &name_tag[..colon_pos],
                    Some(name_tag[colon_pos + 1..].to_string()),
                ),
                None => (name_tag, None),
            },
        };

        if tag.is_some() && sub_digest.is_some() {
            return Err(invalid(reference, "cannot specify both tag and digest"));
        }

        let (registry, repository) = split_registry_repository(name)
            .ok_or_else(|| invalid(reference, "empty repository"))?;

        if let Some(ref t) = tag {
            if t.is_empty() || t.contains('/') {
                return Err(invalid(reference, "malformed tag"));
            }
        }

        Ok(Reference {
            registry: registry.to_ascii_lowercase(),
            repository,
            reference: sub_digest.or(tag).unwrap_or_default(),
        })
    }

    /// Whether the sub-reference is present (tag or digest).
    pub fn has_reference(&self) -> bool {
        !self.reference.is_empty()
    }

    /// Whether the sub-reference is a digest literal.
    pub fn is_digest(&self) -> bool {
        digest::is_valid_digest(&self.reference)
    }

    /// Succeeds iff the sub-reference is a digest literal.
    pub fn validate_as_digest(&self) -> Result<()> {
        if self.is_digest() {
            Ok(())
        } else {
            Err(invalid(&self.to_string(), "reference is not a digest"))
        }
    }

    /// Whether this reference only addresses the local store.
    pub fn is_local(&self) -> bool {
        self.registry == LOCAL_REGISTRY
    }

    /// A copy of this reference with a different sub-reference.
    pub fn with_reference(&self, sub: impl Into<String>) -> Reference {
        Reference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            reference: sub.into(),
        }
    }

    /// User-facing form: hides the local-registry sentinel.
    pub fn display(&self) -> String {
        let full = self.to_string();
        match full.strip_prefix(&format!("{}/", LOCAL_REGISTRY)) {
            Some(trimmed) => trimmed.to_string(),
            None => full,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if self.reference.is_empty() {
            return Ok(());
        }
        if self.is_digest() {
            write!(f, "@{}", self.reference)
        } else {
            write!(f, ":{}", self.reference)
        }
    }
}

/// Whether a Kitfile `model.path` value is a reference to another modelkit
/// rather than a filesystem path. Detected by a registry-shaped head segment.
pub fn is_modelkit_reference(path: &str) -> bool {
    match Reference::parse(path) {
        Ok(parsed) => parsed.registry != LOCAL_REGISTRY || path.starts_with("localhost/"),
        Err(_) => false,
    }
}

fn invalid(reference: &str, message: &str) -> KitError {
    KitError::InvalidReference {
        reference: reference.to_string(),
        message: message.to_string(),
    }
}

/// Split a name into registry and repository. The first path segment is a
/// registry when it contains a dot or colon, or is literally "localhost".
fn split_registry_repository(name: &str) -> Option<(String, String)> {
    if let Some(slash_pos) = name.find('/') {
        let head = &name[..slash_pos];
        let registry_shaped = head != "." && head != ".."
            && (head.contains('.') || head.contains(':') || head == "localhost");
        if registry_shaped {
            let repository = &name[slash_pos + 1..];
            if repository.is_empty() {
                return None;
            }
            return Some((head.to_string(), repository.to_string()));
        }
    }
    if name.is_empty() {
        return None;
    }
    Some((LOCAL_REGISTRY.to_string(), name.to_string()))
}
