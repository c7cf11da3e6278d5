//! Parent-chain resolution for Kitfiles.
//!
//! A Kitfile whose `model.path` names another modelkit inherits that
//! parent's model parts. The chain is walked iteratively with an explicit
//! visited stack, bounded by the maximum reference-chain depth.

use kitforge_core::{config, KitError, Result};

use crate::kitfile::Kitfile;
use crate::reference::{is_modelkit_reference, Reference};

/// Source of Kitfiles for parent references. Backed by the local store in
/// practice; tests substitute an in-memory map.
pub trait KitfileFetcher {
    fn fetch(&self, reference: &Reference) -> Result<Kitfile>;
}

/// Resolve a Kitfile's parent-model chain into a flat, merged view.
///
/// The returned Kitfile's `model.path` is a filesystem path (from the leaf
/// ancestor) and its parts list contains ancestor parts followed by the
/// descendant's own parts.
pub fn resolve_parent_chain(fetcher: &dyn KitfileFetcher, kitfile: &Kitfile) -> Result<Kitfile> {
    let mut merged = kitfile.clone();
    let mut visited: Vec<String> = Vec::new();

    loop {
        let Some(model) = merged.model.as_ref() else {
            return Ok(merged);
        };
        if !is_modelkit_reference(&model.path) {
            return Ok(merged);
        }

        let ref_str = model.path.clone();
        if let Some(idx) = visited.iter().position(|v| v == &ref_str) {
            let cycle = format!("[{}=>{}]", visited[idx..].join("=>"), ref_str);
            return Err(KitError::CycleDetected(cycle));
        }
        if visited.len() >= config::MAX_MODEL_REF_CHAIN {
            visited.push(ref_str);
            return Err(KitError::DepthExceeded(visited.join("=>")));
        }
        visited.push(ref_str.clone());

        let parent_ref = Reference::parse(&ref_str)?;
        tracing::debug!(reference = %parent_ref, "Resolving parent modelkit");
        let parent = fetcher.fetch(&parent_ref)?;
        let Some(parent_model) = parent.model else {
            return Err(KitError::InvalidKitfile(format!(
                "referenced modelkit {} has no model",
                parent_ref.display()
            )));
        };

        let mut model = merged.model.take().unwrap_or_default();
        model.path = parent_model.path;
        if model.name.is_none() {
            model.name = parent_model.name;
        }
        let mut parts = parent_model.parts;
        parts.extend(model.parts);
        model.parts = parts;
        merged.model = Some(model);
    }
}
