//! Path containment checks.
//!
//! Both packing and unpacking resolve user- or archive-supplied paths
//! against a root directory and must reject anything that lands outside it,
//! including escapes through symlinks.

use std::path::{Component, Path, PathBuf};

use kitforge_core::{KitError, Result};

/// Resolve `sub` against `root`, verifying the result stays inside `root`.
///
/// Returns `(absolute, relative)` where `relative` is the lexically
/// normalized subpath. Symlinks along the existing portion of the path are
/// expanded before the containment check.
pub fn verify_subpath(root: &Path, sub: impl AsRef<Path>) -> Result<(PathBuf, PathBuf)> {
    let sub = sub.as_ref();
    let escape = || KitError::PathEscape {
        root: root.display().to_string(),
        path: sub.display().to_string(),
    };

    let mut rel = PathBuf::new();
    for component in sub.components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !rel.pop() {
                    return Err(escape());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(escape()),
        }
    }

    let root_abs = absolutize(root)?;
    let abs = root_abs.join(&rel);

    // Expand symlinks on the deepest existing ancestor and require it to
    // stay within the (expanded) root.
    let canonical_root = if root_abs.exists() {
        root_abs.canonicalize()?
    } else {
        root_abs.clone()
    };
    let mut probe = abs.clone();
    while !probe.exists() {
        match probe.parent() {
            Some(parent) => probe = parent.to_path_buf(),
            None => break,
        }
    }
    if probe.exists() {
        let canonical_probe = probe.canonicalize()?;
        let inside = canonical_probe.starts_with(&canonical_root)
            || canonical_root.starts_with(&canonical_probe);
        if !inside {
            return Err(escape());
        }
    }

    Ok((abs, rel))
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_simple_subpath() {
        let dir = TempDir::new().unwrap();
        let (abs, rel) = verify_subpath(dir.path(), "models/weights.bin").unwrap();
        assert_eq!(rel, PathBuf::from("models/weights.bin"));
        assert!(abs.starts_with(dir.path()));
    }

    #[test]
    fn test_current_dir_components_are_dropped() {
        let dir = TempDir::new().unwrap();
        let (_, rel) = verify_subpath(dir.path(), "./a/./b").unwrap();
        assert_eq!(rel, PathBuf::from("a/b"));
    }

    #[test]
    fn test_internal_parent_components_resolve() {
        let dir = TempDir::new().unwrap();
        let (_, rel) = verify_subpath(dir.path(), "a/b/../c").unwrap();
        assert_eq!(rel, PathBuf::from("a/c"));
    }

    #[test]
    fn test_escape_via_parent_components() {
        let dir = TempDir::new().unwrap();
        let err = verify_subpath(dir.path(), "../../etc/passwd").unwrap_err();
        assert!(matches!(err, KitError::PathEscape { .. }));
    }

    #[test]
    fn test_escape_via_nested_parents() {
        let dir = TempDir::new().unwrap();
        let err = verify_subpath(dir.path(), "a/../../outside").unwrap_err();
        assert!(matches!(err, KitError::PathEscape { .. }));
    }

    #[test]
    fn test_absolute_path_rejected() {
        let dir = TempDir::new().unwrap();
        let err = verify_subpath(dir.path(), "/etc/passwd").unwrap_err();
        assert!(matches!(err, KitError::PathEscape { .. }));
    }

    #[test]
    fn test_nonexistent_target_allowed() {
        let dir = TempDir::new().unwrap();
        assert!(verify_subpath(dir.path(), "not/yet/created.txt").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let outside = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();
        let err = verify_subpath(root.path(), "link/file.txt").unwrap_err();
        assert!(matches!(err, KitError::PathEscape { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_root_allowed() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("real")).unwrap();
        std::os::unix::fs::symlink(root.path().join("real"), root.path().join("link")).unwrap();
        assert!(verify_subpath(root.path(), "link/file.txt").is_ok());
    }
}
