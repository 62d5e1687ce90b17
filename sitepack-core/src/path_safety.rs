use anyhow::{bail, Result};
use std::path::{Component, Path, PathBuf};

/// Separator used between directory levels in container entry names.
pub const SEPARATOR: char = '/';

#[derive(Clone, Copy, Debug, Default)]
pub struct PathPolicy {
    pub follow_symlinks: bool,
}

/// Validate a single manifest name (one directory level).
pub fn validate_component(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("empty names are not allowed");
    }
    if name == "." || name == ".." {
        bail!("relative component not allowed as a name: {:?}", name);
    }
    if name.contains(SEPARATOR) || name.contains('\\') {
        bail!("name contains a path separator: {:?}", name);
    }
    if name.contains('\0') {
        bail!("name contains NUL: {:?}", name);
    }
    Ok(())
}

/// Validate a `/`-separated container entry name: every component must be a
/// valid manifest name.
pub fn validate_entry_name(name: &str) -> Result<()> {
    if name.starts_with(SEPARATOR) {
        bail!("absolute entry names are not allowed: {:?}", name);
    }
    for comp in name.split(SEPARATOR) {
        validate_component(comp)?;
    }
    Ok(())
}

/// Resolve entry `name` to a destination under `root`: no absolute, no `..`,
/// and unless `follow_symlinks` no existing ancestor may be a symlink. With
/// `follow_symlinks` the deepest existing ancestor must canonicalize under root.
pub fn destination_for(root: &Path, name: &str, policy: PathPolicy) -> Result<PathBuf> {
    validate_entry_name(name)?;
    let rel = Path::new(name);
    if rel.is_absolute() {
        bail!("absolute paths are not allowed: {:?}", rel);
    }
    for comp in rel.components() {
        if matches!(comp, Component::ParentDir) {
            bail!("parent traversal not allowed: {:?}", rel);
        }
    }
    let candidate = root.join(rel);
    if !policy.follow_symlinks {
        let mut cur = root.to_path_buf();
        for comp in rel.components() {
            cur = cur.join(comp);
            if let Ok(m) = std::fs::symlink_metadata(&cur) {
                if m.file_type().is_symlink() {
                    bail!("symlink in path (not following): {:?}", cur);
                }
            }
        }
        Ok(candidate)
    } else {
        let root_can = std::fs::canonicalize(root)?;
        let mut existing = candidate.as_path();
        while !existing.exists() {
            match existing.parent() {
                Some(p) => existing = p,
                None => break,
            }
        }
        let existing_can = std::fs::canonicalize(existing)?;
        if !existing_can.starts_with(&root_can) {
            bail!("path escapes root: {:?}", rel);
        }
        Ok(candidate)
    }
}
