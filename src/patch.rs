//! Keyed-line substitution for toolkit dictionaries and field headers.
//!
//! Files are treated as opaque lines: any line containing the key is replaced
//! wholesale by `{key}    {value};`, and every other byte is left alone.
use crate::error::PatchError;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Gap between key and value in a rewritten line.
const KEY_VALUE_GAP: &str = "    ";

/// One pending rewrite: in `path`, every line containing `key` gets `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchDirective {
    pub path: PathBuf,
    pub key: String,
    pub value: String,
}

impl PatchDirective {
    pub fn new(path: impl Into<PathBuf>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    /// Apply loosely; a missing key leaves the file untouched.
    pub fn apply(&self) -> Result<usize> {
        patch_file(&self.path, &self.key, &self.value)
    }

    /// Apply strictly; a missing key is a `PatchError::KeyNotFound`.
    pub fn apply_strict(&self) -> Result<usize> {
        patch_file_strict(&self.path, &self.key, &self.value)
    }
}

/// Rewrite every line of `path` that contains `key`.
///
/// Returns the number of rewritten lines. When nothing matches the file is
/// not written at all, so it stays byte-identical.
pub fn patch_file(path: &Path, key: &str, value: impl std::fmt::Display) -> Result<usize> {
    if key.is_empty() {
        return Err(PatchError::EmptyKey {
            path: path.to_path_buf(),
        }
        .into());
    }
    let original = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let replacement = format!("{key}{KEY_VALUE_GAP}{value};\n");
    let (patched, replaced) = patch_bytes(&original, key.as_bytes(), replacement.as_bytes());
    if replaced == 0 {
        tracing::debug!(path = %path.display(), key, "patch key not present");
        return Ok(0);
    }
    replace_file(path, &patched)?;
    tracing::debug!(path = %path.display(), key, replaced, "patched");
    Ok(replaced)
}

/// Like [`patch_file`], but fails when no line contains `key`.
pub fn patch_file_strict(path: &Path, key: &str, value: impl std::fmt::Display) -> Result<usize> {
    let replaced = patch_file(path, key, value)?;
    if replaced == 0 {
        return Err(PatchError::KeyNotFound {
            path: path.to_path_buf(),
            key: key.to_string(),
        }
        .into());
    }
    Ok(replaced)
}

fn patch_bytes(original: &[u8], key: &[u8], replacement: &[u8]) -> (Vec<u8>, usize) {
    let mut out = Vec::with_capacity(original.len() + replacement.len());
    let mut replaced = 0;
    for line in original.split_inclusive(|byte| *byte == b'\n') {
        if contains(line, key) {
            out.extend_from_slice(replacement);
            replaced += 1;
        } else {
            out.extend_from_slice(line);
        }
    }
    (out, replaced)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

fn replace_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("patched");
    let tmp_path = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!(".{file_name}.tmp"));
    let permissions = fs::metadata(path)
        .with_context(|| format!("inspect {}", path.display()))?
        .permissions();
    fs::write(&tmp_path, bytes).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::set_permissions(&tmp_path, permissions)
        .with_context(|| format!("set permissions on {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
