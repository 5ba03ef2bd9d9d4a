//! Directory-tree staging between templates, the working case, and the archive.
//!
//! Every operation here is total: trees are discardable, so a failure leaves
//! whatever was half-copied for the next reset to clear.
use crate::error::StagingError;
use crate::timestep::Timestep;
use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::Path;

/// Delete `path` if present, then optionally recreate it empty.
///
/// A missing path already satisfies the delete half.
pub fn reset_directory(path: &Path, create_new: bool) -> Result<()> {
    remove_if_exists(path)?;
    if create_new {
        fs::create_dir_all(path).with_context(|| format!("create {}", path.display()))?;
    }
    Ok(())
}

/// Remove a file or a whole tree; a missing path is not an error.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err).with_context(|| format!("inspect {}", path.display())),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path).with_context(|| format!("remove {}", path.display()))?;
    } else {
        fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    }
    Ok(true)
}

/// Recursively copy the directory `src` to the new path `dst`.
///
/// Refuses to merge into an existing destination.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(StagingError::MissingSource(src.to_path_buf()).into());
    }
    if fs::symlink_metadata(dst).is_ok() {
        return Err(StagingError::DestinationExists(dst.to_path_buf()).into());
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    copy_dir_recursive(src, dst)
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir(dst).with_context(|| format!("create {}", dst.display()))?;
    let mut entries = fs::read_dir(src)
        .with_context(|| format!("read {}", src.display()))?
        .collect::<io::Result<Vec<_>>>()
        .with_context(|| format!("read {}", src.display()))?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else {
            fs::copy(&from, &to)
                .with_context(|| format!("copy {} to {}", from.display(), to.display()))?;
        }
    }
    Ok(())
}

/// Move the directory `src` to the new path `dst`.
///
/// Falls back to copy-then-delete when a rename cannot cross filesystems.
pub fn move_tree(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(StagingError::MissingSource(src.to_path_buf()).into());
    }
    if fs::symlink_metadata(dst).is_ok() {
        return Err(StagingError::DestinationExists(dst.to_path_buf()).into());
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    copy_tree(src, dst)?;
    fs::remove_dir_all(src).with_context(|| format!("remove {}", src.display()))?;
    Ok(())
}

/// Copy one file, creating parent directories and replacing any existing file.
pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_file() {
        return Err(StagingError::MissingSource(src.to_path_buf()).into());
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::copy(src, dst).with_context(|| format!("copy {} to {}", src.display(), dst.display()))?;
    Ok(())
}

/// Generated-artifact name rules for [`clean_case`].
#[derive(Debug, Clone)]
pub struct CleanRules<'a> {
    pub file_prefixes: Vec<&'a str>,
    pub file_suffixes: Vec<&'a str>,
    /// Directories whose name contains any of these are removed.
    pub dir_fragments: Vec<&'a str>,
}

impl Default for CleanRules<'_> {
    fn default() -> Self {
        Self {
            file_prefixes: Vec::new(),
            file_suffixes: vec![".eMesh"],
            dir_fragments: vec!["polyMesh", "extendedFeatureEdgeMesh", "processor"],
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanReport {
    pub files_removed: usize,
    pub dirs_removed: usize,
}

/// Remove solver-generated files and folders below `root`.
///
/// Numeric (timestep) directories go too, except the `0` initial conditions.
/// `.git` is never entered.
pub fn clean_case(root: &Path, rules: &CleanRules<'_>) -> Result<CleanReport> {
    let mut report = CleanReport::default();
    if root.is_dir() {
        clean_dir(root, rules, &mut report)?;
    }
    Ok(report)
}

fn clean_dir(dir: &Path, rules: &CleanRules<'_>, report: &mut CleanReport) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("read {}", dir.display()))?
        .collect::<io::Result<Vec<_>>>()
        .with_context(|| format!("read {}", dir.display()))?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry
            .file_type()
            .with_context(|| format!("inspect {}", path.display()))?;
        if file_type.is_dir() {
            if name == ".git" {
                continue;
            }
            if is_generated_dir(&name, rules) {
                fs::remove_dir_all(&path)
                    .with_context(|| format!("remove {}", path.display()))?;
                report.dirs_removed += 1;
            } else {
                clean_dir(&path, rules, report)?;
            }
        } else if is_generated_file(&name, rules) {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
            report.files_removed += 1;
        }
    }
    Ok(())
}

fn is_generated_dir(name: &str, rules: &CleanRules<'_>) -> bool {
    if name == "0" {
        return false;
    }
    rules
        .dir_fragments
        .iter()
        .any(|fragment| name.contains(fragment))
        || Timestep::parse(name).is_some()
}

fn is_generated_file(name: &str, rules: &CleanRules<'_>) -> bool {
    rules
        .file_prefixes
        .iter()
        .any(|prefix| name.starts_with(prefix))
        || rules.file_suffixes.iter().any(|suffix| name.ends_with(suffix))
}
