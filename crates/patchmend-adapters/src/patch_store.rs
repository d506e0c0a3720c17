//! The per-project patches directory: `NNNN-description.patch` files applied
//! in numeric order.

use crate::config::write_atomic;
use anyhow::{Context, Result};
use patchmend_core::FixError;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchEntry {
    pub number: u32,
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PatchStore {
    dir: PathBuf,
}

/// `0007-fix-build.patch` → 7. Anything else is not a series member.
pub fn series_number(file_name: &str) -> Option<u32> {
    let stem = file_name.strip_suffix(".patch")?;
    let (digits, description) = stem.split_once('-')?;
    if digits.len() < 4 || description.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

impl PatchStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn list(&self) -> Result<Vec<PatchEntry>> {
        if !self.dir.is_dir() {
            anyhow::bail!("Patches directory '{}' does not exist", self.dir.display());
        }
        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry
                .with_context(|| format!("Failed to list '{}'", self.dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(number) = series_number(&name) {
                entries.push(PatchEntry {
                    number,
                    name,
                    path: entry.path().to_path_buf(),
                });
            }
        }
        entries.sort_by(|a, b| a.number.cmp(&b.number).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    /// Look up by file name, or by bare number (`7`, `0007`).
    pub fn find(&self, selector: &str) -> Result<Option<PatchEntry>> {
        let selector = selector.trim();
        let by_number = selector.parse::<u32>().ok();
        Ok(self.list()?.into_iter().find(|entry| {
            entry.name == selector || by_number.is_some_and(|n| n == entry.number)
        }))
    }

    pub fn read(&self, entry: &PatchEntry) -> Result<String> {
        fs::read_to_string(&entry.path)
            .with_context(|| format!("Failed to read patch '{}'", entry.path.display()))
    }

    /// Replace a patch in place.
    pub fn overwrite(&self, entry: &PatchEntry, content: &str) -> Result<(), FixError> {
        let storage_error = |e: std::io::Error| FixError::Storage {
            path: entry.path.display().to_string(),
            message: e.to_string(),
        };
        let permissions = fs::metadata(&entry.path).map(|m| m.permissions()).ok();
        write_atomic(&entry.path, content).map_err(storage_error)?;
        if let Some(permissions) = permissions {
            fs::set_permissions(&entry.path, permissions).map_err(storage_error)?;
        }
        tracing::info!(patch = %entry.name, bytes = content.len(), "patch rewritten");
        Ok(())
    }
}
