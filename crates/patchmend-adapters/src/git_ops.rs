//! Git working-tree operations for the repair loop
//!
//! Resets a checkout to its committed state between attempts.

use anyhow::{Context, Result};
use git2::build::CheckoutBuilder;
use git2::{Repository, ResetType, Status, StatusOptions};
use patchmend_core::{Checkout, CheckoutError};
use std::fs;
use std::path::{Path, PathBuf};

/// Ignored files that still count as leftovers from an apply.
const APPLY_ARTIFACT_SUFFIXES: &[&str] = &[".rej", ".orig"];

#[derive(Debug, Clone)]
pub struct GitCheckout {
    root: PathBuf,
}

impl GitCheckout {
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::open(path)
            .with_context(|| format!("Failed to open repository at '{}'", path.display()))?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| anyhow::anyhow!("Repository at '{}' is bare", path.display()))?;
        let root = workdir
            .canonicalize()
            .with_context(|| format!("Failed to resolve '{}'", workdir.display()))?;
        Ok(Self { root })
    }

    fn repo(&self) -> Result<Repository, git2::Error> {
        Repository::open(&self.root)
    }

    fn reset_error(&self, message: impl ToString) -> CheckoutError {
        CheckoutError::Reset {
            root: self.root.display().to_string(),
            message: message.to_string(),
        }
    }

    fn status_error(&self, message: impl ToString) -> CheckoutError {
        CheckoutError::Status {
            root: self.root.display().to_string(),
            message: message.to_string(),
        }
    }

    /// Untracked files plus ignored apply artifacts; these are removed on reset.
    fn leftovers(&self, repo: &Repository) -> Result<Vec<String>, git2::Error> {
        Ok(scan(repo)?
            .into_iter()
            .filter(|entry| entry.removable)
            .map(|entry| entry.path)
            .collect())
    }

    fn remove_leftover(&self, rel: &str) -> std::io::Result<()> {
        let path = self.root.join(rel);
        let metadata = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if metadata.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        prune_empty_parents(&self.root, &path);
        Ok(())
    }
}

struct StatusEntry {
    path: String,
    removable: bool,
}

fn is_apply_artifact(path: &str) -> bool {
    APPLY_ARTIFACT_SUFFIXES.iter().any(|s| path.ends_with(s))
}

fn scan(repo: &Repository) -> Result<Vec<StatusEntry>, git2::Error> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true);
    opts.recurse_untracked_dirs(true);
    opts.include_ignored(true);
    opts.recurse_ignored_dirs(true);
    opts.include_unmodified(false);
    opts.exclude_submodules(true);

    let statuses = repo.statuses(Some(&mut opts))?;
    let mut entries = Vec::new();
    for entry in statuses.iter() {
        let Some(path) = entry.path() else {
            continue;
        };
        let status = entry.status();
        if status.contains(Status::IGNORED) {
            if is_apply_artifact(path) {
                entries.push(StatusEntry {
                    path: path.to_string(),
                    removable: true,
                });
            }
            continue;
        }
        entries.push(StatusEntry {
            path: path.to_string(),
            removable: status.is_wt_new(),
        });
    }
    Ok(entries)
}

fn prune_empty_parents(root: &Path, removed: &Path) {
    let mut current = removed.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

impl Checkout for GitCheckout {
    fn root(&self) -> &Path {
        &self.root
    }

    fn reset_clean(&self) -> Result<(), CheckoutError> {
        let repo = self.repo().map_err(|e| self.reset_error(e.message()))?;
        let head = repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(|e| self.reset_error(format!("no HEAD commit: {}", e.message())))?;

        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.reset(head.as_object(), ResetType::Hard, Some(&mut checkout))
            .map_err(|e| self.reset_error(e.message()))?;

        let leftovers = self
            .leftovers(&repo)
            .map_err(|e| self.reset_error(e.message()))?;
        for rel in &leftovers {
            self.remove_leftover(rel)
                .map_err(|e| self.reset_error(format!("failed to remove {}: {}", rel, e)))?;
        }

        tracing::debug!(
            root = %self.root.display(),
            removed = leftovers.len(),
            "working tree reset to HEAD"
        );
        Ok(())
    }

    fn dirty_paths(&self) -> Result<Vec<String>, CheckoutError> {
        let repo = self.repo().map_err(|e| self.status_error(e.message()))?;
        let entries = scan(&repo).map_err(|e| self.status_error(e.message()))?;
        Ok(entries.into_iter().map(|e| e.path).collect())
    }
}
