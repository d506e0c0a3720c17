//! The working tree a run owns, plus the patches already accepted on top of
//! it.

use crate::apply::{apply_patch, ApplyError, ApplyMode, ApplyReport};
use patchmend_core::{Checkout, CheckoutError, ExtractionError, FixError, Patch};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RevertError {
    #[error(transparent)]
    Checkout(#[from] CheckoutError),
    #[error("working tree is still dirty after reset: {}", .0.join(", "))]
    Dirty(Vec<String>),
    #[error("accepted patch {name} no longer applies: {message}")]
    Baseline { name: String, message: String },
}

impl From<RevertError> for FixError {
    fn from(err: RevertError) -> Self {
        match err {
            RevertError::Baseline { name, message } => FixError::Baseline { name, message },
            other => FixError::Revert(other.to_string()),
        }
    }
}

impl From<RevertError> for ExtractionError {
    fn from(err: RevertError) -> Self {
        match err {
            RevertError::Checkout(e) => ExtractionError::Checkout(e),
            RevertError::Dirty(paths) => ExtractionError::DirtyTree(paths),
            RevertError::Baseline { name, message } => ExtractionError::Baseline { name, message },
        }
    }
}

#[derive(Debug, Clone)]
pub struct AcceptedPatch {
    pub name: String,
    pub patch: Patch,
}

pub struct Workspace<'a> {
    checkout: &'a dyn Checkout,
    baseline: Vec<AcceptedPatch>,
    /// Files applies created since the last reset. A checkout reset does not
    /// see new files under ignored paths, so these are removed explicitly.
    created: Mutex<Vec<PathBuf>>,
}

impl<'a> Workspace<'a> {
    pub fn new(checkout: &'a dyn Checkout) -> Self {
        Self {
            checkout,
            baseline: Vec::new(),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        self.checkout.root()
    }

    pub fn baseline(&self) -> &[AcceptedPatch] {
        &self.baseline
    }

    pub fn accept(&mut self, name: impl Into<String>, patch: Patch) {
        self.baseline.push(AcceptedPatch {
            name: name.into(),
            patch,
        });
    }

    /// Apply `patch` to the tree, remembering every file it creates.
    pub fn apply(&self, patch: &Patch, mode: ApplyMode) -> Result<ApplyReport, ApplyError> {
        let report = apply_patch(self.root(), patch, mode)?;
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(report.created.iter().cloned());
        Ok(report)
    }

    /// Files created by applies and not yet removed by a reset.
    pub fn created(&self) -> Vec<PathBuf> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove created files. Runs before the checkout reset, which restores
    /// any of them that HEAD tracks.
    fn remove_created(&self) -> Result<(), RevertError> {
        let mut created = self.created.lock().unwrap_or_else(PoisonError::into_inner);
        let root = self.root().to_path_buf();
        while let Some(path) = created.pop() {
            match fs::remove_file(&path) {
                Ok(()) => prune_empty_parents(&root, &path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    let message = format!("failed to remove {}: {}", path.display(), e);
                    created.push(path);
                    return Err(CheckoutError::Reset {
                        root: root.display().to_string(),
                        message,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Reset to the committed state and check nothing survived.
    pub fn reset(&self) -> Result<(), RevertError> {
        self.remove_created()?;
        self.checkout.reset_clean()?;
        let dirty = self.checkout.dirty_paths()?;
        if !dirty.is_empty() {
            return Err(RevertError::Dirty(dirty));
        }
        Ok(())
    }

    /// Reset, then strictly re-apply every accepted patch in order.
    pub fn revert(&self) -> Result<(), RevertError> {
        self.reset()?;
        for accepted in &self.baseline {
            self.apply(&accepted.patch, ApplyMode::Strict)
                .map_err(|e| RevertError::Baseline {
                    name: accepted.name.clone(),
                    message: e.to_string(),
                })?;
        }
        tracing::debug!(baseline = self.baseline.len(), "working tree reverted");
        Ok(())
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{Repository, Signature};
    use patchmend_adapters::GitCheckout;

    const SOURCE: &str = "int a(void)\n{\n\treturn 1;\n}\n";

    /// Adds `vendor/lib.h` (ignored) and edits `src/a.c`.
    fn vendoring_patch(context: &str) -> Patch {
        Patch::parse(&format!(
            "--- /dev/null\n+++ b/vendor/lib.h\n@@ -0,0 +1 @@\n+int lib(void);\n\
             --- a/src/a.c\n+++ b/src/a.c\n@@ -1,4 +1,5 @@\n {}\n {{\n+\tlib();\n \treturn 1;\n }}\n",
            context
        ))
        .unwrap()
    }

    fn repo_ignoring_vendor() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join(".gitignore"), "vendor/\n").unwrap();
        fs::write(dir.path().join("src/a.c"), SOURCE).unwrap();

        let mut index = repo.index().unwrap();
        index.add_path(Path::new(".gitignore")).unwrap();
        index.add_path(Path::new("src/a.c")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Test User", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();
        dir
    }

    #[test]
    fn test_reset_removes_files_added_under_ignored_paths() {
        let dir = repo_ignoring_vendor();
        let checkout = GitCheckout::open(dir.path()).unwrap();
        let workspace = Workspace::new(&checkout);

        let report = workspace
            .apply(&vendoring_patch("int a_old(void)"), ApplyMode::Permissive)
            .unwrap();
        assert!(!report.is_clean());
        assert!(checkout.root().join("vendor/lib.h").exists());

        workspace.reset().unwrap();
        assert!(!checkout.root().join("vendor").exists());
        assert!(workspace.created().is_empty());
        assert!(checkout.dirty_paths().unwrap().is_empty());
    }

    #[test]
    fn test_failed_attempt_leaves_no_residue_for_the_next() {
        let dir = repo_ignoring_vendor();
        let checkout = GitCheckout::open(dir.path()).unwrap();
        let workspace = Workspace::new(&checkout);

        // Extraction of the stale patch writes the new header.
        workspace
            .apply(&vendoring_patch("int a_old(void)"), ApplyMode::Permissive)
            .unwrap();
        workspace.revert().unwrap();

        // Re-extraction sees the same failure, not "file already exists".
        let again = workspace
            .apply(&vendoring_patch("int a_old(void)"), ApplyMode::Permissive)
            .unwrap();
        assert!(again.files[0].is_clean());
        workspace.revert().unwrap();

        let fixed = workspace
            .apply(&vendoring_patch("int a(void)"), ApplyMode::Strict)
            .unwrap();
        assert!(fixed.is_clean());
        let header = checkout.root().join("vendor/lib.h");
        assert_eq!(fs::read_to_string(header).unwrap(), "int lib(void);\n");
    }

    #[test]
    fn test_baseline_files_are_recreated_on_revert() {
        let dir = repo_ignoring_vendor();
        let checkout = GitCheckout::open(dir.path()).unwrap();
        let mut workspace = Workspace::new(&checkout);
        workspace.accept("0001-vendor.patch", vendoring_patch("int a(void)"));

        workspace.revert().unwrap();
        workspace.revert().unwrap();
        assert!(checkout.root().join("vendor/lib.h").exists());

        workspace.reset().unwrap();
        assert!(!checkout.root().join("vendor/lib.h").exists());
    }
}
