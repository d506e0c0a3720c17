//! In-process doubles for unit tests.

use patchmend_core::{Checkout, CheckoutError};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A checkout whose committed state is a snapshot of the directory taken at
/// construction.
pub(crate) struct SnapshotCheckout {
    root: PathBuf,
    committed: BTreeMap<PathBuf, Vec<u8>>,
    pub(crate) resets: AtomicUsize,
}

fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, out);
        } else if let Ok(bytes) = fs::read(&path) {
            out.insert(path.strip_prefix(root).unwrap().to_path_buf(), bytes);
        }
    }
}

fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

impl SnapshotCheckout {
    pub(crate) fn new(root: &Path) -> Self {
        let root = root.canonicalize().unwrap();
        Self {
            committed: snapshot(&root),
            root,
            resets: AtomicUsize::new(0),
        }
    }
}

impl Checkout for SnapshotCheckout {
    fn root(&self) -> &Path {
        &self.root
    }

    fn reset_clean(&self) -> Result<(), CheckoutError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        for rel in snapshot(&self.root).keys() {
            if !self.committed.contains_key(rel) {
                fs::remove_file(self.root.join(rel)).unwrap();
            }
        }
        for (rel, bytes) in &self.committed {
            let path = self.root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, bytes).unwrap();
        }
        Ok(())
    }

    fn dirty_paths(&self) -> Result<Vec<String>, CheckoutError> {
        let current = snapshot(&self.root);
        let mut dirty: Vec<String> = current
            .iter()
            .filter(|(rel, bytes)| self.committed.get(*rel) != Some(*bytes))
            .map(|(rel, _)| rel.display().to_string())
            .collect();
        dirty.extend(
            self.committed
                .keys()
                .filter(|rel| !current.contains_key(*rel))
                .map(|rel| rel.display().to_string()),
        );
        Ok(dirty)
    }
}

pub(crate) fn tree(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (path, content) in files {
        let full = dir.path().join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }
    dir
}
