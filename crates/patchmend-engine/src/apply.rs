//! Patch application against a tree on disk.
//!
//! Every file is computed in memory first. Strict mode writes nothing unless
//! every hunk of every file applies; permissive mode writes whatever applied
//! and leaves a `<file>.rej` beside each file with rejected hunks.

use patchmend_adapters::util::resolve_repo_path_allow_new;
use patchmend_core::matcher::{apply_hunks, FileContent, HunkResult};
use patchmend_core::{ChangeKind, FileRejection, Patch, PatchApplyError, PatchFile};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const REJECT_SUFFIX: &str = ".rej";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    Permissive,
    Strict,
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Rejected(#[from] PatchApplyError),
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct FileApplyReport {
    pub path: String,
    pub kind: ChangeKind,
    /// Content the hunks were matched against, if the file existed.
    pub before: Option<FileContent>,
    /// One entry per hunk, in patch order.
    pub results: Vec<HunkResult>,
    /// Set when the file was refused as a whole.
    pub reason: Option<String>,
}

impl FileApplyReport {
    pub fn rejected_hunks(&self) -> Vec<usize> {
        self.results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_rejected())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.reason.is_none() && !self.results.iter().any(HunkResult::is_rejected)
    }

    pub fn max_offset(&self) -> Option<isize> {
        self.results
            .iter()
            .filter_map(|r| match r {
                HunkResult::Applied { offset } if *offset != 0 => Some(*offset),
                _ => None,
            })
            .max_by_key(|o| o.unsigned_abs())
    }

    fn rejection(&self) -> Option<FileRejection> {
        if self.is_clean() {
            return None;
        }
        Some(FileRejection {
            path: self.path.clone(),
            hunks: self.rejected_hunks(),
            reason: self.reason.clone(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub files: Vec<FileApplyReport>,
    /// Absolute paths of files this apply brought into existence, `.rej`
    /// files included.
    pub created: Vec<PathBuf>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.files.iter().all(FileApplyReport::is_clean)
    }

    pub fn rejections(&self) -> Vec<FileRejection> {
        self.files
            .iter()
            .filter_map(FileApplyReport::rejection)
            .collect()
    }

    pub fn rejected_hunk_count(&self) -> usize {
        self.files.iter().map(|f| f.rejected_hunks().len()).sum()
    }
}

/// Pending writes, keyed by absolute path. `None` removes the file.
struct Stage<'a> {
    root: &'a Path,
    order: Vec<PathBuf>,
    pending: HashMap<PathBuf, Option<String>>,
}

impl<'a> Stage<'a> {
    fn new(root: &'a Path) -> Self {
        Self {
            root,
            order: Vec::new(),
            pending: HashMap::new(),
        }
    }

    fn guard(&self, rel: &str) -> Result<PathBuf, String> {
        resolve_repo_path_allow_new(self.root, Path::new(rel)).map(|p| p.absolute)
    }

    /// Current content, seeing earlier staged writes first.
    fn read(&self, abs: &Path) -> Result<Option<String>, String> {
        if let Some(staged) = self.pending.get(abs) {
            return Ok(staged.clone());
        }
        match fs::read(abs) {
            Ok(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| "file is not valid UTF-8".to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(format!("failed to read file: {}", e)),
        }
    }

    fn put(&mut self, abs: PathBuf, content: Option<String>) {
        if !self.pending.contains_key(&abs) {
            self.order.push(abs.clone());
        }
        self.pending.insert(abs, content);
    }

    fn plan(&mut self, file: &PatchFile) -> FileApplyReport {
        let refuse = |before: Option<FileContent>, reason: String| FileApplyReport {
            path: file.path.clone(),
            kind: file.kind.clone(),
            before,
            results: file
                .hunks
                .iter()
                .map(|h| HunkResult::Rejected {
                    attempted_index: h.anchor_index(),
                })
                .collect(),
            reason: Some(reason),
        };
        let report = |before: Option<FileContent>, results: Vec<HunkResult>| FileApplyReport {
            path: file.path.clone(),
            kind: file.kind.clone(),
            before,
            results,
            reason: None,
        };

        let target = match self.guard(&file.path) {
            Ok(target) => target,
            Err(e) => return refuse(None, e),
        };
        let existing = match self.read(&target) {
            Ok(existing) => existing,
            Err(e) => return refuse(None, e),
        };

        match &file.kind {
            ChangeKind::Modify => {
                let Some(text) = existing else {
                    return refuse(None, "file not found".to_string());
                };
                let before = FileContent::parse(&text);
                let applied = apply_hunks(&before, &file.hunks);
                if applied.results.iter().any(|r| !r.is_rejected()) {
                    self.put(target, Some(applied.content.render()));
                }
                report(Some(before), applied.results)
            }
            ChangeKind::Add => {
                if let Some(text) = existing {
                    return refuse(
                        Some(FileContent::parse(&text)),
                        "file already exists".to_string(),
                    );
                }
                let applied = apply_hunks(&FileContent::parse(""), &file.hunks);
                self.put(target, Some(applied.content.render()));
                report(None, applied.results)
            }
            ChangeKind::Delete => {
                let Some(text) = existing else {
                    return refuse(None, "file not found".to_string());
                };
                let before = FileContent::parse(&text);
                let applied = apply_hunks(&before, &file.hunks);
                if !applied.is_clean() {
                    return report(Some(before), applied.results);
                }
                if !applied.content.lines.is_empty() {
                    return refuse(
                        Some(before),
                        "file content does not match the deletion".to_string(),
                    );
                }
                self.put(target, None);
                report(Some(before), applied.results)
            }
            ChangeKind::Rename { from } => {
                let source = match self.guard(from) {
                    Ok(source) => source,
                    Err(e) => return refuse(None, e),
                };
                let text = match self.read(&source) {
                    Ok(Some(text)) => text,
                    Ok(None) => return refuse(None, format!("rename source {} not found", from)),
                    Err(e) => return refuse(None, e),
                };
                let before = FileContent::parse(&text);
                if source != target && existing.is_some() {
                    return refuse(Some(before), "rename target already exists".to_string());
                }
                let applied = apply_hunks(&before, &file.hunks);
                self.put(source, None);
                self.put(target, Some(applied.content.render()));
                report(Some(before), applied.results)
            }
        }
    }

    /// Write the staged files, returning the ones that did not exist before.
    fn commit(self) -> Result<Vec<PathBuf>, ApplyError> {
        let io_error = |path: &Path, source: std::io::Error| ApplyError::Io {
            path: path.display().to_string(),
            source,
        };
        let mut created = Vec::new();
        for abs in &self.order {
            match self.pending.get(abs) {
                Some(Some(content)) => {
                    if let Some(parent) = abs.parent() {
                        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
                    }
                    if fs::symlink_metadata(abs).is_err() {
                        created.push(abs.clone());
                    }
                    fs::write(abs, content).map_err(|e| io_error(abs, e))?;
                }
                Some(None) => match fs::remove_file(abs) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_error(abs, e)),
                },
                None => {}
            }
        }
        Ok(created)
    }
}

pub fn apply_patch(root: &Path, patch: &Patch, mode: ApplyMode) -> Result<ApplyReport, ApplyError> {
    let mut stage = Stage::new(root);
    let files = patch.files.iter().map(|file| stage.plan(file)).collect();
    let mut report = ApplyReport {
        files,
        created: Vec::new(),
    };

    if mode == ApplyMode::Strict && !report.is_clean() {
        return Err(PatchApplyError {
            files: report.rejections(),
        }
        .into());
    }

    report.created = stage.commit()?;
    if mode == ApplyMode::Permissive {
        let rejects = write_rejects(root, patch, &report)?;
        report.created.extend(rejects);
    }

    tracing::debug!(
        ?mode,
        files = report.files.len(),
        rejected_hunks = report.rejected_hunk_count(),
        "patch applied"
    );
    Ok(report)
}

/// Returns the `.rej` files that were newly created.
fn write_rejects(
    root: &Path,
    patch: &Patch,
    report: &ApplyReport,
) -> Result<Vec<PathBuf>, ApplyError> {
    let mut created = Vec::new();
    for (file, file_report) in patch.files.iter().zip(&report.files) {
        let rejected = file_report.rejected_hunks();
        if rejected.is_empty() {
            continue;
        }
        let Ok(target) = resolve_repo_path_allow_new(root, Path::new(&file.path)) else {
            continue;
        };

        let mut content = format!(
            "--- a/{}\n+++ b/{}\n",
            file.source_path(),
            file.path
        );
        for idx in rejected {
            if let Some(hunk) = file.hunks.get(idx) {
                hunk.render_into(&mut content);
            }
        }

        let mut rej_path = target.absolute.into_os_string();
        rej_path.push(REJECT_SUFFIX);
        let rej_path = PathBuf::from(rej_path);
        if let Some(parent) = rej_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ApplyError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        let is_new = fs::symlink_metadata(&rej_path).is_err();
        fs::write(&rej_path, content).map_err(|e| ApplyError::Io {
            path: rej_path.display().to_string(),
            source: e,
        })?;
        if is_new {
            created.push(rej_path);
        }
    }
    Ok(created)
}
