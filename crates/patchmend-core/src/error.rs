//! Error taxonomy shared by every patchmend crate.
//!
//! Everything except [`FixError`] is recoverable: the orchestrator turns it
//! into a consumed attempt.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchParseError {
    #[error("malformed hunk header at line {line}: {text}")]
    BadHunkHeader { line: usize, text: String },
    #[error("hunk at line {line} appears before any file header")]
    OrphanHunk { line: usize },
    #[error("hunks {first} and {second} of {path} overlap in the source file")]
    OverlappingHunks {
        path: String,
        first: usize,
        second: usize,
    },
    #[error("binary patch for {0} cannot be applied")]
    Binary(String),
    #[error("no file sections found")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckoutError {
    #[error("failed to reset working tree at {root}: {message}")]
    Reset { root: String, message: String },
    #[error("failed to read working tree status at {root}: {message}")]
    Status { root: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("working tree is still dirty after reset: {}", .0.join(", "))]
    DirtyTree(Vec<String>),
    #[error("patch was expected to fail but applied without rejections (stale working tree)")]
    NoRejections,
    #[error(transparent)]
    Checkout(#[from] CheckoutError),
    #[error(transparent)]
    Parse(#[from] PatchParseError),
    #[error("permissive apply failed: {0}")]
    Apply(String),
    #[error("accepted patch {name} no longer applies on the reset tree: {message}")]
    Baseline { name: String, message: String },
}

impl ExtractionError {
    /// The tree could not be brought to a known state; retrying would read
    /// garbage.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExtractionError::DirtyTree(_)
                | ExtractionError::Checkout(_)
                | ExtractionError::Baseline { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    #[error("oracle quota exhausted after {attempts} attempt(s): {message}")]
    Quota { attempts: u32, message: String },
    #[error(
        "oracle output truncated (requested {requested} tokens, reported {}, {found_files}/{expected_files} files)",
        .reported.map(|r| r.to_string()).unwrap_or_else(|| "n/a".to_string())
    )]
    Truncated {
        requested: u32,
        reported: Option<u32>,
        expected_files: usize,
        found_files: usize,
    },
    #[error("oracle response is not a usable diff: {0}")]
    Parse(String),
    #[error("oracle request failed: {0}")]
    Transport(String),
    #[error("oracle configuration rejected: {0}")]
    Config(String),
}

impl OracleError {
    /// Configuration errors (bad credentials, unknown model) end the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OracleError::Config(_))
    }

    pub fn is_truncation(&self) -> bool {
        matches!(self, OracleError::Truncated { .. })
    }
}

/// One file a strict apply refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRejection {
    pub path: String,
    /// Zero-based indices of the hunks that did not apply.
    pub hunks: Vec<usize>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("strict apply rejected {} file(s): {}", .files.len(), describe_rejections(.files))]
pub struct PatchApplyError {
    pub files: Vec<FileRejection>,
}

impl PatchApplyError {
    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }
}

fn describe_rejections(files: &[FileRejection]) -> String {
    files
        .iter()
        .map(|f| {
            let hunks = f
                .hunks
                .iter()
                .map(|h| format!("#{}", h + 1))
                .collect::<Vec<_>>()
                .join(",");
            match &f.reason {
                Some(reason) => format!("{} ({})", f.path, reason),
                None => format!("{} hunks {}", f.path, hunks),
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("build check failed: {0}")]
    Build(String),
    #[error("semantic check failed: {0}")]
    Semantic(String),
}

/// Errors that end a run immediately instead of consuming an attempt.
#[derive(Debug, Error)]
pub enum FixError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("working tree could not be returned to clean: {0}")]
    Revert(String),
    #[error("failed to persist {path}: {message}")]
    Storage { path: String, message: String },
    #[error("patch {name} was accepted earlier but no longer applies: {message}")]
    Baseline { name: String, message: String },
    #[error("another patchmend run holds the lock for {0}")]
    Locked(String),
}
