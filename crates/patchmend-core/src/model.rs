//! Values handed between the extractor, prompt builder and orchestrator.

use crate::patch::{ChangeKind, Hunk, Patch};
use serde::{Deserialize, Serialize};

/// A hunk that could not be placed, plus what the tree held where it was
/// expected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionRecord {
    /// Zero-based position of the hunk within its file section.
    pub hunk_index: usize,
    pub hunk: Hunk,
    /// One-based line where placement was attempted.
    pub attempted_line: usize,
    /// Literal lines found at that point in the working tree.
    pub found: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    AppliedClean,
    /// Every hunk applied; carries the largest displacement in lines.
    AppliedWithOffset { offset: isize },
    Failed { rejections: Vec<RejectionRecord> },
}

impl FileOutcome {
    pub fn label(&self) -> String {
        match self {
            FileOutcome::AppliedClean => "applied-clean".to_string(),
            FileOutcome::AppliedWithOffset { offset } => format!("applied-with-offset({})", offset),
            FileOutcome::Failed { rejections } => {
                format!("failed({} hunk(s) rejected)", rejections.len())
            }
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, FileOutcome::Failed { .. })
    }

    pub fn rejections(&self) -> &[RejectionRecord] {
        match self {
            FileOutcome::Failed { rejections } => rejections,
            _ => &[],
        }
    }
}

/// A bounded slice of a file, numbered from `start_line` (one-based).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentWindow {
    pub start_line: usize,
    pub lines: Vec<String>,
    pub total_lines: usize,
}

impl ContentWindow {
    pub fn end_line(&self) -> usize {
        self.start_line + self.lines.len().saturating_sub(1)
    }

    pub fn is_partial(&self) -> bool {
        self.lines.len() < self.total_lines
    }

    pub fn numbered(&self) -> String {
        let width = self.end_line().max(1).to_string().len();
        let mut out = String::new();
        for (i, line) in self.lines.iter().enumerate() {
            out.push_str(&format!(
                "{:>width$} | {}\n",
                self.start_line + i,
                line,
                width = width
            ));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentTag {
    Same,
    /// Only in what the hunk expected.
    Expected,
    /// Only in what the tree holds.
    Actual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentRow {
    pub tag: AlignmentTag,
    pub text: String,
    /// Set on a differing row whose counterpart differs only in whitespace.
    #[serde(default)]
    pub whitespace_only: bool,
}

/// Expected-versus-actual comparison for one rejected hunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HunkAlignment {
    pub hunk_index: usize,
    pub expected_line: usize,
    pub actual_line: usize,
    pub rows: Vec<AlignmentRow>,
}

impl HunkAlignment {
    pub fn differing_rows(&self) -> usize {
        self.rows
            .iter()
            .filter(|r| r.tag != AlignmentTag::Same)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub path: String,
    pub kind: ChangeKind,
    pub outcome: FileOutcome,
    /// False when the file does not exist in the tree.
    pub exists: bool,
    pub window: ContentWindow,
    #[serde(default)]
    pub alignments: Vec<HunkAlignment>,
    /// Why the file was refused as a whole, when it was.
    #[serde(default)]
    pub note: Option<String>,
}

/// Everything the oracle sees for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptContext {
    pub project: String,
    pub change_request: String,
    pub patch_name: String,
    pub original_patch: String,
    /// Every file the patch names, clean ones included.
    pub files: Vec<FileState>,
    pub current_error: Option<String>,
    /// Older diagnostics, oldest first. Empty unless retention depth exceeds one.
    #[serde(default)]
    pub earlier_errors: Vec<String>,
    pub attempt: u32,
    pub max_attempts: u32,
}

impl AttemptContext {
    pub fn failed_files(&self) -> Vec<&FileState> {
        self.files
            .iter()
            .filter(|f| f.outcome.is_failed())
            .collect()
    }

    pub fn clean_files(&self) -> Vec<&FileState> {
        self.files
            .iter()
            .filter(|f| !f.outcome.is_failed())
            .collect()
    }

    pub fn has_rejections(&self) -> bool {
        self.files.iter().any(|f| f.outcome.is_failed())
    }

    pub fn expected_files(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    pub fn rejection_count(&self) -> usize {
        self.files
            .iter()
            .map(|f| f.outcome.rejections().len())
            .sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub requested_max: u32,
}

/// A proposed replacement patch. `patch_text` is the normalised rendering of
/// `patch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFix {
    pub patch_text: String,
    pub patch: Patch,
    pub rationale: Option<String>,
    pub usage: Option<OracleUsage>,
}

impl CandidateFix {
    pub fn new(patch: Patch, rationale: Option<String>, usage: Option<OracleUsage>) -> Self {
        Self {
            patch_text: patch.render(),
            patch,
            rationale,
            usage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptResult {
    Succeeded,
    ApplyFailed {
        diagnostic: String,
        failing_files: Vec<String>,
    },
    BuildFailed {
        diagnostic: String,
    },
    SemanticMismatch {
        diagnostic: String,
    },
    /// The oracle produced no usable candidate (quota, truncation, parse).
    OracleFailed {
        diagnostic: String,
        truncated: bool,
    },
    /// The failure could not be reproduced on the reset tree.
    ExtractionFailed {
        diagnostic: String,
    },
}

impl AttemptResult {
    pub fn kind(&self) -> &'static str {
        match self {
            AttemptResult::Succeeded => "succeeded",
            AttemptResult::ApplyFailed { .. } => "apply-failed",
            AttemptResult::BuildFailed { .. } => "build-failed",
            AttemptResult::SemanticMismatch { .. } => "semantic-mismatch",
            AttemptResult::OracleFailed { .. } => "oracle-failed",
            AttemptResult::ExtractionFailed { .. } => "extraction-failed",
        }
    }

    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            AttemptResult::Succeeded => None,
            AttemptResult::ApplyFailed { diagnostic, .. }
            | AttemptResult::BuildFailed { diagnostic }
            | AttemptResult::SemanticMismatch { diagnostic }
            | AttemptResult::OracleFailed { diagnostic, .. }
            | AttemptResult::ExtractionFailed { diagnostic } => Some(diagnostic),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AttemptResult::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(path: &str, outcome: FileOutcome) -> FileState {
        FileState {
            path: path.to_string(),
            kind: ChangeKind::Modify,
            outcome,
            exists: true,
            window: ContentWindow::default(),
            alignments: Vec::new(),
            note: None,
        }
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(FileOutcome::AppliedClean.label(), "applied-clean");
        assert_eq!(
            FileOutcome::AppliedWithOffset { offset: -3 }.label(),
            "applied-with-offset(-3)"
        );
        assert_eq!(
            FileOutcome::Failed { rejections: vec![] }.label(),
            "failed(0 hunk(s) rejected)"
        );
    }

    #[test]
    fn test_window_numbering_is_right_aligned() {
        let window = ContentWindow {
            start_line: 9,
            lines: vec!["a".to_string(), "b".to_string()],
            total_lines: 40,
        };
        assert_eq!(window.numbered(), " 9 | a\n10 | b\n");
        assert!(window.is_partial());
        assert_eq!(window.end_line(), 10);
    }

    #[test]
    fn test_context_partitions_clean_and_failed_files() {
        let ctx = AttemptContext {
            project: "demo".to_string(),
            change_request: "42".to_string(),
            patch_name: "0001-x.patch".to_string(),
            original_patch: String::new(),
            files: vec![
                state("a.c", FileOutcome::AppliedClean),
                state("b.c", FileOutcome::Failed { rejections: vec![] }),
            ],
            current_error: None,
            earlier_errors: Vec::new(),
            attempt: 1,
            max_attempts: 3,
        };
        assert!(ctx.has_rejections());
        assert_eq!(ctx.failed_files()[0].path, "b.c");
        assert_eq!(ctx.clean_files()[0].path, "a.c");
        assert_eq!(ctx.expected_files(), vec!["a.c", "b.c"]);
    }

    #[test]
    fn test_attempt_result_serializes_with_tag() {
        let result = AttemptResult::BuildFailed {
            diagnostic: "error: missing ;".to_string(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["result"], "build_failed");
        assert_eq!(result.kind(), "build-failed");
        assert_eq!(result.diagnostic(), Some("error: missing ;"));
        assert!(AttemptResult::Succeeded.diagnostic().is_none());
    }
}
