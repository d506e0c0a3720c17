//! Context extraction.
//!
//! Reproduces a failure on a freshly reverted tree and describes it: per-file
//! outcomes for every file the patch names, a bounded window of each file, and
//! an expected-versus-actual alignment for every rejected hunk. The tree is
//! reverted again before returning, so `.rej` files written along the way are
//! only a cache of what the returned context says.

use crate::apply::{ApplyMode, FileApplyReport};
use crate::workspace::Workspace;
use patchmend_adapters::ContextSettings;
use patchmend_core::matcher::{closest_region, HunkResult};
use patchmend_core::{
    AlignmentRow, AlignmentTag, AttemptContext, ContentWindow, ExtractionError, FileOutcome,
    FileState, HunkAlignment, Patch, PatchFile, RejectionRecord,
};
use similar::{ChangeTag, TextDiff};
use std::collections::HashSet;

pub struct ExtractionInput<'a> {
    pub project: &'a str,
    pub change_request: &'a str,
    pub patch_name: &'a str,
    pub patch_text: &'a str,
    pub patch: &'a Patch,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Set once this patch has been seen to fail; a clean apply then means
    /// the tree is not what we think it is.
    pub expect_failure: bool,
}

#[derive(Debug, Clone)]
pub struct ContextExtractor {
    settings: ContextSettings,
}

/// A line range in the pre-apply file, zero-based and half-open.
#[derive(Debug, Clone, Copy)]
struct Focus {
    start: usize,
    end: usize,
}

impl ContextExtractor {
    pub fn new(settings: ContextSettings) -> Self {
        Self { settings }
    }

    pub fn extract(
        &self,
        workspace: &Workspace<'_>,
        input: &ExtractionInput<'_>,
    ) -> Result<AttemptContext, ExtractionError> {
        workspace.revert()?;

        let applied = workspace.apply(input.patch, ApplyMode::Permissive);
        let report = match applied {
            Ok(report) => report,
            Err(e) => {
                workspace.revert()?;
                return Err(ExtractionError::Apply(e.to_string()));
            }
        };

        let files: Vec<FileState> = input
            .patch
            .files
            .iter()
            .zip(&report.files)
            .map(|(file, file_report)| self.file_state(file, file_report))
            .collect();

        workspace.revert()?;

        let context = AttemptContext {
            project: input.project.to_string(),
            change_request: input.change_request.to_string(),
            patch_name: input.patch_name.to_string(),
            original_patch: input.patch_text.to_string(),
            files,
            current_error: None,
            earlier_errors: Vec::new(),
            attempt: input.attempt,
            max_attempts: input.max_attempts,
        };

        if input.expect_failure && !context.has_rejections() {
            return Err(ExtractionError::NoRejections);
        }

        tracing::debug!(
            patch = input.patch_name,
            files = context.files.len(),
            failed = context.failed_files().len(),
            rejected_hunks = context.rejection_count(),
            "context extracted"
        );
        Ok(context)
    }

    fn file_state(&self, file: &PatchFile, report: &FileApplyReport) -> FileState {
        let lines: &[String] = report
            .before
            .as_ref()
            .map(|c| c.lines.as_slice())
            .unwrap_or(&[]);

        let mut rejections = Vec::new();
        let mut alignments = Vec::new();
        let mut applied_focus = Vec::new();
        let mut failed_focus = Vec::new();
        // Sum of the displacements of earlier applied hunks, in pre-apply lines.
        let mut shift: isize = 0;

        for (idx, (hunk, result)) in file.hunks.iter().zip(&report.results).enumerate() {
            let hinted = (hunk.anchor_index() as isize + shift).max(0) as usize;
            let expected = hunk.expected();
            match result {
                HunkResult::Applied { offset } => {
                    shift += offset;
                    let start = (hinted as isize + offset).max(0) as usize;
                    applied_focus.push(Focus {
                        start,
                        end: start + hunk.old_len.max(1),
                    });
                }
                HunkResult::Rejected { .. } => {
                    let attempted = hinted.min(lines.len());
                    let found_end = (attempted + expected.len().max(1)).min(lines.len());
                    rejections.push(RejectionRecord {
                        hunk_index: idx,
                        hunk: hunk.clone(),
                        attempted_line: attempted + 1,
                        found: lines[attempted..found_end].to_vec(),
                    });

                    if expected.is_empty() || lines.is_empty() {
                        failed_focus.push(Focus {
                            start: attempted,
                            end: attempted + 1,
                        });
                        continue;
                    }
                    let region =
                        closest_region(lines, &expected, attempted, self.settings.alignment_radius);
                    let region_end = (region + expected.len()).min(lines.len());
                    let actual: Vec<&str> = lines[region..region_end]
                        .iter()
                        .map(String::as_str)
                        .collect();
                    alignments.push(HunkAlignment {
                        hunk_index: idx,
                        expected_line: attempted + 1,
                        actual_line: region + 1,
                        rows: align(&expected, &actual),
                    });
                    failed_focus.push(Focus {
                        start: region,
                        end: region_end.max(region + 1),
                    });
                }
            }
        }

        let outcome = if !report.is_clean() {
            FileOutcome::Failed { rejections }
        } else if let Some(offset) = report.max_offset() {
            FileOutcome::AppliedWithOffset { offset }
        } else {
            FileOutcome::AppliedClean
        };

        let focus = if failed_focus.is_empty() {
            applied_focus
        } else {
            failed_focus
        };

        FileState {
            path: file.path.clone(),
            kind: file.kind.clone(),
            outcome,
            exists: report.before.is_some(),
            window: self.window(lines, &focus),
            alignments,
            note: report.reason.clone(),
        }
    }

    /// Lines around the focus ranges, capped at `max_window_lines` and
    /// centred on the first range when the union is too wide.
    fn window(&self, lines: &[String], focus: &[Focus]) -> ContentWindow {
        let total = lines.len();
        if total == 0 {
            return ContentWindow::default();
        }
        let radius = self.settings.window_radius;
        let max_lines = self.settings.max_window_lines.max(1);

        let (first_start, first_end) = focus
            .first()
            .map(|f| (f.start, f.end))
            .unwrap_or((0, 1));
        let min_start = focus.iter().map(|f| f.start).min().unwrap_or(first_start);
        let max_end = focus.iter().map(|f| f.end).max().unwrap_or(first_end);

        let mut lo = min_start.saturating_sub(radius).min(total - 1);
        let mut hi = (max_end + radius).min(total);
        if hi - lo > max_lines {
            lo = first_start.saturating_sub(radius).min(total - 1);
            hi = (lo + max_lines).min(total);
        }
        let hi = hi.max(lo + 1);

        ContentWindow {
            start_line: lo + 1,
            lines: lines[lo..hi].to_vec(),
            total_lines: total,
        }
    }
}

fn squash(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Line diff of what a hunk expected against what the tree holds.
fn align(expected: &[&str], actual: &[&str]) -> Vec<AlignmentRow> {
    let diff = TextDiff::from_slices(expected, actual);
    let mut rows: Vec<AlignmentRow> = diff
        .iter_all_changes()
        .map(|change| AlignmentRow {
            tag: match change.tag() {
                ChangeTag::Equal => AlignmentTag::Same,
                ChangeTag::Delete => AlignmentTag::Expected,
                ChangeTag::Insert => AlignmentTag::Actual,
            },
            text: change.value().to_string(),
            whitespace_only: false,
        })
        .collect();

    let squashed_of = |tag: AlignmentTag| -> HashSet<String> {
        rows.iter()
            .filter(|r| r.tag == tag)
            .map(|r| squash(&r.text))
            .collect()
    };
    let expected_only = squashed_of(AlignmentTag::Expected);
    let actual_only = squashed_of(AlignmentTag::Actual);

    for row in &mut rows {
        let counterpart = match row.tag {
            AlignmentTag::Expected => &actual_only,
            AlignmentTag::Actual => &expected_only,
            AlignmentTag::Same => continue,
        };
        row.whitespace_only = counterpart.contains(&squash(&row.text));
    }
    rows
}
