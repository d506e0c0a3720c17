//! In-memory hunk placement.
//!
//! Placement follows `patch(1)` without fuzz: the expected lines must match
//! exactly, first at the hinted line, then at the nearest line searching
//! outward. The distance from the hint is the hunk's offset.

use crate::patch::Hunk;
use serde::{Deserialize, Serialize};

/// File text split into lines, remembering whether it ended with a newline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileContent {
    pub lines: Vec<String>,
    pub trailing_newline: bool,
}

impl FileContent {
    pub fn parse(text: &str) -> Self {
        if text.is_empty() {
            return Self {
                lines: Vec::new(),
                trailing_newline: true,
            };
        }
        let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        let trailing_newline = text.ends_with('\n');
        if trailing_newline {
            lines.pop();
        }
        Self {
            lines,
            trailing_newline,
        }
    }

    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        if self.trailing_newline && !self.lines.is_empty() {
            out.push('\n');
        }
        out
    }

    pub fn from_lines<S: AsRef<str>>(lines: &[S], trailing_newline: bool) -> Self {
        Self {
            lines: lines.iter().map(|l| l.as_ref().to_string()).collect(),
            trailing_newline,
        }
    }
}

/// Where one hunk ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum HunkResult {
    Applied { offset: isize },
    /// `attempted_index` is the zero-based line the hunk was expected at.
    Rejected { attempted_index: usize },
}

impl HunkResult {
    pub fn is_rejected(&self) -> bool {
        matches!(self, HunkResult::Rejected { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileApplication {
    pub content: FileContent,
    pub results: Vec<HunkResult>,
}

impl FileApplication {
    pub fn rejected_indices(&self) -> Vec<usize> {
        self.results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_rejected())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        !self.results.iter().any(HunkResult::is_rejected)
    }

    /// Largest displacement among applied hunks, if any hunk moved.
    pub fn max_offset(&self) -> Option<isize> {
        self.results
            .iter()
            .filter_map(|r| match r {
                HunkResult::Applied { offset } if *offset != 0 => Some(*offset),
                _ => None,
            })
            .max_by_key(|o| o.unsigned_abs())
    }
}

fn matches_at(lines: &[String], expected: &[&str], start: usize) -> bool {
    lines
        .get(start..start + expected.len())
        .is_some_and(|window| window.iter().zip(expected).all(|(a, b)| a == b))
}

/// Find `expected` in `lines` at or after `floor`, nearest to `anchor`.
pub fn locate(lines: &[String], expected: &[&str], anchor: usize, floor: usize) -> Option<usize> {
    if expected.is_empty() {
        return Some(anchor.clamp(floor.min(lines.len()), lines.len()));
    }
    if expected.len() > lines.len() {
        return None;
    }
    let max_start = lines.len() - expected.len();
    if floor > max_start {
        return None;
    }
    let anchor = anchor.clamp(floor, max_start);
    let reach = (anchor - floor).max(max_start - anchor);

    for distance in 0..=reach {
        if let Some(after) = anchor.checked_add(distance).filter(|p| *p <= max_start) {
            if matches_at(lines, expected, after) {
                return Some(after);
            }
        }
        if distance > 0 {
            if let Some(before) = anchor.checked_sub(distance).filter(|p| *p >= floor) {
                if matches_at(lines, expected, before) {
                    return Some(before);
                }
            }
        }
    }
    None
}

/// Apply hunks in order. Rejected hunks leave the content untouched; later
/// hunks still try to apply.
pub fn apply_hunks(original: &FileContent, hunks: &[Hunk]) -> FileApplication {
    let mut content = original.clone();
    let mut results = Vec::with_capacity(hunks.len());
    let mut delta: isize = 0;
    let mut floor = 0usize;

    for hunk in hunks {
        let anchor = (hunk.anchor_index() as isize + delta).max(0) as usize;
        let expected = hunk.expected();

        match locate(&content.lines, &expected, anchor, floor) {
            Some(pos) => {
                let offset = pos as isize - anchor as isize;
                let replacement: Vec<String> =
                    hunk.replacement().into_iter().map(str::to_string).collect();
                let inserted = replacement.len();
                content.lines.splice(pos..pos + expected.len(), replacement);

                delta += offset + inserted as isize - expected.len() as isize;
                floor = pos + inserted;

                if floor == content.lines.len() {
                    if hunk.new_missing_newline {
                        content.trailing_newline = false;
                    } else if hunk.old_missing_newline {
                        content.trailing_newline = true;
                    }
                }
                results.push(HunkResult::Applied { offset });
            }
            None => results.push(HunkResult::Rejected {
                attempted_index: anchor,
            }),
        }
    }

    FileApplication { content, results }
}

/// Start of the region that best resembles `expected` within `radius` lines
/// of `anchor`, comparing whitespace-trimmed lines. Ties go to the start
/// nearest the anchor.
pub fn closest_region(lines: &[String], expected: &[&str], anchor: usize, radius: usize) -> usize {
    if lines.is_empty() || expected.is_empty() {
        return anchor.min(lines.len());
    }
    let anchor = anchor.min(lines.len() - 1);
    let lo = anchor.saturating_sub(radius);
    let hi = (anchor + radius).min(lines.len() - 1);

    let score = |start: usize| -> usize {
        expected
            .iter()
            .enumerate()
            .filter(|(i, want)| {
                lines
                    .get(start + i)
                    .is_some_and(|have| have.trim() == want.trim())
            })
            .count()
    };

    let mut best = anchor;
    let mut best_score = score(anchor);
    for start in lo..=hi {
        let s = score(start);
        let closer = start.abs_diff(anchor) < best.abs_diff(anchor);
        if s > best_score || (s == best_score && closer) {
            best = start;
            best_score = s;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::Patch;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn single_hunk(text: &str) -> Hunk {
        Patch::parse(text).unwrap().files[0].hunks[0].clone()
    }

    #[test]
    fn test_file_content_round_trip() {
        for text in ["a\nb\n", "a\nb", "", "\n", "only"] {
            assert_eq!(FileContent::parse(text).render(), text, "text {:?}", text);
        }
    }

    #[test]
    fn test_locate_prefers_anchor_then_nearest() {
        let src = lines(&["x", "a", "x", "a", "x", "a"]);
        assert_eq!(locate(&src, &["a"], 3, 0), Some(3));
        assert_eq!(locate(&src, &["a"], 2, 0), Some(3));
        assert_eq!(locate(&src, &["a"], 0, 0), Some(1));
        assert_eq!(locate(&src, &["a"], 0, 4), Some(5));
        assert_eq!(locate(&src, &["b"], 0, 0), None);
    }

    #[test]
    fn test_locate_is_whitespace_exact() {
        let src = lines(&["fn main() {", "    run();", "}"]);
        assert_eq!(locate(&src, &["  run();"], 1, 0), None);
        assert_eq!(locate(&src, &["    run();"], 0, 0), Some(1));
    }

    #[test]
    fn test_apply_hunks_records_offset() {
        let hunk = single_hunk("--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n a\n-b\n+B\n");
        let original = FileContent::from_lines(&["new", "new", "a", "b", "c"], true);
        let applied = apply_hunks(&original, &[hunk]);
        assert_eq!(applied.results, vec![HunkResult::Applied { offset: 2 }]);
        assert_eq!(applied.content.lines, lines(&["new", "new", "a", "B", "c"]));
        assert_eq!(applied.max_offset(), Some(2));
    }

    #[test]
    fn test_apply_hunks_continues_past_rejection() {
        let patch = Patch::parse(
            "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-missing\n+x\n@@ -3 +3 @@\n-c\n+C\n",
        )
        .unwrap();
        let original = FileContent::from_lines(&["a", "b", "c"], true);
        let applied = apply_hunks(&original, &patch.files[0].hunks);
        assert_eq!(
            applied.results,
            vec![
                HunkResult::Rejected { attempted_index: 0 },
                HunkResult::Applied { offset: 0 }
            ]
        );
        assert_eq!(applied.rejected_indices(), vec![0]);
        assert_eq!(applied.content.lines, lines(&["a", "b", "C"]));
    }

    #[test]
    fn test_later_hunks_inherit_earlier_displacement() {
        let patch = Patch::parse(
            "--- a/f\n+++ b/f\n@@ -1 +1,3 @@\n-a\n+a\n+a2\n+a3\n@@ -3 +5 @@\n-c\n+C\n",
        )
        .unwrap();
        let original = FileContent::from_lines(&["a", "b", "c"], true);
        let applied = apply_hunks(&original, &patch.files[0].hunks);
        assert!(applied.is_clean());
        assert_eq!(applied.max_offset(), None);
        assert_eq!(
            applied.content.lines,
            lines(&["a", "a2", "a3", "b", "C"])
        );
    }

    #[test]
    fn test_missing_newline_at_eof_is_applied() {
        let hunk = single_hunk(
            "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-a\n+b\n\\ No newline at end of file\n",
        );
        let applied = apply_hunks(&FileContent::parse("a\n"), &[hunk]);
        assert_eq!(applied.content.render(), "b");
    }

    #[test]
    fn test_closest_region_finds_whitespace_drift() {
        let src = lines(&["x", "y", "\tint size = 4096;", "z"]);
        let expected = ["int size = 4096;", "z"];
        assert_eq!(closest_region(&src, &expected, 0, 10), 2);
    }

    #[test]
    fn test_closest_region_ties_go_to_anchor() {
        let src = lines(&["q", "q", "q"]);
        assert_eq!(closest_region(&src, &["nothing"], 1, 5), 1);
    }
}
