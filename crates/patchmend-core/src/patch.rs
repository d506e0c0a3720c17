//! Unified diff model.
//!
//! Parses `git format-patch`, `git diff` and plain `diff -u` output into
//! per-file hunks, and renders a parsed patch back to text with recomputed
//! hunk counts. Lines keep any `\r`, so CRLF files round-trip.

use crate::error::PatchParseError;
use serde::{Deserialize, Serialize};

pub const DEV_NULL: &str = "/dev/null";
pub const OLD_FILE_PREFIX: &str = "--- ";
pub const NEW_FILE_PREFIX: &str = "+++ ";
pub const HUNK_HEADER_PREFIX: &str = "@@";
const GIT_DIFF_PREFIX: &str = "diff --git ";
const NO_NEWLINE_MARKER: &str = "\\ No newline at end of file";
const SIGNATURE_SEPARATOR: &str = "-- ";

const EXTENDED_HEADER_PREFIXES: &[&str] = &[
    "index ",
    "new file mode",
    "deleted file mode",
    "old mode",
    "new mode",
    "similarity index",
    "dissimilarity index",
    "rename from ",
    "rename to ",
    "copy from ",
    "copy to ",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    Modify,
    Add,
    Delete,
    Rename { from: String },
}

impl ChangeKind {
    pub fn label(&self) -> &'static str {
        match self {
            ChangeKind::Modify => "modify",
            ChangeKind::Add => "add",
            ChangeKind::Delete => "delete",
            ChangeKind::Rename { .. } => "rename",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HunkLine {
    Context(String),
    Add(String),
    Remove(String),
}

impl HunkLine {
    pub fn text(&self) -> &str {
        match self {
            HunkLine::Context(t) | HunkLine::Add(t) | HunkLine::Remove(t) => t,
        }
    }

    fn prefix(&self) -> char {
        match self {
            HunkLine::Context(_) => ' ',
            HunkLine::Add(_) => '+',
            HunkLine::Remove(_) => '-',
        }
    }

    fn in_source(&self) -> bool {
        !matches!(self, HunkLine::Add(_))
    }

    fn in_target(&self) -> bool {
        !matches!(self, HunkLine::Remove(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    /// Text after the closing `@@` (usually the enclosing function).
    #[serde(default)]
    pub section: String,
    pub lines: Vec<HunkLine>,
    #[serde(default)]
    pub old_missing_newline: bool,
    #[serde(default)]
    pub new_missing_newline: bool,
}

impl Hunk {
    /// Lines the hunk expects to find: context plus removals, in order.
    pub fn expected(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| l.in_source())
            .map(HunkLine::text)
            .collect()
    }

    /// Lines the hunk leaves behind: context plus additions, in order.
    pub fn replacement(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| l.in_target())
            .map(HunkLine::text)
            .collect()
    }

    /// Zero-based index where the expected lines start in the source file.
    pub fn anchor_index(&self) -> usize {
        if self.old_len == 0 {
            self.old_start
        } else {
            self.old_start.saturating_sub(1)
        }
    }

    pub fn recount(&mut self) {
        self.old_len = self.lines.iter().filter(|l| l.in_source()).count();
        self.new_len = self.lines.iter().filter(|l| l.in_target()).count();
    }

    pub fn added_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            HunkLine::Add(t) => Some(t.as_str()),
            _ => None,
        })
    }

    pub fn header(&self) -> String {
        format!(
            "@@ -{} +{} @@{}",
            format_range(self.old_start, self.old_len),
            format_range(self.new_start, self.new_len),
            self.section
        )
    }

    pub fn render_into(&self, out: &mut String) {
        out.push_str(&self.header());
        out.push('\n');

        let last_old = if self.old_missing_newline {
            self.lines.iter().rposition(HunkLine::in_source)
        } else {
            None
        };
        let last_new = if self.new_missing_newline {
            self.lines.iter().rposition(HunkLine::in_target)
        } else {
            None
        };

        for (idx, line) in self.lines.iter().enumerate() {
            out.push(line.prefix());
            out.push_str(line.text());
            out.push('\n');
            if Some(idx) == last_old || Some(idx) == last_new {
                out.push_str(NO_NEWLINE_MARKER);
                out.push('\n');
            }
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }
}

fn format_range(start: usize, len: usize) -> String {
    if len == 1 {
        start.to_string()
    } else {
        format!("{},{}", start, len)
    }
}

/// All hunks for one target file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchFile {
    /// Target path, relative to the tree root (source path for deletions).
    pub path: String,
    pub kind: ChangeKind,
    /// Header lines exactly as they appeared (`diff --git` through `+++`).
    #[serde(default)]
    pub header: Vec<String>,
    pub hunks: Vec<Hunk>,
}

impl PatchFile {
    pub fn source_path(&self) -> &str {
        match &self.kind {
            ChangeKind::Rename { from } => from,
            _ => &self.path,
        }
    }

    fn render_into(&self, out: &mut String) {
        if self.header.is_empty() {
            let old = match self.kind {
                ChangeKind::Add => DEV_NULL.to_string(),
                _ => format!("a/{}", self.source_path()),
            };
            let new = match self.kind {
                ChangeKind::Delete => DEV_NULL.to_string(),
                _ => format!("b/{}", self.path),
            };
            out.push_str(&format!(
                "{}{}\n{}{}\n",
                OLD_FILE_PREFIX, old, NEW_FILE_PREFIX, new
            ));
        } else {
            for line in &self.header {
                out.push_str(line);
                out.push('\n');
            }
        }
        for hunk in &self.hunks {
            hunk.render_into(out);
        }
    }
}

/// A multi-file unified diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// Mail headers and commit message of a `format-patch` file.
    #[serde(default)]
    pub preamble: Vec<String>,
    pub files: Vec<PatchFile>,
    /// `-- ` signature block and anything after it.
    #[serde(default)]
    pub trailer: Vec<String>,
}

impl Patch {
    pub fn parse(text: &str) -> Result<Patch, PatchParseError> {
        Parser::new(text).run()
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    pub fn file(&self, path: &str) -> Option<&PatchFile> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn hunk_count(&self) -> usize {
        self.files.iter().map(|f| f.hunks.len()).sum()
    }

    /// Render back to unified diff text with normalised hunk headers.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.preamble {
            out.push_str(line);
            out.push('\n');
        }
        for file in &self.files {
            file.render_into(&mut out);
        }
        for line in &self.trailer {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

#[derive(Default)]
struct FileBuilder {
    header: Vec<String>,
    git_old: Option<String>,
    git_new: Option<String>,
    old: Option<String>,
    new: Option<String>,
    new_file: bool,
    deleted: bool,
    rename_from: Option<String>,
    rename_to: Option<String>,
    binary: bool,
    hunks: Vec<Hunk>,
}

impl FileBuilder {
    fn from_git_line(line: &str) -> Self {
        let (git_old, git_new) = split_git_paths(&line[GIT_DIFF_PREFIX.len()..]);
        Self {
            header: vec![line.to_string()],
            git_old,
            git_new,
            ..Default::default()
        }
    }

    fn has_file_lines(&self) -> bool {
        self.old.is_some() || self.new.is_some()
    }

    fn absorb_extended(&mut self, line: &str) {
        if line.starts_with("new file mode") {
            self.new_file = true;
        } else if line.starts_with("deleted file mode") {
            self.deleted = true;
        } else if let Some(from) = line.strip_prefix("rename from ") {
            self.rename_from = Some(from.trim().to_string());
        } else if let Some(to) = line.strip_prefix("rename to ") {
            self.rename_to = Some(to.trim().to_string());
        }
        self.header.push(line.to_string());
    }

    fn finish(self) -> Result<PatchFile, PatchParseError> {
        let old = self
            .rename_from
            .clone()
            .or(self.old.clone())
            .or(self.git_old.clone())
            .unwrap_or_default();
        let new = self
            .rename_to
            .clone()
            .or(self.new.clone())
            .or(self.git_new.clone())
            .unwrap_or_default();

        let (path, kind) = if self.new_file || old == DEV_NULL {
            (new, ChangeKind::Add)
        } else if self.deleted || new == DEV_NULL {
            (old, ChangeKind::Delete)
        } else if self.rename_from.is_some() || (!new.is_empty() && old != new) {
            (new, ChangeKind::Rename { from: old })
        } else {
            (new, ChangeKind::Modify)
        };

        if self.binary {
            return Err(PatchParseError::Binary(path));
        }

        check_overlaps(&path, &self.hunks)?;

        Ok(PatchFile {
            path,
            kind,
            header: self.header,
            hunks: self.hunks,
        })
    }
}

fn check_overlaps(path: &str, hunks: &[Hunk]) -> Result<(), PatchParseError> {
    for (idx, pair) in hunks.windows(2).enumerate() {
        let (first, second) = (&pair[0], &pair[1]);
        let first_end = first.anchor_index() + first.old_len;
        if second.anchor_index() < first_end || second.old_start < first.old_start {
            return Err(PatchParseError::OverlappingHunks {
                path: path.to_string(),
                first: idx + 1,
                second: idx + 2,
            });
        }
    }
    Ok(())
}

/// `a/foo b/foo` → (`foo`, `foo`). Paths with spaces are split on ` b/`.
fn split_git_paths(rest: &str) -> (Option<String>, Option<String>) {
    match rest.find(" b/") {
        Some(idx) => (
            Some(strip_side_prefix(&rest[..idx], "a/")),
            Some(strip_side_prefix(&rest[idx + 1..], "b/")),
        ),
        None => (None, None),
    }
}

fn strip_side_prefix(raw: &str, prefix: &str) -> String {
    // `diff -u` appends a tab and timestamp to file lines.
    let raw = raw.split('\t').next().unwrap_or(raw).trim_end();
    if raw == DEV_NULL {
        return raw.to_string();
    }
    raw.strip_prefix(prefix).unwrap_or(raw).to_string()
}

fn parse_hunk_header(line: &str, line_no: usize) -> Result<Hunk, PatchParseError> {
    let bad = || PatchParseError::BadHunkHeader {
        line: line_no,
        text: line.to_string(),
    };
    let rest = line.strip_prefix("@@ ").ok_or_else(bad)?;
    let close = rest.find(" @@").ok_or_else(bad)?;
    let ranges = &rest[..close];
    let section = rest[close + 3..].to_string();

    let mut parts = ranges.split_whitespace();
    let old = parts
        .next()
        .and_then(|p| p.strip_prefix('-'))
        .ok_or_else(bad)?;
    let new = parts
        .next()
        .and_then(|p| p.strip_prefix('+'))
        .ok_or_else(bad)?;
    let (old_start, old_len) = parse_range(old).ok_or_else(bad)?;
    let (new_start, new_len) = parse_range(new).ok_or_else(bad)?;

    Ok(Hunk {
        old_start,
        old_len,
        new_start,
        new_len,
        section,
        lines: Vec::new(),
        old_missing_newline: false,
        new_missing_newline: false,
    })
}

fn parse_range(raw: &str) -> Option<(usize, usize)> {
    match raw.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((raw.parse().ok()?, 1)),
    }
}

struct Parser<'a> {
    lines: Vec<&'a str>,
    pos: usize,
    patch: Patch,
    current: Option<FileBuilder>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        let mut lines: Vec<&str> = text.split('\n').collect();
        if lines.last() == Some(&"") {
            lines.pop();
        }
        Self {
            lines,
            pos: 0,
            patch: Patch::default(),
            current: None,
        }
    }

    fn run(mut self) -> Result<Patch, PatchParseError> {
        while self.pos < self.lines.len() {
            let line = self.lines[self.pos];

            if line.starts_with(GIT_DIFF_PREFIX) {
                self.finish_current()?;
                self.current = Some(FileBuilder::from_git_line(line));
                self.pos += 1;
                continue;
            }

            if line.starts_with(OLD_FILE_PREFIX)
                && self
                    .lines
                    .get(self.pos + 1)
                    .is_some_and(|next| next.starts_with(NEW_FILE_PREFIX))
            {
                let starts_new_file = match &self.current {
                    None => true,
                    Some(builder) => builder.has_file_lines() || !builder.hunks.is_empty(),
                };
                if starts_new_file {
                    self.finish_current()?;
                    self.current = Some(FileBuilder::default());
                }
                let next = self.lines[self.pos + 1];
                if let Some(builder) = self.current.as_mut() {
                    builder.old = Some(strip_side_prefix(&line[OLD_FILE_PREFIX.len()..], "a/"));
                    builder.new = Some(strip_side_prefix(&next[NEW_FILE_PREFIX.len()..], "b/"));
                    builder.header.push(line.to_string());
                    builder.header.push(next.to_string());
                }
                self.pos += 2;
                continue;
            }

            if line.starts_with(HUNK_HEADER_PREFIX) {
                if self.current.is_none() {
                    return Err(PatchParseError::OrphanHunk { line: self.pos + 1 });
                }
                let hunk = self.parse_hunk()?;
                if let Some(builder) = self.current.as_mut() {
                    builder.hunks.push(hunk);
                }
                continue;
            }

            if line == SIGNATURE_SEPARATOR && self.current.is_some() {
                self.patch.trailer = self.lines[self.pos..]
                    .iter()
                    .map(|l| l.to_string())
                    .collect();
                break;
            }

            match self.current.as_mut() {
                None => self.patch.preamble.push(line.to_string()),
                Some(builder) if builder.hunks.is_empty() && !builder.has_file_lines() => {
                    if line.starts_with("Binary files") || line.starts_with("GIT binary patch") {
                        builder.binary = true;
                        builder.header.push(line.to_string());
                    } else if EXTENDED_HEADER_PREFIXES.iter().any(|p| line.starts_with(p)) {
                        builder.absorb_extended(line);
                    }
                }
                // Stray text between file sections carries no diff content.
                Some(_) => {}
            }
            self.pos += 1;
        }

        self.finish_current()?;
        if self.patch.files.is_empty() {
            return Err(PatchParseError::Empty);
        }
        Ok(self.patch)
    }

    fn finish_current(&mut self) -> Result<(), PatchParseError> {
        if let Some(builder) = self.current.take() {
            self.patch.files.push(builder.finish()?);
        }
        Ok(())
    }

    /// Consume one hunk. Body length follows the header counts; a body cut
    /// short by the next header, or one that runs past its counts, is
    /// recounted from the lines actually present.
    fn parse_hunk(&mut self) -> Result<Hunk, PatchParseError> {
        let mut hunk = parse_hunk_header(self.lines[self.pos], self.pos + 1)?;
        let mut old_left = hunk.old_len;
        let mut new_left = hunk.new_len;
        self.pos += 1;

        while self.pos < self.lines.len() {
            let line = self.lines[self.pos];

            if line.starts_with('\\') {
                match hunk.lines.last() {
                    Some(HunkLine::Context(_)) => {
                        hunk.old_missing_newline = true;
                        hunk.new_missing_newline = true;
                    }
                    Some(HunkLine::Remove(_)) => hunk.old_missing_newline = true,
                    Some(HunkLine::Add(_)) => hunk.new_missing_newline = true,
                    None => {}
                }
                self.pos += 1;
                continue;
            }

            let counts_done = old_left == 0 && new_left == 0;
            if counts_done && !is_overflow_body_line(line) {
                break;
            }
            if line.starts_with(HUNK_HEADER_PREFIX) || line.starts_with(GIT_DIFF_PREFIX) {
                break;
            }

            let parsed = match line.chars().next() {
                Some(' ') => HunkLine::Context(line[1..].to_string()),
                Some('+') => HunkLine::Add(line[1..].to_string()),
                Some('-') => HunkLine::Remove(line[1..].to_string()),
                // Some tools strip the single space from empty context lines.
                None if old_left > 0 && new_left > 0 => HunkLine::Context(String::new()),
                _ => break,
            };
            if parsed.in_source() {
                old_left = old_left.saturating_sub(1);
            }
            if parsed.in_target() {
                new_left = new_left.saturating_sub(1);
            }
            hunk.lines.push(parsed);
            self.pos += 1;
        }

        hunk.recount();
        Ok(hunk)
    }
}

/// Lines that may continue a hunk whose header undercounted its body.
fn is_overflow_body_line(line: &str) -> bool {
    if line == SIGNATURE_SEPARATOR
        || line.starts_with(OLD_FILE_PREFIX)
        || line.starts_with(NEW_FILE_PREFIX)
    {
        return false;
    }
    matches!(line.chars().next(), Some(' ') | Some('+') | Some('-'))
}
