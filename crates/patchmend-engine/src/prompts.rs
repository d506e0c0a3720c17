// ═══════════════════════════════════════════════════════════════════════════════
// SHARED BUILDING BLOCKS
// ═══════════════════════════════════════════════════════════════════════════════

use patchmend_adapters::util::tail;
use patchmend_core::{
    AlignmentTag, AttemptContext, FileState, HunkAlignment, RejectionRecord, RepairRequest,
};

/// Output contract shared by the system prompt and the closing instruction.
const OUTPUT_RULES: &str = r#"OUTPUT RULES:
- Reply with exactly one fenced ```diff block containing a complete unified diff.
- The diff must contain a section for EVERY file listed under FILE STATUS, in the same order,
  including files that already apply cleanly. Reproduce their hunks unchanged.
- Use `--- a/<path>` / `+++ b/<path>` headers and `@@ -l,s +l,s @@` hunk headers.
- Context and removed lines must match the CURRENT file content byte for byte, whitespace included.
- No placeholders, ellipses, or line-number prefixes inside the diff.
- A short explanation before the diff block is allowed; nothing after it."#;

pub const REPAIR_SYSTEM: &str = r#"You repair patches from a vendored patch series that no longer apply after the upstream project moved.

You receive the original patch, the status of every file it touches, the hunks that were rejected
with what each expected next to what the file now holds, and the most recent failure diagnostic.

Keep the intent of the original patch. Rebase each rejected hunk onto the current content: follow
renamed identifiers, moved blocks and changed whitespace, but do not add unrelated changes."#;

/// Diagnostics are kept to their tail; compilers report the useful part last.
const MAX_DIAGNOSTIC_CHARS: usize = 6000;

fn system_prompt() -> String {
    format!("{}\n\n{}", REPAIR_SYSTEM, OUTPUT_RULES)
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROMPT BUILDER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowDetail {
    All,
    FailedOnly,
    None,
}

/// Renders one [`AttemptContext`] into a request. Static material comes
/// first; the current diagnostic sits directly above the instruction.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    char_budget: usize,
}

impl PromptBuilder {
    pub fn new(char_budget: usize) -> Self {
        Self { char_budget }
    }

    pub fn build(&self, ctx: &AttemptContext) -> RepairRequest {
        let mut user = String::new();
        for detail in [WindowDetail::All, WindowDetail::FailedOnly, WindowDetail::None] {
            user = render_user(ctx, detail);
            if user.len() <= self.char_budget {
                break;
            }
            tracing::debug!(
                chars = user.len(),
                budget = self.char_budget,
                ?detail,
                "prompt over budget, dropping file windows"
            );
        }
        if user.len() > self.char_budget {
            tracing::warn!(
                chars = user.len(),
                budget = self.char_budget,
                "prompt still over budget without file windows"
            );
        }

        RepairRequest {
            system: system_prompt(),
            user,
            expected_files: ctx.expected_files(),
            escalation: 1,
        }
    }
}

fn render_user(ctx: &AttemptContext, detail: WindowDetail) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "PROJECT: {}\nCHANGE REQUEST: {}\nPATCH: {}\nATTEMPT: {} of {}\n\n",
        ctx.project, ctx.change_request, ctx.patch_name, ctx.attempt, ctx.max_attempts
    ));

    out.push_str("ORIGINAL PATCH:\n```diff\n");
    out.push_str(ctx.original_patch.trim_end_matches('\n'));
    out.push_str("\n```\n\n");

    out.push_str("FILE STATUS:\n");
    for file in &ctx.files {
        push_status_line(&mut out, file);
    }
    out.push('\n');

    if detail == WindowDetail::All {
        for file in ctx.clean_files() {
            if file.window.lines.is_empty() {
                continue;
            }
            out.push_str(&format!(
                "CURRENT CONTENT OF {} (applies cleanly, lines {}-{} of {}):\n",
                file.path,
                file.window.start_line,
                file.window.end_line(),
                file.window.total_lines
            ));
            out.push_str(&file.window.numbered());
            out.push('\n');
        }
    }

    for file in ctx.failed_files() {
        out.push_str(&format!("REJECTED HUNKS IN {}:\n", file.path));
        if let Some(note) = &file.note {
            out.push_str(&format!("  whole file refused: {}\n", note));
        }
        for rejection in file.outcome.rejections() {
            let alignment = file
                .alignments
                .iter()
                .find(|a| a.hunk_index == rejection.hunk_index);
            push_rejection(&mut out, rejection, alignment);
        }
        if detail != WindowDetail::None && !file.window.lines.is_empty() {
            out.push_str(&format!(
                "CURRENT CONTENT OF {} (lines {}-{} of {}):\n",
                file.path,
                file.window.start_line,
                file.window.end_line(),
                file.window.total_lines
            ));
            out.push_str(&file.window.numbered());
        }
        out.push('\n');
    }

    if !ctx.earlier_errors.is_empty() {
        out.push_str("EARLIER DIAGNOSTICS (oldest first):\n");
        for (idx, err) in ctx.earlier_errors.iter().enumerate() {
            let shown = tail(err, MAX_DIAGNOSTIC_CHARS);
            out.push_str(&format!("[{}] {}\n", idx + 1, shown));
        }
        out.push('\n');
    }

    if let Some(err) = &ctx.current_error {
        out.push_str("CURRENT ERROR (from the previous attempt):\n");
        out.push_str(&tail(err, MAX_DIAGNOSTIC_CHARS));
        out.push_str("\n\n");
    }

    out.push_str(&format!(
        "TASK: Produce a corrected version of {} as one ```diff block covering all {} file(s) \
         listed under FILE STATUS ({}).\n\n{}",
        ctx.patch_name,
        ctx.files.len(),
        ctx.expected_files().join(", "),
        OUTPUT_RULES
    ));
    out
}

fn push_status_line(out: &mut String, file: &FileState) {
    out.push_str(&format!(
        "- {} [{}] {}",
        file.path,
        file.kind.label(),
        file.outcome.label()
    ));
    if !file.exists {
        out.push_str(", file does not exist");
    }
    out.push('\n');
}

fn push_rejection(
    out: &mut String,
    rejection: &RejectionRecord,
    alignment: Option<&HunkAlignment>,
) {
    out.push_str(&format!(
        "Hunk #{} {} (tried at line {}):\n",
        rejection.hunk_index + 1,
        rejection.hunk.header(),
        rejection.attempted_line
    ));
    let Some(alignment) = alignment else {
        out.push_str("  no comparable content found\n");
        return;
    };
    out.push_str(&format!(
        "  expected vs actual (closest match at line {}; '-' only in patch, '+' only in file):\n",
        alignment.actual_line
    ));
    for row in &alignment.rows {
        let marker = match row.tag {
            AlignmentTag::Same => ' ',
            AlignmentTag::Expected => '-',
            AlignmentTag::Actual => '+',
        };
        out.push_str(&format!("  {}{}", marker, row.text));
        if row.whitespace_only {
            out.push_str("    <- whitespace differs");
        }
        out.push('\n');
    }
}
