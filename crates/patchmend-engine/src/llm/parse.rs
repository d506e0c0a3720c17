use super::models::Usage;
use patchmend_adapters::util::truncate;
use patchmend_core::{CandidateFix, OracleError, OracleUsage, Patch};

const DIFF_FENCE_TAGS: &[&str] = &["diff", "patch", "udiff"];
const DIFF_START_PREFIXES: &[&str] = &["diff --git ", "--- ", "From "];

/// Fenced diff body and the prose before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedDiff {
    pub diff: String,
    pub rationale: Option<String>,
    /// The fence was opened but never closed.
    pub unterminated: bool,
}

fn fence_tag(line: &str) -> Option<&str> {
    line.trim_start().strip_prefix("```").map(str::trim)
}

fn looks_like_diff(body: &str) -> bool {
    body.lines()
        .any(|l| l.starts_with("--- ") || l.starts_with("diff --git ") || l.starts_with("@@ "))
}

fn rationale_from(prose: &str) -> Option<String> {
    let prose = prose.trim();
    if prose.is_empty() {
        None
    } else {
        Some(prose.to_string())
    }
}

/// Pull the diff out of a model response.
///
/// Prefers the first ```diff / ```patch block, then any fenced block that
/// looks like a diff, then bare diff text.
pub fn extract_diff(text: &str) -> Option<ExtractedDiff> {
    let lines: Vec<&str> = text.lines().collect();

    // Opening fence lines, with whether they carry a diff language tag.
    let mut fences: Vec<(usize, bool)> = Vec::new();
    let mut inside = false;
    for (idx, line) in lines.iter().enumerate() {
        let Some(tag) = fence_tag(line) else {
            continue;
        };
        if inside {
            inside = !tag.is_empty();
        } else {
            let tagged = DIFF_FENCE_TAGS.iter().any(|t| tag.eq_ignore_ascii_case(t));
            fences.push((idx, tagged));
            inside = true;
        }
    }

    let block = |open: usize| -> (String, bool) {
        let close = lines[open + 1..]
            .iter()
            .position(|l| fence_tag(l).is_some_and(str::is_empty))
            .map(|p| open + 1 + p);
        let end = close.unwrap_or(lines.len());
        (lines[open + 1..end].join("\n") + "\n", close.is_none())
    };

    let opener = fences
        .iter()
        .find(|(_, tagged)| *tagged)
        .map(|(idx, _)| *idx)
        .or_else(|| {
            fences
                .iter()
                .map(|(idx, _)| *idx)
                .find(|idx| looks_like_diff(&block(*idx).0))
        });

    if let Some(open) = opener {
        let (diff, unterminated) = block(open);
        return Some(ExtractedDiff {
            diff,
            rationale: rationale_from(&lines[..open].join("\n")),
            unterminated,
        });
    }

    let start = lines
        .iter()
        .position(|l| DIFF_START_PREFIXES.iter().any(|p| l.starts_with(p)))?;
    Some(ExtractedDiff {
        diff: lines[start..].join("\n") + "\n",
        rationale: rationale_from(&lines[..start].join("\n")),
        unterminated: false,
    })
}

/// Turn a completed response into a candidate, or classify why it is not one.
///
/// Truncation wins over parsing: output that hit the requested ceiling is
/// never trusted even when it happens to parse.
pub fn interpret_response(
    content: &str,
    finish_reason: Option<&str>,
    usage: Option<Usage>,
    requested: u32,
    expected_files: &[String],
) -> Result<CandidateFix, OracleError> {
    let reported = usage.and_then(|u| u.completion_tokens);
    let hit_ceiling = reported.is_some_and(|r| r >= requested);
    let cut_off = finish_reason.is_some_and(|r| r.eq_ignore_ascii_case("length"));

    let extracted = extract_diff(content);
    let parsed = extracted
        .as_ref()
        .map(|e| Patch::parse(&e.diff).map_err(|err| err.to_string()));
    let found_files = match &parsed {
        Some(Ok(patch)) => count_covered(patch, expected_files),
        _ => 0,
    };

    if hit_ceiling || cut_off {
        return Err(OracleError::Truncated {
            requested,
            reported,
            expected_files: expected_files.len(),
            found_files,
        });
    }

    let (extracted, patch) = match (extracted, parsed) {
        (Some(extracted), Some(Ok(patch))) => (extracted, patch),
        (Some(_), Some(Err(err))) => return Err(OracleError::Parse(err)),
        _ => {
            return Err(OracleError::Parse(format!(
                "no diff found in response: {}",
                truncate(content.trim(), 120)
            )))
        }
    };

    if found_files < expected_files.len() {
        return Err(OracleError::Truncated {
            requested,
            reported,
            expected_files: expected_files.len(),
            found_files,
        });
    }
    if extracted.unterminated {
        tracing::debug!("unclosed diff fence, but every expected file is present");
    }

    let usage = OracleUsage {
        prompt_tokens: usage.and_then(|u| u.prompt_tokens),
        completion_tokens: reported,
        requested_max: requested,
    };
    Ok(CandidateFix::new(patch, extracted.rationale, Some(usage)))
}

/// How many of `expected` the patch has a section for.
fn count_covered(patch: &Patch, expected: &[String]) -> usize {
    expected
        .iter()
        .filter(|path| {
            patch
                .files
                .iter()
                .any(|f| &f.path == *path || f.source_path() == path.as_str())
        })
        .count()
}
