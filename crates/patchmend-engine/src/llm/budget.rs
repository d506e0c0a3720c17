//! Response size budgeting.

use patchmend_adapters::OracleSettings;

/// Beta header that unlocks the extended output tier on Anthropic models.
pub(crate) const EXTENDED_OUTPUT_HEADER: (&str, &str) =
    ("anthropic-beta", "output-128k-2025-02-19");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputBudget {
    pub max_tokens: u32,
    /// The request needs the extended output tier.
    pub extended: bool,
}

/// Highest output size the endpoint accepts with the current settings.
fn hard_ceiling(settings: &OracleSettings) -> u32 {
    if settings.extended_output {
        settings
            .extended_output_ceiling_tokens
            .max(settings.output_ceiling_tokens)
    } else {
        settings.output_ceiling_tokens
    }
}

/// Linear estimate per file plus margin, clamped to `[min, ceiling]`, then
/// scaled by `escalation` and clamped again.
pub fn output_budget(settings: &OracleSettings, files: usize, escalation: u32) -> OutputBudget {
    let ceiling = hard_ceiling(settings).max(1);
    let floor = settings.min_output_tokens.min(ceiling);
    let estimate = settings
        .tokens_per_file
        .saturating_mul(files.min(u32::MAX as usize) as u32)
        .saturating_add(settings.token_margin);
    let base = estimate.clamp(floor, ceiling);
    let max_tokens = base.saturating_mul(escalation.max(1)).min(ceiling);

    OutputBudget {
        max_tokens,
        extended: max_tokens > settings.output_ceiling_tokens,
    }
}
