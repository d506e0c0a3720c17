//! The retry state machine for one patch.
//!
//! Every attempt starts from a reverted tree: the context handed to the
//! oracle is rebuilt from a fresh permissive apply of the original patch,
//! never from whatever a rejected candidate left behind.

use crate::apply::{ApplyError, ApplyMode};
use crate::extract::{ContextExtractor, ExtractionInput};
use crate::prompts::PromptBuilder;
use crate::workspace::Workspace;
use patchmend_adapters::util::tail;
use patchmend_core::{
    AttemptResult, CandidateFix, ExtractionError, FixError, Patch, RepairOracle, ValidationError,
    ValidationTarget, Validator,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

/// Diagnostic text kept in attempt records.
const RECORD_DIAGNOSTIC_CHARS: usize = 2_000;
/// Escalation stops doubling here; the budget is clamped to the ceiling anyway.
const MAX_ESCALATION: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Extracting,
    AwaitingFix,
    Applying,
    Validating,
    Succeeded,
    Retrying,
    Exhausted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Init => "init",
            RunState::Extracting => "extracting",
            RunState::AwaitingFix => "awaiting-fix",
            RunState::Applying => "applying",
            RunState::Validating => "validating",
            RunState::Succeeded => "succeeded",
            RunState::Retrying => "retrying",
            RunState::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

/// Most recent diagnostics, newest last. Depth 1 keeps only the current one.
#[derive(Debug, Clone)]
pub struct DiagnosticMemory {
    depth: usize,
    entries: VecDeque<String>,
}

impl DiagnosticMemory {
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            depth,
            entries: VecDeque::with_capacity(depth),
        }
    }

    pub fn record(&mut self, diagnostic: impl Into<String>) {
        if self.entries.len() == self.depth {
            self.entries.pop_front();
        }
        self.entries.push_back(diagnostic.into());
    }

    pub fn current(&self) -> Option<&str> {
        self.entries.back().map(String::as_str)
    }

    /// Everything but the current diagnostic, oldest first.
    pub fn earlier(&self) -> Vec<String> {
        let keep = self.entries.len().saturating_sub(1);
        self.entries.iter().take(keep).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One patch to repair.
#[derive(Debug, Clone, Copy)]
pub struct RepairJob<'a> {
    pub project: &'a str,
    pub change_request: &'a str,
    pub patch_name: &'a str,
    pub patch_text: &'a str,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    /// Furthest state the attempt reached.
    pub state: RunState,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    pub escalation: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported_tokens: Option<u32>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PatchStatus {
    /// Applied without rejections; nothing was asked of the oracle.
    AlreadyClean,
    Repaired {
        patch_text: String,
    },
    Exhausted {
        last_diagnostic: String,
        failing_files: Vec<String>,
    },
    /// The stored patch itself could not be parsed.
    Invalid {
        message: String,
    },
}

impl PatchStatus {
    pub fn label(&self) -> &'static str {
        match self {
            PatchStatus::AlreadyClean => "already-clean",
            PatchStatus::Repaired { .. } => "repaired",
            PatchStatus::Exhausted { .. } => "exhausted",
            PatchStatus::Invalid { .. } => "invalid",
        }
    }

    /// The patch now applies on top of the baseline.
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            PatchStatus::AlreadyClean | PatchStatus::Repaired { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchOutcome {
    pub name: String,
    #[serde(flatten)]
    pub status: PatchStatus,
    pub oracle_calls: u32,
    pub attempts: Vec<AttemptRecord>,
}

impl PatchOutcome {
    /// The parsed patch to accept into the baseline, if it applies.
    pub fn accepted_patch(&self, original: &str) -> Option<Patch> {
        match &self.status {
            PatchStatus::AlreadyClean => Patch::parse(original).ok(),
            PatchStatus::Repaired { patch_text } => Patch::parse(patch_text).ok(),
            _ => None,
        }
    }
}

fn fatal_extraction(err: ExtractionError) -> FixError {
    match err {
        ExtractionError::Baseline { name, message } => FixError::Baseline { name, message },
        other => FixError::Revert(other.to_string()),
    }
}

/// Keep the commit message and signature of a format-patch file when the
/// candidate only carries the diff.
fn carry_envelope(candidate: &Patch, original: &Patch) -> Patch {
    let mut repaired = candidate.clone();
    if repaired.preamble.is_empty() {
        repaired.preamble = original.preamble.clone();
    }
    if repaired.trailer.is_empty() {
        repaired.trailer = original.trailer.clone();
    }
    repaired
}

/// Tracks the current state and logs each transition.
struct StateTracker<'a> {
    patch: &'a str,
    state: RunState,
}

impl StateTracker<'_> {
    fn enter(&mut self, next: RunState, attempt: u32) {
        tracing::debug!(
            patch = self.patch,
            attempt,
            from = %self.state,
            to = %next,
            "state transition"
        );
        self.state = next;
    }
}

pub struct Orchestrator<'a> {
    extractor: ContextExtractor,
    prompts: PromptBuilder,
    oracle: &'a dyn RepairOracle,
    validator: &'a dyn Validator,
    history_depth: usize,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        extractor: ContextExtractor,
        prompts: PromptBuilder,
        oracle: &'a dyn RepairOracle,
        validator: &'a dyn Validator,
        history_depth: usize,
    ) -> Self {
        Self {
            extractor,
            prompts,
            oracle,
            validator,
            history_depth,
        }
    }

    /// Drive one patch to `Succeeded` or `Exhausted`.
    ///
    /// On success the tree is left with the baseline plus the accepted patch
    /// applied; otherwise it is left at the baseline. Only unrecoverable
    /// conditions are returned as `Err`.
    pub async fn repair(
        &self,
        job: RepairJob<'_>,
        workspace: &Workspace<'_>,
    ) -> Result<PatchOutcome, FixError> {
        let mut outcome = PatchOutcome {
            name: job.patch_name.to_string(),
            status: PatchStatus::AlreadyClean,
            oracle_calls: 0,
            attempts: Vec::new(),
        };

        let original = match Patch::parse(job.patch_text) {
            Ok(patch) => patch,
            Err(err) => {
                tracing::warn!(patch = job.patch_name, error = %err, "stored patch does not parse");
                outcome.status = PatchStatus::Invalid {
                    message: err.to_string(),
                };
                return Ok(outcome);
            }
        };

        let max_attempts = job.max_attempts.max(1);
        let mut tracker = StateTracker {
            patch: job.patch_name,
            state: RunState::Init,
        };
        let mut memory = DiagnosticMemory::new(self.history_depth);
        let mut escalation = 1u32;
        let mut seen_failure = false;
        let mut failing_files: Vec<String> = Vec::new();

        for attempt in 1..=max_attempts {
            let started = Instant::now();
            tracker.enter(RunState::Extracting, attempt);

            let input = ExtractionInput {
                project: job.project,
                change_request: job.change_request,
                patch_name: job.patch_name,
                patch_text: job.patch_text,
                patch: &original,
                attempt,
                max_attempts,
                expect_failure: seen_failure,
            };
            let mut ctx = match self.extractor.extract(workspace, &input) {
                Ok(ctx) => ctx,
                Err(err) if err.is_fatal() => return Err(fatal_extraction(err)),
                Err(err) => {
                    let result = AttemptResult::ExtractionFailed {
                        diagnostic: err.to_string(),
                    };
                    self.finish_attempt(
                        &mut outcome,
                        &mut memory,
                        &mut tracker,
                        attempt,
                        escalation,
                        result,
                        None,
                        started,
                    );
                    continue;
                }
            };

            if !ctx.has_rejections() {
                tracker.enter(RunState::Succeeded, attempt);
                workspace
                    .apply(&original, ApplyMode::Strict)
                    .map_err(|e| FixError::Revert(e.to_string()))?;
                tracing::info!(patch = job.patch_name, "patch applies cleanly");
                return Ok(outcome);
            }
            seen_failure = true;
            failing_files = ctx.failed_files().iter().map(|f| f.path.clone()).collect();

            ctx.current_error = memory.current().map(str::to_string);
            ctx.earlier_errors = memory.earlier();

            tracker.enter(RunState::AwaitingFix, attempt);
            let mut request = self.prompts.build(&ctx);
            request.escalation = escalation;
            outcome.oracle_calls += 1;

            let candidate = match self.oracle.propose(&request).await {
                Ok(candidate) => candidate,
                Err(err) if err.is_fatal() => return Err(FixError::Config(err.to_string())),
                Err(err) => {
                    let truncated = err.is_truncation();
                    let used = escalation;
                    if truncated {
                        escalation = escalation.saturating_mul(2).min(MAX_ESCALATION);
                    }
                    let result = AttemptResult::OracleFailed {
                        diagnostic: err.to_string(),
                        truncated,
                    };
                    self.finish_attempt(
                        &mut outcome,
                        &mut memory,
                        &mut tracker,
                        attempt,
                        used,
                        result,
                        None,
                        started,
                    );
                    continue;
                }
            };

            let result =
                self.try_candidate(workspace, &original, &candidate, &mut tracker, attempt)?;
            let succeeded = result.is_success();
            if succeeded {
                let repaired = carry_envelope(&candidate.patch, &original);
                outcome.status = PatchStatus::Repaired {
                    patch_text: repaired.render(),
                };
            }
            self.finish_attempt(
                &mut outcome,
                &mut memory,
                &mut tracker,
                attempt,
                escalation,
                result,
                Some(&candidate),
                started,
            );
            if succeeded {
                return Ok(outcome);
            }
        }

        tracker.enter(RunState::Exhausted, max_attempts);
        workspace.revert()?;
        let last_diagnostic = memory
            .current()
            .unwrap_or("no attempt produced a diagnostic")
            .to_string();
        tracing::warn!(
            patch = job.patch_name,
            attempts = max_attempts,
            failing = failing_files.len(),
            "attempts exhausted"
        );
        outcome.status = PatchStatus::Exhausted {
            last_diagnostic,
            failing_files,
        };
        Ok(outcome)
    }

    /// Strict apply, completeness check, then validation. Leaves the tree
    /// applied on success and reverted otherwise.
    fn try_candidate(
        &self,
        workspace: &Workspace<'_>,
        original: &Patch,
        candidate: &CandidateFix,
        tracker: &mut StateTracker<'_>,
        attempt: u32,
    ) -> Result<AttemptResult, FixError> {
        tracker.enter(RunState::Applying, attempt);
        workspace.revert()?;

        let rejected = match workspace.apply(&candidate.patch, ApplyMode::Strict) {
            Ok(_) => None,
            Err(ApplyError::Rejected(err)) => Some(AttemptResult::ApplyFailed {
                diagnostic: err.to_string(),
                failing_files: err.paths(),
            }),
            Err(err @ ApplyError::Io { .. }) => Some(AttemptResult::ApplyFailed {
                diagnostic: err.to_string(),
                failing_files: Vec::new(),
            }),
        };
        if let Some(result) = rejected {
            workspace.revert()?;
            return Ok(result);
        }

        let omitted: Vec<String> = original
            .files
            .iter()
            .filter(|f| {
                !candidate
                    .patch
                    .files
                    .iter()
                    .any(|c| c.path == f.path || c.source_path() == f.path)
            })
            .map(|f| f.path.clone())
            .collect();
        if !omitted.is_empty() {
            workspace.revert()?;
            return Ok(AttemptResult::ApplyFailed {
                diagnostic: format!(
                    "candidate applied but omits file(s) the original patch changes: {}",
                    omitted.join(", ")
                ),
                failing_files: omitted,
            });
        }

        tracker.enter(RunState::Validating, attempt);
        let target = ValidationTarget {
            applied: &candidate.patch,
            original,
        };
        let verdict = self.validator.validate(workspace.root(), &target);
        let result = match verdict {
            Ok(()) => return Ok(AttemptResult::Succeeded),
            Err(ValidationError::Build(diagnostic)) => AttemptResult::BuildFailed { diagnostic },
            Err(ValidationError::Semantic(diagnostic)) => {
                AttemptResult::SemanticMismatch { diagnostic }
            }
        };
        workspace.revert()?;
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_attempt(
        &self,
        outcome: &mut PatchOutcome,
        memory: &mut DiagnosticMemory,
        tracker: &mut StateTracker<'_>,
        attempt: u32,
        escalation: u32,
        result: AttemptResult,
        candidate: Option<&CandidateFix>,
        started: Instant,
    ) {
        let usage = candidate.and_then(|c| c.usage);
        let reached = tracker.state;
        let record = AttemptRecord {
            attempt,
            state: reached,
            result: result.kind().to_string(),
            diagnostic: result
                .diagnostic()
                .map(|d| tail(d, RECORD_DIAGNOSTIC_CHARS)),
            escalation,
            requested_tokens: usage.map(|u| u.requested_max),
            reported_tokens: usage.and_then(|u| u.completion_tokens),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        if result.is_success() {
            tracker.enter(RunState::Succeeded, attempt);
            tracing::info!(
                patch = outcome.name.as_str(),
                attempt,
                elapsed_ms = record.elapsed_ms,
                "candidate accepted"
            );
        } else {
            tracing::warn!(
                patch = outcome.name.as_str(),
                attempt,
                result = result.kind(),
                state = %reached,
                "attempt failed"
            );
            if let Some(diagnostic) = result.diagnostic() {
                memory.record(diagnostic);
            }
            tracker.enter(RunState::Retrying, attempt);
        }
        outcome.attempts.push(record);
    }
}
