//! The patch-repair retry engine.
//!
//! Reproduces a patch failure on a clean tree, describes it to a repair
//! oracle, and applies, validates and either keeps or reverts each
//! candidate fix until one sticks or the attempts run out.

pub mod apply;
pub mod extract;
pub mod llm;
pub mod orchestrator;
pub mod prompts;
pub mod report;
pub mod run;
pub mod validate;
pub mod workspace;

#[cfg(test)]
mod testkit;

pub use apply::{apply_patch, ApplyError, ApplyMode, ApplyReport, REJECT_SUFFIX};
pub use extract::{ContextExtractor, ExtractionInput};
pub use llm::OracleClient;
pub use orchestrator::{
    AttemptRecord, DiagnosticMemory, Orchestrator, PatchOutcome, PatchStatus, RepairJob, RunState,
};
pub use prompts::PromptBuilder;
pub use report::RunReport;
pub use run::{
    check, check_series, fix, run_series, FileCheck, FixRequest, FixRun, PatchCheck, Session,
};
pub use validate::{SymbolValidator, ValidatorChain};
pub use workspace::{RevertError, Workspace};
