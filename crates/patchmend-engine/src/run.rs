//! Runs over a project's whole patch series: `fix` and the `check` dry run.
//!
//! Patches are processed one at a time in series order. The baseline for
//! each patch is the reset checkout plus every patch accepted before it.

use crate::extract::{ContextExtractor, ExtractionInput};
use crate::orchestrator::{Orchestrator, PatchStatus, RepairJob};
use crate::prompts::PromptBuilder;
use crate::report::RunReport;
use crate::validate::{SymbolValidator, ValidatorChain};
use crate::workspace::Workspace;
use patchmend_adapters::{
    CommandValidator, Config, GitCheckout, PatchEntry, PatchStore, ProjectConfig, RunLock,
};
use patchmend_core::{Checkout, FixError, Patch, RepairOracle, Validator};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct FixRequest {
    pub project: String,
    pub change_request: String,
    /// Overrides the configured attempt limit.
    pub max_attempts: Option<u32>,
    /// Limit the run to one patch (file name or series number).
    pub only_patch: Option<String>,
}

impl FixRequest {
    pub fn attempt_limit(&self, config: &Config) -> u32 {
        self.max_attempts.unwrap_or(config.max_attempts).max(1)
    }
}

/// The capabilities a run is driven through.
pub struct Session<'a> {
    pub checkout: &'a dyn Checkout,
    pub store: &'a PatchStore,
    pub oracle: &'a dyn RepairOracle,
    pub validator: &'a dyn Validator,
}

#[derive(Debug)]
pub struct FixRun {
    pub report: RunReport,
    pub report_path: PathBuf,
}

impl FixRun {
    pub fn succeeded(&self) -> bool {
        self.report.all_applied()
    }
}

fn storage_error(path: &Path) -> impl Fn(anyhow::Error) -> FixError + '_ {
    move |e| FixError::Storage {
        path: path.display().to_string(),
        message: format!("{:#}", e),
    }
}

/// The project's external checks followed by the in-process symbol check.
pub fn validators_for(project: &ProjectConfig) -> ValidatorChain {
    let timeout = Duration::from_secs(project.validation_timeout_secs.max(1));
    let mut chain = ValidatorChain::new();
    if let Some(command) = project
        .build_command
        .as_deref()
        .filter(|c| !c.trim().is_empty())
    {
        chain.push(Box::new(CommandValidator::build(command, timeout)));
    }
    if let Some(command) = project
        .semantic_command
        .as_deref()
        .filter(|c| !c.trim().is_empty())
    {
        chain.push(Box::new(CommandValidator::semantic(command, timeout)));
    }
    chain.with(SymbolValidator::new(project.required_symbols.clone()))
}

/// Open the project's checkout and take the run lock for it.
fn open_project(config: &Config, name: &str) -> Result<(GitCheckout, RunLock), FixError> {
    let project = config
        .project(name)
        .map_err(|e| FixError::Config(e.to_string()))?;
    project
        .validate_layout(name, &config.reports_dir())
        .map_err(|e| FixError::Config(e.to_string()))?;
    let checkout =
        GitCheckout::open(&project.checkout).map_err(|e| FixError::Config(format!("{:#}", e)))?;
    let lock = RunLock::acquire(&Config::state_dir(), checkout.root())?;
    Ok((checkout, lock))
}

/// Repair the project's patch series against its git checkout and write the
/// run report. A fatal error still writes the report before returning.
pub async fn fix(
    config: &Config,
    request: &FixRequest,
    oracle: &dyn RepairOracle,
) -> Result<FixRun, FixError> {
    let (checkout, _lock) = open_project(config, &request.project)?;
    let project = config
        .project(&request.project)
        .map_err(|e| FixError::Config(e.to_string()))?;
    let store = PatchStore::new(&project.patches_dir);
    let validator = validators_for(project);
    let session = Session {
        checkout: &checkout,
        store: &store,
        oracle,
        validator: &validator,
    };

    let mut report = RunReport::new(
        &request.project,
        &request.change_request,
        &config.oracle.model,
        request.attempt_limit(config),
    );
    let result = run_series(config, request, &session, &mut report).await;
    if let Err(err) = &result {
        report.fatal_error = Some(err.to_string());
    }
    report.finish();

    let dir = config.reports_dir();
    let written = report.write_to(&dir);
    match (result, written) {
        (Ok(()), Ok(report_path)) => {
            tracing::info!(
                report = %report_path.display(),
                patches = report.patches.len(),
                oracle_calls = report.oracle_calls(),
                "run finished"
            );
            Ok(FixRun {
                report,
                report_path,
            })
        }
        (Ok(()), Err(e)) => Err(storage_error(&dir)(e)),
        (Err(err), Ok(report_path)) => {
            tracing::warn!(report = %report_path.display(), error = %err, "run stopped");
            Err(err)
        }
        (Err(err), Err(e)) => {
            tracing::warn!(error = %format!("{:#}", e), "run report could not be written");
            Err(err)
        }
    }
}

/// The patches to accept unchanged, then the patches to process.
fn plan(
    store: &PatchStore,
    only_patch: Option<&str>,
) -> Result<(Vec<PatchEntry>, Vec<PatchEntry>), FixError> {
    let mut entries = store.list().map_err(storage_error(store.dir()))?;
    let Some(selector) = only_patch else {
        return Ok((Vec::new(), entries));
    };
    let target = store
        .find(selector)
        .map_err(storage_error(store.dir()))?
        .ok_or_else(|| {
            FixError::Config(format!(
                "no patch matching '{}' in {}",
                selector,
                store.dir().display()
            ))
        })?;
    let position = entries
        .iter()
        .position(|e| e.name == target.name)
        .unwrap_or(entries.len());
    entries.truncate(position);
    Ok((entries, vec![target]))
}

fn read_patch(store: &PatchStore, entry: &PatchEntry) -> Result<String, FixError> {
    store.read(entry).map_err(storage_error(&entry.path))
}

/// Process the selected patches, recording each outcome in `report`. The
/// working tree is reset to clean afterwards, whatever happened.
pub async fn run_series(
    config: &Config,
    request: &FixRequest,
    session: &Session<'_>,
    report: &mut RunReport,
) -> Result<(), FixError> {
    let mut workspace = Workspace::new(session.checkout);
    let result = process_series(config, request, session, &mut workspace, report).await;
    match workspace.reset() {
        Ok(()) => result,
        Err(err) if result.is_ok() => Err(err.into()),
        Err(err) => {
            tracing::warn!(error = %err, "working tree not reset after a failed run");
            result
        }
    }
}

async fn process_series(
    config: &Config,
    request: &FixRequest,
    session: &Session<'_>,
    workspace: &mut Workspace<'_>,
    report: &mut RunReport,
) -> Result<(), FixError> {
    let (prefix, targets) = plan(session.store, request.only_patch.as_deref())?;

    for entry in &prefix {
        let text = read_patch(session.store, entry)?;
        let patch = Patch::parse(&text).map_err(|e| FixError::Baseline {
            name: entry.name.clone(),
            message: e.to_string(),
        })?;
        workspace.accept(entry.name.clone(), patch);
    }
    if !prefix.is_empty() {
        workspace.revert()?;
        tracing::debug!(accepted = prefix.len(), "earlier patches applied as baseline");
    }

    let orchestrator = Orchestrator::new(
        ContextExtractor::new(config.context.clone()),
        PromptBuilder::new(config.context.prompt_char_budget),
        session.oracle,
        session.validator,
        config.history_depth,
    );
    let max_attempts = request.attempt_limit(config);

    for entry in &targets {
        let text = read_patch(session.store, entry)?;
        tracing::info!(patch = %entry.name, max_attempts, "processing patch");
        let job = RepairJob {
            project: &request.project,
            change_request: &request.change_request,
            patch_name: &entry.name,
            patch_text: &text,
            max_attempts,
        };
        let outcome = orchestrator.repair(job, workspace).await?;

        if let PatchStatus::Repaired { patch_text } = &outcome.status {
            session.store.overwrite(entry, patch_text)?;
        }
        let accepted = outcome.accepted_patch(&text);
        tracing::info!(
            patch = %entry.name,
            status = outcome.status.label(),
            oracle_calls = outcome.oracle_calls,
            "patch finished"
        );
        report.patches.push(outcome);

        match accepted {
            Some(patch) => workspace.accept(entry.name.clone(), patch),
            None => {
                tracing::warn!(
                    patch = %entry.name,
                    remaining = targets.len() - report.patches.len(),
                    "stopping: later patches depend on this one"
                );
                break;
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileCheck {
    pub path: String,
    pub kind: String,
    pub outcome: String,
    pub rejected_hunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchCheck {
    pub name: String,
    pub files: Vec<FileCheck>,
    /// The patch could not be parsed or applied at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PatchCheck {
    pub fn is_clean(&self) -> bool {
        self.error.is_none() && self.files.iter().all(|f| f.rejected_hunks == 0)
    }
}

/// Dry run: permissively apply every patch in order and report per-file
/// outcomes without contacting the oracle. Only clean patches join the
/// baseline for later ones.
pub fn check(
    config: &Config,
    project: &str,
    change_request: &str,
) -> Result<Vec<PatchCheck>, FixError> {
    let (checkout, _lock) = open_project(config, project)?;
    let project_config = config
        .project(project)
        .map_err(|e| FixError::Config(e.to_string()))?;
    let store = PatchStore::new(&project_config.patches_dir);
    check_series(config, project, change_request, &checkout, &store)
}

pub fn check_series(
    config: &Config,
    project: &str,
    change_request: &str,
    checkout: &dyn Checkout,
    store: &PatchStore,
) -> Result<Vec<PatchCheck>, FixError> {
    let mut workspace = Workspace::new(checkout);
    let result = check_each(config, project, change_request, store, &mut workspace);
    workspace.reset()?;
    result
}

fn check_each(
    config: &Config,
    project: &str,
    change_request: &str,
    store: &PatchStore,
    workspace: &mut Workspace<'_>,
) -> Result<Vec<PatchCheck>, FixError> {
    let extractor = ContextExtractor::new(config.context.clone());
    let entries = store.list().map_err(storage_error(store.dir()))?;
    let mut checks = Vec::with_capacity(entries.len());

    for entry in &entries {
        let text = read_patch(store, entry)?;
        let mut check = PatchCheck {
            name: entry.name.clone(),
            files: Vec::new(),
            error: None,
        };
        let patch = match Patch::parse(&text) {
            Ok(patch) => patch,
            Err(e) => {
                check.error = Some(e.to_string());
                checks.push(check);
                continue;
            }
        };

        let input = ExtractionInput {
            project,
            change_request,
            patch_name: &entry.name,
            patch_text: &text,
            patch: &patch,
            attempt: 1,
            max_attempts: 1,
            expect_failure: false,
        };
        match extractor.extract(workspace, &input) {
            Ok(ctx) => {
                check.files = ctx
                    .files
                    .iter()
                    .map(|f| FileCheck {
                        path: f.path.clone(),
                        kind: f.kind.label().to_string(),
                        outcome: f.outcome.label(),
                        rejected_hunks: f.outcome.rejections().len(),
                        note: f.note.clone(),
                    })
                    .collect();
            }
            Err(e) if e.is_fatal() => return Err(FixError::Revert(e.to_string())),
            Err(e) => check.error = Some(e.to_string()),
        }

        tracing::info!(patch = %entry.name, clean = check.is_clean(), "patch checked");
        if check.is_clean() {
            workspace.accept(entry.name.clone(), patch);
        }
        checks.push(check);
    }
    Ok(checks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(build: Option<&str>, semantic: Option<&str>) -> ProjectConfig {
        ProjectConfig {
            checkout: PathBuf::from("/src/net"),
            patches_dir: PathBuf::from("/src/patches"),
            build_command: build.map(str::to_string),
            semantic_command: semantic.map(str::to_string),
            validation_timeout_secs: 60,
            required_symbols: Vec::new(),
        }
    }

    #[test]
    fn test_validators_for_skips_blank_commands() {
        assert_eq!(validators_for(&project(None, None)).len(), 1);
        assert_eq!(validators_for(&project(Some("make"), Some("  "))).len(), 2);
        let both = project(Some("make"), Some("make check"));
        assert_eq!(validators_for(&both).len(), 3);
    }

    #[test]
    fn test_attempt_limit_prefers_request_and_never_zero() {
        let config = Config::default();
        let mut request = FixRequest::default();
        assert_eq!(request.attempt_limit(&config), 3);
        request.max_attempts = Some(5);
        assert_eq!(request.attempt_limit(&config), 5);
        request.max_attempts = Some(0);
        assert_eq!(request.attempt_limit(&config), 1);
    }

    #[test]
    fn test_plan_single_patch_keeps_earlier_as_prefix() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["0001-a.patch", "0002-b.patch", "0003-c.patch"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        let store = PatchStore::new(dir.path());

        let (prefix, targets) = plan(&store, Some("2")).unwrap();
        let prefix: Vec<&str> = prefix.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(prefix, vec!["0001-a.patch"]);
        assert_eq!(targets[0].name, "0002-b.patch");

        let (prefix, targets) = plan(&store, None).unwrap();
        assert!(prefix.is_empty());
        assert_eq!(targets.len(), 3);

        assert!(matches!(plan(&store, Some("9")), Err(FixError::Config(_))));
    }
}
