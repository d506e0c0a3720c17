#![allow(dead_code)]

use patchmend_adapters::{Config, OracleSettings, PatchStore};
use patchmend_core::{
    CandidateFix, Checkout, CheckoutError, FixError, OracleError, Patch, RepairOracle,
    RepairRequest, ValidationError, ValidationTarget, Validator,
};
use patchmend_engine::llm::{interpret_response, output_budget, Usage};
use patchmend_engine::{run_series, FixRequest, RunReport, Session};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;
use tempfile::TempDir;

// ═══════════════════════════════════════════════════════════════════════════════
// FIXTURES
// ═══════════════════════════════════════════════════════════════════════════════

pub const A_C: &str = "int a(void)\n{\n\treturn 1;\n}\n";
/// Upstream renamed `b_old` since the patch was written.
pub const B_C: &str = "int b_new(void)\n{\n\treturn 2;\n}\n";

pub const A_HUNK: &str = "--- a/src/a.c\n+++ b/src/a.c\n@@ -1,4 +1,5 @@\n int a(void)\n {\n+\t/* patched */\n \treturn 1;\n }\n";
pub const B_STALE_HUNK: &str = "--- a/src/b.c\n+++ b/src/b.c\n@@ -1,4 +1,5 @@\n int b_old(void)\n {\n+\tlog_call();\n \treturn 2;\n }\n";
pub const B_FIXED_HUNK: &str = "--- a/src/b.c\n+++ b/src/b.c\n@@ -1,4 +1,5 @@\n int b_new(void)\n {\n+\tlog_call();\n \treturn 2;\n }\n";

/// Depends on the line [`A_HUNK`] adds.
pub const A_FOLLOW_UP: &str = "--- a/src/a.c\n+++ b/src/a.c\n@@ -2,4 +2,4 @@\n {\n-\t/* patched */\n+\t/* patched twice */\n \treturn 1;\n }\n";

pub fn clean_patch() -> String {
    A_HUNK.to_string()
}

pub fn failing_patch() -> String {
    format!("{}{}", A_HUNK, B_STALE_HUNK)
}

pub fn fixed_patch() -> String {
    format!("{}{}", A_HUNK, B_FIXED_HUNK)
}

pub fn fenced(diff: &str) -> String {
    format!("The function was renamed upstream.\n\n```diff\n{diff}```\n")
}

pub fn tree(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (path, content) in files {
        let full = dir.path().join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }
    dir
}

/// A source tree and a patches directory kept apart from it.
pub struct Project {
    pub repo: TempDir,
    pub patches: TempDir,
    pub checkout: SnapshotCheckout,
}

impl Project {
    pub fn new(series: &[(&str, &str)]) -> Self {
        let repo = tree(&[("src/a.c", A_C), ("src/b.c", B_C)]);
        let patches = tree(series);
        let checkout = SnapshotCheckout::new(repo.path());
        Self {
            repo,
            patches,
            checkout,
        }
    }

    pub fn store(&self) -> PatchStore {
        PatchStore::new(self.patches.path())
    }

    pub fn patch_text(&self, name: &str) -> String {
        fs::read_to_string(self.patches.path().join(name)).unwrap()
    }

    pub fn checkout_root(&self) -> &Path {
        self.checkout.root()
    }

    pub fn source(&self, rel: &str) -> String {
        fs::read_to_string(self.checkout.root().join(rel)).unwrap()
    }

    pub fn is_clean(&self) -> bool {
        self.checkout.dirty_paths().unwrap().is_empty()
    }
}

pub fn config() -> Config {
    Config::default()
}

/// Run the series through `run_series` with the given doubles.
pub async fn run(
    project: &Project,
    oracle: &dyn RepairOracle,
    validator: &dyn Validator,
    max_attempts: u32,
    only_patch: Option<&str>,
) -> (RunReport, Result<(), FixError>) {
    let config = config();
    let store = project.store();
    let request = FixRequest {
        project: "net".to_string(),
        change_request: "CR-1042".to_string(),
        max_attempts: Some(max_attempts),
        only_patch: only_patch.map(str::to_string),
    };
    let session = Session {
        checkout: &project.checkout,
        store: &store,
        oracle,
        validator,
    };
    let mut report = RunReport::new("net", "CR-1042", "scripted", max_attempts);
    let result = run_series(&config, &request, &session, &mut report).await;
    (report, result)
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHECKOUT
// ═══════════════════════════════════════════════════════════════════════════════

/// Committed state is a snapshot of the directory taken at construction.
pub struct SnapshotCheckout {
    root: PathBuf,
    committed: BTreeMap<PathBuf, Vec<u8>>,
}

fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, out);
        } else if let Ok(bytes) = fs::read(&path) {
            out.insert(path.strip_prefix(root).unwrap().to_path_buf(), bytes);
        }
    }
}

pub fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

impl SnapshotCheckout {
    pub fn new(root: &Path) -> Self {
        let root = root.canonicalize().unwrap();
        Self {
            committed: snapshot(&root),
            root,
        }
    }
}

impl Checkout for SnapshotCheckout {
    fn root(&self) -> &Path {
        &self.root
    }

    fn reset_clean(&self) -> Result<(), CheckoutError> {
        for rel in snapshot(&self.root).keys() {
            if !self.committed.contains_key(rel) {
                fs::remove_file(self.root.join(rel)).unwrap();
            }
        }
        for (rel, bytes) in &self.committed {
            let path = self.root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, bytes).unwrap();
        }
        Ok(())
    }

    fn dirty_paths(&self) -> Result<Vec<String>, CheckoutError> {
        let current = snapshot(&self.root);
        let mut dirty: Vec<String> = current
            .iter()
            .filter(|(rel, bytes)| self.committed.get(*rel) != Some(*bytes))
            .map(|(rel, _)| rel.display().to_string())
            .collect();
        dirty.extend(
            self.committed
                .keys()
                .filter(|rel| !current.contains_key(*rel))
                .map(|rel| rel.display().to_string()),
        );
        Ok(dirty)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ORACLE
// ═══════════════════════════════════════════════════════════════════════════════

pub enum Reply {
    /// A complete response well inside the budget.
    Text(String),
    /// A response that used the whole budget and stopped on length.
    Truncated(String),
    /// Bypasses response interpretation and hands the diff straight over.
    Raw(String),
    Fail(OracleError),
}

/// Replays scripted replies through the real response interpretation and
/// remembers every request with the budget it would have been sent with.
pub struct ScriptedOracle {
    settings: OracleSettings,
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<(RepairRequest, u32)>>,
}

impl ScriptedOracle {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            settings: OracleSettings::default(),
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<RepairRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(r, _)| r.clone())
            .collect()
    }

    pub fn budgets(&self) -> Vec<u32> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, b)| *b)
            .collect()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn answer(&self, request: &RepairRequest) -> Result<CandidateFix, OracleError> {
        let budget = output_budget(
            &self.settings,
            request.expected_files.len(),
            request.escalation,
        );
        self.requests
            .lock()
            .unwrap()
            .push((request.clone(), budget.max_tokens));

        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Text(text)) => interpret_response(
                &text,
                Some("stop"),
                Some(Usage {
                    prompt_tokens: Some(900),
                    completion_tokens: Some(120),
                }),
                budget.max_tokens,
                &request.expected_files,
            ),
            Some(Reply::Truncated(text)) => interpret_response(
                &text,
                Some("length"),
                Some(Usage {
                    prompt_tokens: Some(900),
                    completion_tokens: Some(budget.max_tokens),
                }),
                budget.max_tokens,
                &request.expected_files,
            ),
            Some(Reply::Raw(diff)) => Patch::parse(&diff)
                .map(|patch| CandidateFix::new(patch, None, None))
                .map_err(|e| OracleError::Parse(e.to_string())),
            Some(Reply::Fail(err)) => Err(err),
            None => Err(OracleError::Parse("no scripted reply left".to_string())),
        }
    }
}

impl RepairOracle for ScriptedOracle {
    fn propose<'a>(
        &'a self,
        request: &'a RepairRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CandidateFix, OracleError>> + Send + 'a>> {
        Box::pin(async move { self.answer(request) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// VALIDATOR
// ═══════════════════════════════════════════════════════════════════════════════

/// What the tree looked like when a validation ran.
#[derive(Debug, Clone)]
pub struct Observation {
    pub b_c: String,
    pub reject_files: usize,
}

/// Pops scripted verdicts (passing once they run out) and records the tree
/// it was asked to judge.
#[derive(Default)]
pub struct ScriptedValidator {
    verdicts: Mutex<VecDeque<Result<(), ValidationError>>>,
    seen: Mutex<Vec<Observation>>,
}

impl ScriptedValidator {
    pub fn new(verdicts: Vec<Result<(), ValidationError>>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn observations(&self) -> Vec<Observation> {
        self.seen.lock().unwrap().clone()
    }
}

impl Validator for ScriptedValidator {
    fn name(&self) -> &str {
        "scripted"
    }

    fn validate(&self, root: &Path, _target: &ValidationTarget<'_>) -> Result<(), ValidationError> {
        let reject_files = snapshot(root)
            .keys()
            .filter(|p| p.to_string_lossy().ends_with(".rej"))
            .count();
        self.seen.lock().unwrap().push(Observation {
            b_c: fs::read_to_string(root.join("src/b.c")).unwrap_or_default(),
            reject_files,
        });
        self.verdicts.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}
