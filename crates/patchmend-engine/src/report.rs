use crate::orchestrator::PatchOutcome;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Everything one `fix` run did, written as JSON next to earlier runs.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub project: String,
    pub change_request: String,
    pub model: String,
    pub max_attempts: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub patches: Vec<PatchOutcome>,
    /// Set when the run stopped on an unrecoverable error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
}

impl RunReport {
    pub fn new(project: &str, change_request: &str, model: &str, max_attempts: u32) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            project: project.to_string(),
            change_request: change_request.to_string(),
            model: model.to_string(),
            max_attempts,
            started_at: Utc::now(),
            finished_at: None,
            patches: Vec::new(),
            fatal_error: None,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn all_applied(&self) -> bool {
        self.fatal_error.is_none() && self.patches.iter().all(|p| p.status.is_applied())
    }

    pub fn oracle_calls(&self) -> u32 {
        self.patches.iter().map(|p| p.oracle_calls).sum()
    }

    /// Write `<dir>/<run_id>.json`.
    pub fn write_to(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let report_path = dir.join(format!("{}.json", self.run_id));
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&report_path, content)?;
        Ok(report_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::PatchStatus;

    #[test]
    fn test_report_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = RunReport::new("net", "42", "model/x", 3);
        report.patches.push(PatchOutcome {
            name: "0001-a.patch".to_string(),
            status: PatchStatus::AlreadyClean,
            oracle_calls: 0,
            attempts: Vec::new(),
        });
        report.finish();

        let path = report.write_to(&dir.path().join("reports")).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            format!("{}.json", report.run_id)
        );
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["project"], "net");
        assert_eq!(value["patches"][0]["status"], "already_clean");
        assert!(value["finished_at"].is_string());
        assert!(value.get("fatal_error").is_none());
        assert!(report.all_applied());
    }

    #[test]
    fn test_fatal_error_means_not_applied() {
        let mut report = RunReport::new("net", "42", "model/x", 3);
        report.fatal_error = Some("lock held".to_string());
        assert!(!report.all_applied());
        assert_eq!(report.oracle_calls(), 0);
    }
}
