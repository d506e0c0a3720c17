//! Build and semantic checks delegated to the project's own harness.

use crate::util::{run_command_with_timeout, tail};
use patchmend_core::{ValidationError, ValidationTarget, Validator};
use std::path::Path;
use std::process::Command;
use std::time::Duration;

/// How much harness output is kept in a diagnostic.
const DIAGNOSTIC_TAIL_CHARS: usize = 4_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Build,
    Semantic,
}

/// Runs a shell command in the checkout; a non-zero exit or timeout fails.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    name: String,
    command: String,
    kind: CheckKind,
    timeout: Duration,
}

impl CommandValidator {
    pub fn build(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: "build".to_string(),
            command: command.into(),
            kind: CheckKind::Build,
            timeout,
        }
    }

    pub fn semantic(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: "semantic".to_string(),
            command: command.into(),
            kind: CheckKind::Semantic,
            timeout,
        }
    }

    fn fail(&self, message: String) -> ValidationError {
        match self.kind {
            CheckKind::Build => ValidationError::Build(message),
            CheckKind::Semantic => ValidationError::Semantic(message),
        }
    }
}

impl Validator for CommandValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, root: &Path, _target: &ValidationTarget<'_>) -> Result<(), ValidationError> {
        let mut cmd = Command::new("sh");
        cmd.current_dir(root).args(["-lc", &self.command]);

        tracing::debug!(check = %self.name, command = %self.command, "running check");
        let result = run_command_with_timeout(&mut cmd, self.timeout)
            .map_err(|e| self.fail(format!("`{}` could not run: {}", self.command, e)))?;

        if result.timed_out {
            return Err(self.fail(format!(
                "`{}` timed out after {}s\n{}",
                self.command,
                self.timeout.as_secs(),
                tail(&result.combined_output(), DIAGNOSTIC_TAIL_CHARS)
            )));
        }
        if !result.success() {
            let code = result
                .status
                .and_then(|s| s.code())
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(self.fail(format!(
                "`{}` exited with {}\n{}",
                self.command,
                code,
                tail(&result.combined_output(), DIAGNOSTIC_TAIL_CHARS)
            )));
        }

        tracing::debug!(
            check = %self.name,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "check passed"
        );
        Ok(())
    }
}
