//! Configuration management for patchmend
//!
//! Stores settings in ~/.config/patchmend/config.json

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "anthropic/claude-3.7-sonnet";

const API_KEY_VARS: &[&str] = &["PATCHMEND_API_KEY", "OPENROUTER_API_KEY", "OPENAI_API_KEY"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleSettings {
    pub endpoint: String,
    pub model: String,
    pub requests_per_minute: u32,
    pub max_quota_retries: u32,
    pub request_timeout_secs: u64,
    pub output_ceiling_tokens: u32,
    /// Ceiling when the endpoint's extended-output tier is enabled.
    pub extended_output_ceiling_tokens: u32,
    pub extended_output: bool,
    pub min_output_tokens: u32,
    pub tokens_per_file: u32,
    pub token_margin: u32,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            requests_per_minute: 20,
            max_quota_retries: 4,
            request_timeout_secs: 300,
            output_ceiling_tokens: 8_192,
            extended_output_ceiling_tokens: 64_000,
            extended_output: true,
            min_output_tokens: 1_024,
            tokens_per_file: 1_500,
            token_margin: 1_024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Lines shown either side of an affected region.
    pub window_radius: usize,
    pub max_window_lines: usize,
    /// How far from the hinted line to look for the best-matching region.
    pub alignment_radius: usize,
    pub prompt_char_budget: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            window_radius: 15,
            max_window_lines: 120,
            alignment_radius: 200,
            prompt_char_budget: 120_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub checkout: PathBuf,
    pub patches_dir: PathBuf,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub semantic_command: Option<String>,
    #[serde(default = "default_validation_timeout_secs")]
    pub validation_timeout_secs: u64,
    /// Symbols that must still be defined after a fix applies.
    #[serde(default)]
    pub required_symbols: Vec<String>,
}

fn default_validation_timeout_secs() -> u64 {
    900
}

/// Absolute form of `path`, resolving symlinks when the path exists.
fn absolute(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

impl ProjectConfig {
    /// Repaired patches and run reports must live outside the checkout,
    /// which every run resets to HEAD.
    pub fn validate_layout(&self, name: &str, report_dir: &Path) -> Result<()> {
        if self.checkout.as_os_str().is_empty() {
            bail!("Project '{}' has no checkout path", name);
        }
        if self.patches_dir.as_os_str().is_empty() {
            bail!("Project '{}' has no patches_dir", name);
        }
        let checkout = absolute(&self.checkout);
        if absolute(&self.patches_dir).starts_with(&checkout) {
            bail!(
                "Project '{}': patches_dir {} is inside the checkout {}; repaired patches would be discarded when the checkout is reset",
                name,
                self.patches_dir.display(),
                checkout.display()
            );
        }
        if absolute(report_dir).starts_with(&checkout) {
            bail!(
                "Project '{}': report directory {} is inside the checkout {}",
                name,
                report_dir.display(),
                checkout.display()
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub oracle: OracleSettings,
    pub max_attempts: u32,
    /// How many recent diagnostics the prompt may carry. 1 means only the
    /// current one.
    pub history_depth: usize,
    pub context: ContextSettings,
    pub report_dir: Option<PathBuf>,
    pub projects: BTreeMap<String, ProjectConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            oracle: OracleSettings::default(),
            max_attempts: 3,
            history_depth: 1,
            context: ContextSettings::default(),
            report_dir: None,
            projects: BTreeMap::new(),
        }
    }
}

impl Config {
    fn sanitize(&mut self) {
        self.max_attempts = self.max_attempts.max(1);
        self.history_depth = self.history_depth.max(1);
        self.oracle.requests_per_minute = self.oracle.requests_per_minute.max(1);
        self.oracle.min_output_tokens = self
            .oracle
            .min_output_tokens
            .min(self.oracle.output_ceiling_tokens);
        self.oracle.endpoint = self.oracle.endpoint.trim().to_string();
    }

    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("patchmend"))
    }

    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Where locks and run reports live. Never inside a checkout.
    pub fn state_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("patchmend")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.report_dir
            .clone()
            .unwrap_or_else(|| Self::state_dir().join("reports"))
    }

    /// Load config from disk with environment overrides applied, or defaults.
    pub fn load() -> Self {
        let mut config = Self::config_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// A missing file yields defaults; a corrupt one is set aside as
    /// `config.json.corrupt` and also yields defaults.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str::<Config>(&content) {
            Ok(mut config) => {
                config.sanitize();
                config
            }
            Err(err) => {
                preserve_corrupt_config(path, &content);
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<PathBuf> {
        let path =
            Self::config_path().ok_or_else(|| anyhow!("Could not determine config directory"))?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let mut sanitized = self.clone();
        sanitized.sanitize();

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                    tracing::debug!(error = %e, "failed to set config directory permissions");
                }
            }
        }

        let content =
            serde_json::to_string_pretty(&sanitized).context("Failed to serialize config")?;
        write_atomic(path, &content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup("PATCHMEND_MODEL").filter(|v| !v.trim().is_empty()) {
            self.oracle.model = model.trim().to_string();
        }
        if let Some(endpoint) = lookup("PATCHMEND_ENDPOINT").filter(|v| !v.trim().is_empty()) {
            self.oracle.endpoint = endpoint.trim().to_string();
        }
        if let Some(raw) = lookup("PATCHMEND_MAX_ATTEMPTS") {
            match raw.trim().parse::<u32>() {
                Ok(n) if n > 0 => self.max_attempts = n,
                _ => tracing::warn!(value = %raw, "ignoring invalid PATCHMEND_MAX_ATTEMPTS"),
            }
        }
        self.sanitize();
    }

    /// First non-empty credential from the known environment variables.
    pub fn api_key() -> Option<String> {
        Self::api_key_from(|key| std::env::var(key).ok())
    }

    pub fn api_key_from<F>(lookup: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        API_KEY_VARS
            .iter()
            .filter_map(|var| lookup(var))
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    }

    /// Checks that only matter once a run is about to start.
    pub fn validate(&self) -> Result<()> {
        let endpoint = url::Url::parse(&self.oracle.endpoint)
            .with_context(|| format!("Invalid oracle endpoint '{}'", self.oracle.endpoint))?;
        if !matches!(endpoint.scheme(), "https" | "http") {
            bail!(
                "Oracle endpoint must use http or https, got '{}'",
                endpoint.scheme()
            );
        }
        if self.oracle.model.trim().is_empty() {
            bail!("Oracle model is not set");
        }
        if self.oracle.output_ceiling_tokens == 0 {
            bail!("oracle.output_ceiling_tokens must be positive");
        }
        let report_dir = self.reports_dir();
        for (name, project) in &self.projects {
            project.validate_layout(name, &report_dir)?;
        }
        Ok(())
    }

    pub fn project(&self, name: &str) -> Result<&ProjectConfig> {
        self.projects.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.projects.keys().map(String::as_str).collect();
            if known.is_empty() {
                anyhow!(
                    "Unknown project '{}': no projects are configured in {}",
                    name,
                    Self::config_location()
                )
            } else {
                anyhow!(
                    "Unknown project '{}' (configured: {})",
                    name,
                    known.join(", ")
                )
            }
        })
    }

    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/patchmend/config.json".to_string())
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

/// Write via a sibling temp file and rename, so readers never see a partial
/// file. The file is created 0600 on unix.
pub fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    use std::fs::OpenOptions;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp_path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}
