//! In-process semantic check and validator composition.

use patchmend_adapters::util::resolve_repo_path_allow_new;
use patchmend_core::{ChangeKind, Patch, ValidationError, ValidationTarget, Validator};
use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

/// Definition patterns, one capture group for the defined name.
const DEFINITION_PATTERNS: &[&str] = &[
    // Rust
    r#"^(?:pub(?:\([^)]*\))?\s+)?(?:(?:const|async|unsafe|extern\s+"[^"]*")\s+)*fn\s+([A-Za-z_]\w*)"#,
    r"^(?:pub(?:\([^)]*\))?\s+)?(?:struct|enum|trait|type|union|mod)\s+([A-Za-z_]\w*)",
    r"^macro_rules!\s*([A-Za-z_]\w*)",
    r"^(?:pub(?:\([^)]*\))?\s+)?(?:const|static)\s+(?:mut\s+)?([A-Za-z_]\w*)\s*:",
    // Python
    r"^(?:async\s+)?def\s+([A-Za-z_]\w*)\s*\(",
    r"^class\s+([A-Za-z_]\w*)",
    // Go
    r"^func\s+(?:\([^)]*\)\s*)?([A-Za-z_]\w*)\s*\(",
    r"^type\s+([A-Za-z_]\w*)\s+",
    // JavaScript / TypeScript
    r"^(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)",
    r"^(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+([A-Za-z_$][\w$]*)",
    r"^(?:export\s+)?(?:interface|enum)\s+([A-Za-z_$][\w$]*)",
    // C / C++
    r"^#\s*define\s+([A-Za-z_]\w*)",
    r"^(?:typedef\s+)?(?:struct|enum|union|class)\s+([A-Za-z_]\w*)\s*\{?\s*$",
    r"^[A-Za-z_][\w\s\*]*?[\s\*]([A-Za-z_]\w*)\s*\([^;{}]*\)\s*\{?\s*$",
];

/// Names the C function pattern picks up from control flow.
const NOT_SYMBOLS: &[&str] = &[
    "if", "else", "for", "while", "switch", "return", "sizeof", "case", "do", "goto",
];

fn definition_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        DEFINITION_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

/// The name a line defines, if it looks like a definition.
pub fn defined_symbol(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    definition_patterns().iter().find_map(|re| {
        let name = re.captures(trimmed)?.get(1)?.as_str();
        if NOT_SYMBOLS.contains(&name) {
            None
        } else {
            Some(name.to_string())
        }
    })
}

/// Symbols defined on the patch's added lines.
pub fn symbols_added_by(patch: &Patch) -> BTreeSet<String> {
    patch
        .files
        .iter()
        .filter(|f| f.kind != ChangeKind::Delete)
        .flat_map(|f| f.hunks.iter())
        .flat_map(|h| h.added_lines())
        .filter_map(defined_symbol)
        .collect()
}

fn is_word_present(haystack: &str, word: &str) -> bool {
    Regex::new(&format!(r"\b{}\b", regex::escape(word)))
        .map(|re| re.is_match(haystack))
        .unwrap_or_else(|_| haystack.contains(word))
}

/// Requires that symbols the original patch introduced, plus configured
/// required symbols, still exist in the files the patches touch.
#[derive(Debug, Clone, Default)]
pub struct SymbolValidator {
    required: Vec<String>,
}

impl SymbolValidator {
    pub fn new(required: Vec<String>) -> Self {
        Self { required }
    }

    /// Current content of every surviving file either patch names.
    fn touched_content(root: &Path, target: &ValidationTarget<'_>) -> Vec<(String, String)> {
        let deleted: BTreeSet<&str> = target
            .applied
            .files
            .iter()
            .filter(|f| f.kind == ChangeKind::Delete)
            .map(|f| f.path.as_str())
            .collect();
        let paths: BTreeSet<&str> = target
            .applied
            .files
            .iter()
            .chain(target.original.files.iter())
            .map(|f| f.path.as_str())
            .filter(|p| !deleted.contains(p))
            .collect();

        paths
            .into_iter()
            .filter_map(|rel| {
                let resolved = resolve_repo_path_allow_new(root, Path::new(rel)).ok()?;
                let content = fs::read_to_string(&resolved.absolute).ok()?;
                Some((rel.to_string(), content))
            })
            .collect()
    }
}

impl Validator for SymbolValidator {
    fn name(&self) -> &str {
        "symbols"
    }

    fn validate(&self, root: &Path, target: &ValidationTarget<'_>) -> Result<(), ValidationError> {
        let files = Self::touched_content(root, target);

        let defined: BTreeSet<String> = files
            .iter()
            .flat_map(|(_, content)| content.lines())
            .filter_map(defined_symbol)
            .collect();

        let mut missing: Vec<String> = symbols_added_by(target.original)
            .into_iter()
            .filter(|s| !defined.contains(s))
            .collect();
        missing.extend(
            self.required
                .iter()
                .filter(|s| !files.iter().any(|(_, c)| is_word_present(c, s)))
                .cloned(),
        );

        tracing::debug!(
            files = files.len(),
            missing = missing.len(),
            "symbol check finished"
        );
        if missing.is_empty() {
            return Ok(());
        }
        Err(ValidationError::Semantic(format!(
            "symbols no longer defined after applying the patch: {}",
            missing.join(", ")
        )))
    }
}

/// Runs validators in order; the first failure wins.
#[derive(Default)]
pub struct ValidatorChain {
    validators: Vec<Box<dyn Validator>>,
}

impl ValidatorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    pub fn push(&mut self, validator: Box<dyn Validator>) {
        self.validators.push(validator);
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

impl Validator for ValidatorChain {
    fn name(&self) -> &str {
        "chain"
    }

    fn validate(&self, root: &Path, target: &ValidationTarget<'_>) -> Result<(), ValidationError> {
        for validator in &self.validators {
            if let Err(err) = validator.validate(root, target) {
                tracing::info!(check = validator.name(), error = %err, "validation failed");
                return Err(err);
            }
            tracing::debug!(check = validator.name(), "validation passed");
        }
        Ok(())
    }
}
