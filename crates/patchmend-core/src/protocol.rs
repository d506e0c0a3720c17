//! Capabilities the orchestrator is driven through.
//!
//! Production implementations live in `patchmend-adapters` and
//! `patchmend-engine`; tests substitute in-process doubles.

use crate::error::{CheckoutError, OracleError, ValidationError};
use crate::model::CandidateFix;
use crate::patch::Patch;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

/// The working tree a run owns.
pub trait Checkout: Send + Sync {
    fn root(&self) -> &Path;

    /// Discard tracked modifications and remove untracked files, ignored
    /// ones included.
    fn reset_clean(&self) -> Result<(), CheckoutError>;

    /// Paths that differ from the committed state.
    fn dirty_paths(&self) -> Result<Vec<String>, CheckoutError>;
}

/// What a post-apply check is judging.
#[derive(Debug, Clone, Copy)]
pub struct ValidationTarget<'a> {
    /// The patch now applied to the tree.
    pub applied: &'a Patch,
    /// The patch it replaces.
    pub original: &'a Patch,
}

pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, root: &Path, target: &ValidationTarget<'_>) -> Result<(), ValidationError>;
}

/// One rendered prompt plus what the client needs to size the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairRequest {
    pub system: String,
    pub user: String,
    /// Files the response must cover.
    pub expected_files: Vec<String>,
    /// Multiplier on the response budget, doubled after each truncation.
    pub escalation: u32,
}

pub trait RepairOracle: Send + Sync {
    fn propose<'a>(
        &'a self,
        request: &'a RepairRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CandidateFix, OracleError>> + Send + 'a>>;
}
