//! Core model for patchmend.
//!
//! Holds the unified-diff model, the in-memory hunk matcher, the attempt data
//! model handed between the extractor, prompt builder and orchestrator, and the
//! capability traits the engine is driven through.

pub mod error;
pub mod matcher;
pub mod model;
pub mod patch;
pub mod protocol;

pub use error::{
    CheckoutError, ExtractionError, FileRejection, FixError, OracleError, PatchApplyError,
    PatchParseError, ValidationError,
};
pub use model::{
    AlignmentRow, AlignmentTag, AttemptContext, AttemptResult, CandidateFix, ContentWindow,
    FileOutcome, FileState, HunkAlignment, OracleUsage, RejectionRecord,
};
pub use patch::{ChangeKind, Hunk, HunkLine, Patch, PatchFile};
pub use protocol::{Checkout, RepairOracle, RepairRequest, ValidationTarget, Validator};
