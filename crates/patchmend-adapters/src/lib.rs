//! Runtime adapters for patchmend (git checkout, config, patch series, external checks).

pub mod config;
pub mod git_ops;
pub mod lock;
pub mod patch_store;
pub mod util;
pub mod validate;

pub use config::{Config, ContextSettings, OracleSettings, ProjectConfig};
pub use git_ops::GitCheckout;
pub use lock::RunLock;
pub use patch_store::{PatchEntry, PatchStore};
pub use validate::CommandValidator;
