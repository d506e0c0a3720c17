pub mod budget;
pub mod client;
pub mod models;
pub mod parse;
pub mod throttle;

pub use budget::{output_budget, OutputBudget};
pub use client::OracleClient;
pub use models::Usage;
pub use parse::{extract_diff, interpret_response, ExtractedDiff};
