//! CLI command handlers.

mod harvest;
mod search;
mod source;

pub use harvest::{run_harvest_command, run_logs_command, run_serve_command};
pub use search::{run_providers_command, run_search_command};
pub use source::run_source_command;
