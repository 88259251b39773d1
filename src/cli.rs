//! CLI domain: parse, route, output, and presentation only.
//! No scheduling logic; the route table drives the coordinator through the API.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{Cli, Commands};
pub use presentation::{
    format_batch_validation, format_progress_line, format_providers, format_run_result,
    OutputFormat, ProviderRow, WrittenImage,
};
pub use route::RunContext;
