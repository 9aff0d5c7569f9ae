//! CLI domain: parse, route, output and presentation only.
//! Query orchestration lives in the controller; handlers stay thin.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{Cli, Commands};
pub use presentation::{
    format_check_report, format_event_json, format_event_text, format_sites_json,
    format_sites_text, CheckReport,
};
pub use route::{CommandOutput, RunContext};
