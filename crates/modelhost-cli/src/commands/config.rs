//! `modelhost config` command implementation

use crate::cli::Cli;
use crate::context::load_config;
use crate::error::CliResult;
use crate::output::print_json;

/// Print the effective configuration. Always JSON; it is already structured.
pub fn run(cli: &Cli) -> CliResult<()> {
    let config = load_config(cli)?;
    print_json(&config)
}
