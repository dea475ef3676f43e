//! Output formatting for CLI commands.

use crate::error::CliResult;
use serde::Serialize;

mod table;

pub use table::{models_table, workers_table};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output for automation
    Json,
    /// Table-formatted output
    Table,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::Table => write!(f, "table"),
        }
    }
}

/// Print `value` as pretty JSON on stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Shorten a vector for display: `[0.1234, -0.5678, ... (384 values)]`.
pub fn preview(values: &[f32], shown: usize) -> String {
    let head: Vec<String> = values.iter().take(shown).map(|v| format!("{v:.4}")).collect();
    if values.len() > shown {
        format!("[{}, ... ({} values)]", head.join(", "), values.len())
    } else {
        format!("[{}]", head.join(", "))
    }
}
