//! `modelhost download` command implementation

use crate::context::CliContext;
use crate::error::CliResult;
use crate::output::{OutputFormat, print_json};
use colored::Colorize;
use modelhost_backend::DownloadStatus;
use modelhost_kernel::ModelType;

pub async fn run(ctx: &CliContext, model: &str, model_type: Option<&str>) -> CliResult<()> {
    let model_type = model_type.map(str::parse::<ModelType>).transpose()?;
    let status = ctx
        .service
        .download_model(model, model_type)
        .await
        .into_result()?;

    if ctx.format == OutputFormat::Json {
        return print_json(&status);
    }

    match &status {
        DownloadStatus::AlreadyCached { path } => {
            println!("{} {} already cached at {}", "✓".green(), model.cyan(), path.display());
        }
        DownloadStatus::Downloaded { path } => {
            println!("{} downloaded {} to {}", "✓".green(), model.cyan(), path.display());
        }
    }
    Ok(())
}
