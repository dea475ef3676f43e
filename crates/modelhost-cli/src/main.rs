//! modelhost CLI - inspect and drive a local model worker pool

mod cli;
mod commands;
mod context;
mod error;
mod output;

use clap::Parser;
use cli::{Cli, Commands};
use context::CliContext;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output on stdout stays parseable
    let level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_command_async(cli))
}

async fn run_command_async(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Config = cli.command {
        commands::config::run(&cli)?;
        return Ok(());
    }

    let ctx = CliContext::start(&cli).await?;
    let result = match &cli.command {
        Commands::Status => commands::status::run(&ctx).await,
        Commands::Embed { texts, model } => {
            commands::embed::run(&ctx, texts, model.as_deref()).await
        }
        Commands::Generate {
            prompt,
            model,
            max_new_tokens,
            temperature,
        } => commands::generate::run(&ctx, prompt, model, *max_new_tokens, *temperature).await,
        Commands::Download { model, model_type } => {
            commands::download::run(&ctx, model, model_type.as_deref()).await
        }
        Commands::Demo {
            model,
            workers,
            device,
        } => commands::demo::run(&ctx, model.as_deref(), *workers, device).await,
        Commands::Config => Ok(()),
    };
    ctx.shutdown().await;
    result?;
    Ok(())
}
