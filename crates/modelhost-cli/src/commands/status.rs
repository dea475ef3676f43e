//! `modelhost status` command implementation

use crate::context::CliContext;
use crate::error::CliResult;
use crate::output::{OutputFormat, models_table, print_json, workers_table};
use colored::Colorize;

pub async fn run(ctx: &CliContext) -> CliResult<()> {
    let status = ctx.service.get_service_status().into_result()?;

    match ctx.format {
        OutputFormat::Json => print_json(&status)?,
        OutputFormat::Table => {
            println!("{}", workers_table(&status.worker_pool.workers));
            if !status.models.is_empty() {
                println!("{}", models_table(&status.models));
            }
        }
        OutputFormat::Text => {
            let pool = &status.worker_pool;
            println!("{}", "modelhost status".bold());
            println!("  started:        {}", status.started);
            println!("  execution mode: {:?}", status.execution_mode);
            let pool_state = if pool.enabled {
                "enabled".green()
            } else {
                "disabled".red()
            };
            println!("  worker pool:    {pool_state}");
            if let Some(reason) = &pool.disabled_reason {
                println!("  disabled by:    {}", reason.to_string().red());
            }
            let devices: Vec<String> = pool.devices.iter().map(ToString::to_string).collect();
            println!("  devices:        {}", devices.join(", "));
            println!("  workers:        {}/{}", pool.total_workers, pool.max_workers);
            for (state, count) in &pool.workers_by_state {
                println!("    {state:<10} {count}");
            }
            println!("  queue depth:    {}", pool.global_queue_depth);
            println!(
                "  cache:          {} entries, {} hits, {} misses",
                status.cache.entries, status.cache.hits, status.cache.misses
            );
            for model in &status.models {
                println!(
                    "  model {} ({}) on {}: {} workers, {} refs, loaded={}",
                    model.model_name.cyan(),
                    model.model_type,
                    model.device,
                    model.workers,
                    model.reference_count,
                    model.loaded
                );
            }
        }
    }
    Ok(())
}
