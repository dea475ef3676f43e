//! `modelhost demo` command implementation
//!
//! Walks one model through its whole lifecycle: register with dedicated
//! workers, serve a batch twice (the second from cache), release.

use crate::context::CliContext;
use crate::error::CliResult;
use crate::output::{OutputFormat, print_json, workers_table};
use colored::Colorize;
use serde_json::json;
use std::time::Duration;

const REQUESTER: &str = "modelhost-cli";

pub async fn run(
    ctx: &CliContext,
    model: Option<&str>,
    workers: usize,
    device: &str,
) -> CliResult<()> {
    let service = &ctx.service;
    let model = model
        .unwrap_or(&service.config().worker_pool.default_embedding_model)
        .to_string();
    let texts = vec![
        "worker pools keep models warm".to_string(),
        "idle models are evicted".to_string(),
    ];

    let registration = service
        .register_model(&model, "embedding", workers, device, Some(REQUESTER))
        .await
        .into_result()?;
    let first = service
        .generate_embeddings(&texts, &model)
        .await
        .into_result()?;
    let second = service
        .generate_embeddings(&texts, &model)
        .await
        .into_result()?;
    let pool = service.get_worker_pool_status().into_result()?;
    let release = service
        .release_model(&model, true, Some(Duration::from_secs(5)))
        .await
        .into_result()?;

    match ctx.format {
        OutputFormat::Json => print_json(&json!({
            "registration": registration,
            "first": { "cached": first.cached, "worker_id": first.worker_id, "device": first.device },
            "second": { "cached": second.cached },
            "worker_pool": pool,
            "release": release,
        }))?,
        format => {
            println!(
                "{} registered {} on {} with {} workers ({} created)",
                "1.".bold(),
                registration.model_name.cyan(),
                registration.device,
                registration.workers,
                registration.workers_created
            );
            println!(
                "{} embedded {} texts on {} (cached={})",
                "2.".bold(),
                first.embeddings.len(),
                first.worker_id.as_deref().unwrap_or("direct"),
                first.cached
            );
            println!(
                "{} repeated the batch (cached={})",
                "3.".bold(),
                second.cached
            );
            if format == OutputFormat::Table {
                println!("{}", workers_table(&pool.workers));
            } else {
                println!(
                    "{} pool has {} workers, {} queued",
                    "4.".bold(),
                    pool.total_workers,
                    pool.global_queue_depth
                );
            }
            println!(
                "{} released {}: {} workers stopped, {} tasks dropped",
                "5.".bold(),
                release.model_name.cyan(),
                release.workers_stopped,
                release.tasks_dropped
            );
        }
    }
    Ok(())
}
