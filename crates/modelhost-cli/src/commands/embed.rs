//! `modelhost embed` command implementation

use crate::context::CliContext;
use crate::error::CliResult;
use crate::output::{OutputFormat, preview, print_json};
use colored::Colorize;

pub async fn run(ctx: &CliContext, texts: &[String], model: Option<&str>) -> CliResult<()> {
    let model = model
        .unwrap_or(&ctx.service.config().worker_pool.default_embedding_model)
        .to_string();
    let response = ctx
        .service
        .generate_embeddings(texts, &model)
        .await
        .into_result()?;

    if ctx.format == OutputFormat::Json {
        return print_json(&response);
    }

    let served_by = match (&response.worker_id, response.device) {
        (Some(worker), Some(device)) => format!("{worker} on {device}"),
        (None, Some(device)) => format!("direct on {device}"),
        _ if response.cached => "cache".to_string(),
        _ => "-".to_string(),
    };
    println!(
        "{} {} vectors of dimension {} from {} ({}, {:.1} ms)",
        "✓".green(),
        response.embeddings.len(),
        response.dimension,
        response.model_id.cyan(),
        served_by,
        response.processing_time * 1000.0
    );
    for (text, embedding) in texts.iter().zip(&response.embeddings) {
        println!("  {text:?}: {}", preview(embedding, 4));
    }
    Ok(())
}
