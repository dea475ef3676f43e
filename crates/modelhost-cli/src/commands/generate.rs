//! `modelhost generate` command implementation

use crate::context::CliContext;
use crate::error::CliResult;
use crate::output::{OutputFormat, print_json};
use colored::Colorize;
use modelhost_kernel::GenerationParams;

pub async fn run(
    ctx: &CliContext,
    prompt: &str,
    model: &str,
    max_new_tokens: usize,
    temperature: Option<f32>,
) -> CliResult<()> {
    let mut params = GenerationParams::default().with_max_new_tokens(max_new_tokens);
    if let Some(temperature) = temperature {
        params = params.with_temperature(temperature);
    }
    let response = ctx
        .service
        .generate_text(prompt, model, params)
        .await
        .into_result()?;

    if ctx.format == OutputFormat::Json {
        return print_json(&response);
    }

    println!("{}", response.text);
    println!(
        "{}",
        format!(
            "{} | {} prompt + {} completion tokens | {:.1} ms",
            response.model_id,
            response.prompt_tokens,
            response.completion_tokens,
            response.processing_time * 1000.0
        )
        .dimmed()
    );
    Ok(())
}
