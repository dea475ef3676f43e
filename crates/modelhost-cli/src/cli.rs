//! CLI command definitions using clap

use crate::output::OutputFormat;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// modelhost - run embedding and text generation models on a local worker pool
#[derive(Parser)]
#[command(name = "modelhost")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json, table)
    #[arg(short = 'o', long, global = true)]
    pub output: Option<OutputFormat>,

    /// Configuration file path
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Override `paths.data_dir`
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Skip accelerator detection and schedule everything on the CPU
    #[arg(long, global = true)]
    pub cpu_only: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Show service, pool and worker status
    Status,

    /// Print the effective configuration after file and environment overrides
    Config,

    /// Embed one or more texts
    Embed {
        /// Texts to embed
        #[arg(required = true, num_args = 1..)]
        texts: Vec<String>,

        /// Embedding model (defaults to `worker_pool.default_embedding_model`)
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Generate a completion for a prompt
    Generate {
        /// Prompt text
        prompt: String,

        /// Text generation model
        #[arg(short, long, default_value = "gpt2")]
        model: String,

        /// Maximum number of new tokens
        #[arg(long, default_value_t = 64)]
        max_new_tokens: usize,

        /// Sampling temperature
        #[arg(long)]
        temperature: Option<f32>,
    },

    /// Fetch model files into the local cache without loading them
    Download {
        /// Model identifier
        model: String,

        /// Model type (embedding, text_generation); inferred when omitted
        #[arg(short = 't', long)]
        model_type: Option<String>,
    },

    /// Register a model with dedicated workers, serve a few requests and release it
    Demo {
        /// Embedding model to register
        #[arg(short, long)]
        model: Option<String>,

        /// Dedicated workers to create
        #[arg(short, long, default_value_t = 2)]
        workers: usize,

        /// Device for the dedicated workers (auto, cpu, cuda:N)
        #[arg(short, long, default_value = "auto")]
        device: String,
    },
}
