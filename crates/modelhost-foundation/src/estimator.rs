//! Model memory estimates for capacity planning.

use modelhost_kernel::ModelType;

/// Estimates resident memory for a model before it is loaded.
pub trait MemoryEstimator: Send + Sync {
    fn estimate_gb(&self, model_name: &str, model_type: ModelType) -> f64;
}

/// Lookup by name fragment, falling back to a per-type default.
///
/// The longest matching fragment wins, so `gpt2-large` beats `gpt2`.
#[derive(Debug, Clone)]
pub struct StaticMemoryTable {
    entries: Vec<(String, f64)>,
    embedding_default_gb: f64,
    text_generation_default_gb: f64,
}

const KNOWN_MODELS: &[(&str, f64)] = &[
    ("all-minilm-l6", 0.1),
    ("all-minilm-l12", 0.15),
    ("all-mpnet-base", 0.5),
    ("bge-small", 0.15),
    ("bge-base", 0.5),
    ("bge-large", 1.4),
    ("e5-small", 0.15),
    ("e5-base", 0.5),
    ("e5-large", 1.4),
    ("gte-large", 1.4),
    ("gpt2", 0.6),
    ("gpt2-medium", 1.6),
    ("gpt2-large", 3.2),
    ("gpt2-xl", 6.4),
    ("tinyllama", 2.2),
    ("qwen2-0.5b", 1.0),
    ("qwen2-1.5b", 3.1),
    ("phi-2", 5.6),
    ("phi-3-mini", 7.7),
    ("gemma-2b", 5.0),
    ("mistral-7b", 14.5),
    ("llama-2-7b", 13.5),
    ("llama-3-8b", 16.0),
    ("llama-2-13b", 26.0),
];

impl Default for StaticMemoryTable {
    fn default() -> Self {
        Self {
            entries: KNOWN_MODELS
                .iter()
                .map(|(name, gb)| (name.to_string(), *gb))
                .collect(),
            embedding_default_gb: 0.5,
            text_generation_default_gb: 4.0,
        }
    }
}

impl StaticMemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, fragment: impl Into<String>, gb: f64) -> Self {
        self.entries.push((fragment.into().to_ascii_lowercase(), gb));
        self
    }

    pub fn with_defaults(mut self, embedding_gb: f64, text_generation_gb: f64) -> Self {
        self.embedding_default_gb = embedding_gb;
        self.text_generation_default_gb = text_generation_gb;
        self
    }
}

impl MemoryEstimator for StaticMemoryTable {
    fn estimate_gb(&self, model_name: &str, model_type: ModelType) -> f64 {
        let name = model_name.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(fragment, _)| name.contains(fragment.as_str()))
            .max_by_key(|(fragment, _)| fragment.len())
            .map(|(_, gb)| *gb)
            .unwrap_or(match model_type {
                ModelType::Embedding => self.embedding_default_gb,
                ModelType::TextGeneration => self.text_generation_default_gb,
            })
    }
}
