//! Work items and results exchanged between submitters and model workers.

use crate::error::{ServiceError, ServiceResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Model family a registration (and therefore a task) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Embedding,
    TextGeneration,
}

/// Tasks share the model-type vocabulary.
pub type TaskType = ModelType;

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Embedding => "embedding",
            ModelType::TextGeneration => "text_generation",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = ServiceError;

    fn from_str(s: &str) -> ServiceResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "embedding" => Ok(ModelType::Embedding),
            "text_generation" | "text-generation" => Ok(ModelType::TextGeneration),
            _ => Err(ServiceError::invalid_model_type(s)),
        }
    }
}

/// Task priority. Only the shared queue reorders by priority; a worker's
/// private queue stays FIFO.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Sampling parameters for text generation.
///
/// Unknown keys are preserved in `extra` and forwarded to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: Option<usize>,
    pub do_sample: bool,
    pub stop: Vec<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            temperature: 0.7,
            top_p: 0.9,
            top_k: None,
            do_sample: true,
            stop: Vec::new(),
            extra: HashMap::new(),
        }
    }
}

impl GenerationParams {
    pub fn with_max_new_tokens(mut self, tokens: usize) -> Self {
        self.max_new_tokens = tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Input payload of a task. The variant determines the task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskInput {
    Embedding {
        texts: Vec<String>,
    },
    TextGeneration {
        prompt: String,
        params: GenerationParams,
    },
}

impl TaskInput {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskInput::Embedding { .. } => ModelType::Embedding,
            TaskInput::TextGeneration { .. } => ModelType::TextGeneration,
        }
    }
}

/// Output payload of a successful task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutput {
    Embeddings {
        embeddings: Vec<Vec<f32>>,
        dimension: usize,
    },
    Text {
        text: String,
        prompt_tokens: usize,
        completion_tokens: usize,
    },
}

/// An immutable unit of work, consumed exactly once by exactly one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTask {
    pub task_id: String,
    pub task_type: TaskType,
    pub model_id: String,
    pub input_data: TaskInput,
    pub metadata: HashMap<String, Value>,
    /// Unix epoch milliseconds.
    pub created_at: u64,
    pub priority: TaskPriority,
}

impl WorkerTask {
    pub fn new(model_id: impl Into<String>, input_data: TaskInput, created_at: u64) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            task_type: input_data.task_type(),
            model_id: model_id.into(),
            input_data,
            metadata: HashMap::new(),
            created_at,
            priority: TaskPriority::Normal,
        }
    }

    pub fn embedding(model_id: impl Into<String>, texts: Vec<String>, created_at: u64) -> Self {
        Self::new(model_id, TaskInput::Embedding { texts }, created_at)
    }

    pub fn text_generation(
        model_id: impl Into<String>,
        prompt: impl Into<String>,
        params: GenerationParams,
        created_at: u64,
    ) -> Self {
        Self::new(
            model_id,
            TaskInput::TextGeneration {
                prompt: prompt.into(),
                params,
            },
            created_at,
        )
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Per-task timing breakdown, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskTiming {
    pub model_switch_ms: f64,
    pub processing_ms: f64,
    pub overhead_ms: f64,
    pub total_ms: f64,
}

/// Produced exactly once per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub task_id: String,
    pub worker_id: String,
    pub success: bool,
    pub data: Option<TaskOutput>,
    pub error: Option<ServiceError>,
    /// Wall time spent by the worker on this task, in seconds.
    pub processing_time: f64,
    pub timing: TaskTiming,
    pub metadata: HashMap<String, Value>,
}

impl WorkerResult {
    pub fn success(
        task_id: impl Into<String>,
        worker_id: impl Into<String>,
        data: TaskOutput,
        timing: TaskTiming,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            success: true,
            data: Some(data),
            error: None,
            processing_time: timing.total_ms / 1000.0,
            timing,
            metadata: HashMap::new(),
        }
    }

    pub fn failure(
        task_id: impl Into<String>,
        worker_id: impl Into<String>,
        error: ServiceError,
        timing: TaskTiming,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            success: false,
            data: None,
            error: Some(error),
            processing_time: timing.total_ms / 1000.0,
            timing,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Unwrap into the output or the carried error.
    pub fn into_output(self) -> ServiceResult<TaskOutput> {
        match (self.data, self.error) {
            (Some(data), None) if self.success => Ok(data),
            (_, Some(error)) => Err(error),
            _ => Err(ServiceError::internal(format!(
                "task {} produced neither output nor error",
                self.task_id
            ))),
        }
    }
}
