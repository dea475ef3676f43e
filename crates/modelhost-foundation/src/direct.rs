//! Direct single-model loading.
//!
//! Used when the worker pool is disabled or has no workers. Models are
//! loaded in-process, shared by reference count and dropped once unused and
//! idle past a timeout.

use crate::placement::resolve_device;
use crate::worker::run_inference;
use modelhost_backend::{DeviceInventory, LoadedModel, LoaderFactory};
use modelhost_kernel::{
    Device, DevicePreference, ErrorCode, ModelType, ServiceError, ServiceResult, SharedClock,
    TaskInput, TaskOutput, TaskTiming,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A directly loaded model and its holders.
pub struct ModelReference {
    pub model_id: String,
    pub instance: LoadedModel,
    pub config: Value,
    pub reference_count: u32,
    pub created_at: u64,
    pub last_accessed: u64,
}

impl ModelReference {
    pub fn snapshot(&self) -> ReferenceSnapshot {
        ReferenceSnapshot {
            model_id: self.model_id.clone(),
            model_type: self.instance.model_type,
            device: self.instance.device,
            reference_count: self.reference_count,
            created_at: self.created_at,
            last_accessed: self.last_accessed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSnapshot {
    pub model_id: String,
    pub model_type: ModelType,
    pub device: Device,
    pub reference_count: u32,
    pub created_at: u64,
    pub last_accessed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectOutput {
    pub output: TaskOutput,
    pub device: Device,
    pub timing: TaskTiming,
}

pub struct DirectModelManager {
    factory: Arc<LoaderFactory>,
    inventory: Arc<DeviceInventory>,
    clock: SharedClock,
    require_gpu: bool,
    models: RwLock<HashMap<String, ModelReference>>,
}

impl DirectModelManager {
    pub fn new(
        factory: Arc<LoaderFactory>,
        inventory: Arc<DeviceInventory>,
        clock: SharedClock,
        require_gpu: bool,
    ) -> Self {
        Self {
            factory,
            inventory,
            clock,
            require_gpu,
            models: RwLock::new(HashMap::new()),
        }
    }

    fn reuse(&self, model_id: &str) -> Option<LoadedModel> {
        let now = self.clock.now_millis();
        let mut models = self.models.write();
        let reference = models.get_mut(model_id)?;
        reference.reference_count += 1;
        reference.last_accessed = now;
        Some(reference.instance.clone())
    }

    /// Take a reference, loading the model on first use.
    pub async fn acquire(
        &self,
        model_id: &str,
        model_type: ModelType,
        preference: DevicePreference,
    ) -> ServiceResult<LoadedModel> {
        if let Some(instance) = self.reuse(model_id) {
            return Ok(instance);
        }

        let device = resolve_device(preference, None, &self.inventory, self.require_gpu)?;
        let factory = Arc::clone(&self.factory);
        let id = model_id.to_string();
        let device_str = device.to_string();
        let loaded = tokio::task::spawn_blocking(move || {
            factory.load_model(&id, Some(model_type), &device_str)
        })
        .await
        .map_err(|e| {
            ServiceError::new(ErrorCode::ModelLoadError, format!("load task failed: {e}"))
                .with_details(json!({ "model_id": model_id, "device": device.to_string() }))
        })??;

        let now = self.clock.now_millis();
        let duplicate = {
            let mut models = self.models.write();
            match models.entry(model_id.to_string()) {
                Entry::Occupied(mut existing) => {
                    // Lost a concurrent load; keep the resident copy.
                    let reference = existing.get_mut();
                    reference.reference_count += 1;
                    reference.last_accessed = now;
                    Err((reference.instance.clone(), loaded))
                }
                Entry::Vacant(slot) => {
                    info!(model_id, %device, "Loaded model directly");
                    slot.insert(ModelReference {
                        model_id: model_id.to_string(),
                        instance: loaded.clone(),
                        config: json!({
                            "model_type": model_type,
                            "device": device,
                            "preference": preference,
                        }),
                        reference_count: 1,
                        created_at: now,
                        last_accessed: now,
                    });
                    Ok(loaded)
                }
            }
        };

        match duplicate {
            Ok(instance) => Ok(instance),
            Err((instance, discarded)) => {
                drop_blocking(discarded).await;
                Ok(instance)
            }
        }
    }

    /// Give back one reference. Returns false for unknown models.
    pub fn release(&self, model_id: &str) -> bool {
        let now = self.clock.now_millis();
        let mut models = self.models.write();
        match models.get_mut(model_id) {
            Some(reference) => {
                reference.reference_count = reference.reference_count.saturating_sub(1);
                reference.last_accessed = now;
                true
            }
            None => false,
        }
    }

    /// Forget the model regardless of its references and free it.
    pub async fn remove(&self, model_id: &str) -> bool {
        let removed = self.models.write().remove(model_id);
        match removed {
            Some(reference) => {
                info!(model_id, "Removed direct model");
                drop_blocking(reference.instance).await;
                true
            }
            None => false,
        }
    }

    /// Run one task body on a directly loaded model.
    pub async fn execute(
        &self,
        model_id: &str,
        model_type: ModelType,
        preference: DevicePreference,
        input: TaskInput,
    ) -> ServiceResult<DirectOutput> {
        let started = Instant::now();
        let model = self.acquire(model_id, model_type, preference).await?;
        let switch_ms = millis(started.elapsed());

        let device = model.device;
        let handle = Arc::clone(&model.handle);
        drop(model);
        let processing = Instant::now();
        let joined =
            tokio::task::spawn_blocking(move || run_inference(handle.as_ref(), &input)).await;
        let processing_ms = millis(processing.elapsed());
        self.release(model_id);

        let output = match joined {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(ServiceError::new(
                    ErrorCode::InferenceFailed,
                    format!("inference failed for '{model_id}'"),
                )
                .with_details(json!({
                    "model_id": model_id,
                    "device": device.to_string(),
                    "cause": err.to_string(),
                })));
            }
            Err(join_error) => {
                return Err(ServiceError::new(
                    ErrorCode::InferenceFailed,
                    format!("inference task for '{model_id}' did not complete"),
                )
                .with_details(json!({
                    "model_id": model_id,
                    "device": device.to_string(),
                    "cause": join_error.to_string(),
                })));
            }
        };

        let total_ms = millis(started.elapsed());
        debug!(model_id, %device, processing_ms, "Direct inference finished");
        Ok(DirectOutput {
            output,
            device,
            timing: TaskTiming {
                model_switch_ms: switch_ms,
                processing_ms,
                overhead_ms: (total_ms - switch_ms - processing_ms).max(0.0),
                total_ms,
            },
        })
    }

    /// Drop unreferenced models idle longer than `idle`.
    pub async fn cleanup_idle(&self, idle: Duration) -> Vec<String> {
        let now = self.clock.now_millis();
        let idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);
        let removed: Vec<ModelReference> = {
            let mut models = self.models.write();
            let expired: Vec<String> = models
                .values()
                .filter(|r| r.reference_count == 0 && now.saturating_sub(r.last_accessed) > idle_ms)
                .map(|r| r.model_id.clone())
                .collect();
            expired.iter().filter_map(|id| models.remove(id)).collect()
        };

        let ids: Vec<String> = removed.iter().map(|r| r.model_id.clone()).collect();
        for reference in removed {
            info!(model_id = %reference.model_id, "Released idle direct model");
            drop_blocking(reference.instance).await;
        }
        ids
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.models.read().contains_key(model_id)
    }

    pub fn reference_count(&self, model_id: &str) -> Option<u32> {
        self.models.read().get(model_id).map(|r| r.reference_count)
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.read().is_empty()
    }

    pub fn snapshots(&self) -> Vec<ReferenceSnapshot> {
        let mut snapshots: Vec<_> = self.models.read().values().map(|r| r.snapshot()).collect();
        snapshots.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        snapshots
    }
}

async fn drop_blocking(model: LoadedModel) {
    let _ = tokio::task::spawn_blocking(move || drop(model)).await;
}

fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}
