//! Bookkeeping for registered models.

use modelhost_kernel::{DevicePreference, ModelType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One per distinct model name known to the lifecycle manager.
///
/// Timestamps are Unix epoch milliseconds from the service clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRegistration {
    pub model_name: String,
    pub model_type: ModelType,
    pub device: DevicePreference,
    pub requesters: BTreeSet<String>,
    pub reference_count: u32,
    pub loaded: bool,
    /// Registered by the service itself and exempt from idle eviction.
    pub preloaded: bool,
    pub load_time: Option<u64>,
    pub last_activity: u64,
    pub keep_alive_seconds: u64,
    /// Workers requested for this model.
    pub workers: usize,
    pub model_memory_gb: f64,
    /// Set while workers are being provisioned.
    #[serde(skip)]
    pub provisioning: bool,
}

impl ModelRegistration {
    pub fn new(
        model_name: impl Into<String>,
        model_type: ModelType,
        device: DevicePreference,
        workers: usize,
        keep_alive_seconds: u64,
        model_memory_gb: f64,
        now: u64,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            model_type,
            device,
            requesters: BTreeSet::new(),
            reference_count: 0,
            loaded: false,
            preloaded: false,
            load_time: None,
            last_activity: now,
            keep_alive_seconds,
            workers,
            model_memory_gb,
            provisioning: false,
        }
    }

    /// Count one more holder. A `None` requester is counted but not named.
    pub fn add_reference(&mut self, requester: Option<&str>, now: u64) {
        self.reference_count = self.reference_count.saturating_add(1);
        if let Some(requester) = requester {
            self.requesters.insert(requester.to_string());
        }
        self.last_activity = now;
    }

    /// Returns false when there was nothing to release.
    pub fn remove_reference(&mut self, requester: Option<&str>, now: u64) -> bool {
        if let Some(requester) = requester {
            self.requesters.remove(requester);
        }
        self.last_activity = now;
        if self.reference_count == 0 {
            return false;
        }
        self.reference_count -= 1;
        true
    }

    pub fn touch(&mut self, now: u64) {
        self.last_activity = now;
    }

    pub fn mark_loaded(&mut self, now: u64) {
        self.loaded = true;
        self.load_time = Some(now);
        self.last_activity = now;
    }

    pub fn idle_millis(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_activity)
    }

    /// Loaded, unreferenced, not preloaded and idle strictly longer than
    /// its keep-alive window.
    pub fn is_evictable(&self, now: u64) -> bool {
        self.loaded
            && !self.preloaded
            && !self.provisioning
            && self.reference_count == 0
            && self.idle_millis(now) > self.keep_alive_seconds.saturating_mul(1000)
    }
}
