//! TTL-bounded embedding cache.
//!
//! Entries are keyed by `sha256(model_id + ":" + text)`. A batch is served
//! from cache only when every text hits; a single absent or expired entry
//! makes the whole batch a miss. Expired entries are purged lazily on
//! lookup, and a full expiry sweep runs before an insert would grow the
//! cache past `max_cache_size`. Unexpired entries are never evicted, so the
//! size limit is a sweep trigger rather than a hard cap.

use modelhost_kernel::{EmbeddingCacheConfig, SharedClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
struct CacheEntry {
    embedding: Vec<f32>,
    inserted_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub max_cache_size: usize,
    pub ttl_seconds: u64,
    pub hits: u64,
    pub misses: u64,
    pub expired_purged: u64,
    pub hit_rate: f64,
}

pub struct EmbeddingCache {
    config: EmbeddingCacheConfig,
    clock: SharedClock,
    entries: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    expired_purged: AtomicU64,
}

pub fn cache_key(model_id: &str, text: &str) -> String {
    let digest = Sha256::new()
        .chain_update(model_id.as_bytes())
        .chain_update(b":")
        .chain_update(text.as_bytes())
        .finalize();
    hex::encode(digest)
}

impl EmbeddingCache {
    pub fn new(config: EmbeddingCacheConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired_purged: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn ttl_millis(&self) -> u64 {
        self.config.ttl_seconds.saturating_mul(1000)
    }

    fn is_expired(&self, entry: &CacheEntry, now: u64) -> bool {
        now.saturating_sub(entry.inserted_at) > self.ttl_millis()
    }

    /// All-or-nothing batch lookup.
    pub fn get_embeddings(&self, texts: &[String], model_id: &str) -> Option<Vec<Vec<f32>>> {
        if !self.config.enabled || texts.is_empty() {
            return None;
        }

        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        let mut found = Vec::with_capacity(texts.len());
        let mut complete = true;

        for text in texts {
            let key = cache_key(model_id, text);
            match entries.get(&key) {
                Some(entry) if self.is_expired(entry, now) => {
                    entries.remove(&key);
                    self.expired_purged.fetch_add(1, Ordering::Relaxed);
                    complete = false;
                }
                Some(entry) => found.push(entry.embedding.clone()),
                None => complete = false,
            }
        }
        drop(entries);

        if complete {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(model_id, texts = texts.len(), "Embedding cache hit");
            Some(found)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Store a full batch stamped with the current time.
    pub fn cache_embeddings(&self, texts: &[String], model_id: &str, embeddings: &[Vec<f32>]) {
        if !self.config.enabled {
            return;
        }
        if texts.len() != embeddings.len() {
            tracing::warn!(
                model_id,
                texts = texts.len(),
                embeddings = embeddings.len(),
                "Refusing to cache mismatched embedding batch"
            );
            return;
        }

        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        if entries.len() + texts.len() > self.config.max_cache_size {
            let purged = self.purge_expired(&mut entries, now);
            tracing::debug!(purged, remaining = entries.len(), "Embedding cache sweep");
        }
        for (text, embedding) in texts.iter().zip(embeddings) {
            entries.insert(
                cache_key(model_id, text),
                CacheEntry {
                    embedding: embedding.clone(),
                    inserted_at: now,
                },
            );
        }
    }

    fn purge_expired(&self, entries: &mut HashMap<String, CacheEntry>, now: u64) -> usize {
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now));
        let purged = before - entries.len();
        self.expired_purged
            .fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    /// Drop every expired entry now.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        self.purge_expired(&mut entries, now)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            enabled: self.config.enabled,
            entries: self.len(),
            max_cache_size: self.config.max_cache_size,
            ttl_seconds: self.config.ttl_seconds,
            hits,
            misses,
            expired_purged: self.expired_purged.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}
