//! Semantic response cache.
//!
//! Caches generated answers keyed by the *meaning* of the prompt: a lookup
//! embeds the incoming prompt and accepts any stored entry whose prompt
//! embedding is similar enough, not only byte-equal prompts. Entries are
//! scoped by the generation backend's fingerprint, so answers produced by
//! one model configuration are never served for another, and expire after
//! a configured TTL.
//!
//! The cache fails open: any internal failure (embedding backend down,
//! and so on) is logged and treated as a miss. A broken cache degrades
//! latency, never correctness.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::ConfigRegistry;
use crate::embedding::{cosine_similarity, embed_one, Embedder};
use crate::error::{CacheError, ConnectionError};
use crate::service::{Lifecycle, Service};

/// A cached answer with the retrieval provenance it was generated from.
#[derive(Debug, Clone)]
pub struct CachedAnswer {
    pub answer: String,
    pub sources: Vec<String>,
    /// True similarity of the hit; 1.0 for an exact prompt match.
    pub similarity: f32,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    prompt: String,
    prompt_vec: Vec<f32>,
    fingerprint: String,
    answer: String,
    sources: Vec<String>,
    created_at: DateTime<Utc>,
}

/// In-process semantic cache over prompt embeddings.
pub struct ResponseCache {
    lifecycle: Lifecycle,
    registry: Arc<ConfigRegistry>,
    embedder: RwLock<Arc<dyn Embedder>>,
    entries: RwLock<Vec<CacheEntry>>,
    deps: Vec<Arc<dyn Service>>,
}

impl ResponseCache {
    pub fn new(
        registry: Arc<ConfigRegistry>,
        embedder: Arc<dyn Embedder>,
        deps: Vec<Arc<dyn Service>>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new("cache"),
            registry,
            embedder: RwLock::new(embedder),
            entries: RwLock::new(Vec::new()),
            deps,
        }
    }

    /// Swap the embedding backend. Stored prompt vectors are only valid in
    /// the old embedding space, so the cache is cleared.
    pub async fn set_embedder(&self, embedder: Arc<dyn Embedder>) {
        *self.embedder.write().await = embedder;
        self.clear().await;
    }

    /// Look up an answer for `prompt` under `fingerprint`.
    ///
    /// Never returns an error to callers: failures inside the lookup are
    /// logged and reported as a miss.
    pub async fn get(&self, prompt: &str, fingerprint: &str) -> Option<CachedAnswer> {
        match self.lookup(prompt, fingerprint).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(error = %e, "cache lookup failed, treating as miss");
                None
            }
        }
    }

    async fn lookup(
        &self,
        prompt: &str,
        fingerprint: &str,
    ) -> Result<Option<CachedAnswer>, CacheError> {
        let ttl = {
            let settings = self.registry.settings().await;
            ChronoDuration::seconds(settings.cache.ttl_secs as i64)
        };
        let threshold = self.registry.settings().await.cache.similarity_threshold;
        let now = Utc::now();

        // Exact match needs no embedding call.
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.iter().find(|e| {
                e.fingerprint == fingerprint && e.prompt == prompt && now - e.created_at <= ttl
            }) {
                debug!("cache hit (exact)");
                return Ok(Some(CachedAnswer {
                    answer: entry.answer.clone(),
                    sources: entry.sources.clone(),
                    similarity: 1.0,
                }));
            }
        }

        let embedder = self.embedder.read().await.clone();
        let query_vec = embed_one(embedder.as_ref(), prompt).await?;

        let entries = self.entries.read().await;
        let best = entries
            .iter()
            .filter(|e| e.fingerprint == fingerprint && now - e.created_at <= ttl)
            .map(|e| (e, cosine_similarity(&query_vec, &e.prompt_vec)))
            .filter(|(_, score)| *score >= threshold)
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        Ok(best.map(|(entry, score)| {
            debug!(similarity = score, "cache hit (semantic)");
            CachedAnswer {
                answer: entry.answer.clone(),
                sources: entry.sources.clone(),
                similarity: score,
            }
        }))
    }

    /// Store an answer. Last write wins for the same prompt and
    /// fingerprint; expired entries are evicted on the way through. Fails
    /// open like `get`.
    pub async fn set(&self, prompt: &str, fingerprint: &str, answer: &str, sources: &[String]) {
        if let Err(e) = self.store(prompt, fingerprint, answer, sources).await {
            warn!(error = %e, "cache store failed, skipping");
        }
    }

    async fn store(
        &self,
        prompt: &str,
        fingerprint: &str,
        answer: &str,
        sources: &[String],
    ) -> Result<(), CacheError> {
        let embedder = self.embedder.read().await.clone();
        let prompt_vec = embed_one(embedder.as_ref(), prompt).await?;

        let ttl = {
            let settings = self.registry.settings().await;
            ChronoDuration::seconds(settings.cache.ttl_secs as i64)
        };
        let now = Utc::now();

        let mut entries = self.entries.write().await;
        entries.retain(|e| {
            now - e.created_at <= ttl && !(e.prompt == prompt && e.fingerprint == fingerprint)
        });
        entries.push(CacheEntry {
            prompt: prompt.to_string(),
            prompt_vec,
            fingerprint: fingerprint.to_string(),
            answer: answer.to_string(),
            sources: sources.to_vec(),
            created_at: now,
        });
        Ok(())
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Service for ResponseCache {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn dependencies(&self) -> Vec<Arc<dyn Service>> {
        self.deps.clone()
    }

    async fn acquire(&self) -> Result<(), ConnectionError> {
        Ok(())
    }

    async fn release(&self) {
        self.clear().await;
    }
}
