//! Incremental document synchronization.
//!
//! Each pass reconciles the index against the source's current collection
//! using content hashes: vanished sources are deleted, changed or new
//! sources are re-chunked, re-embedded, and re-inserted. Unchanged sources
//! are not touched, so a pass over an unchanged collection performs no
//! writes at all.
//!
//! Per-source failure isolation: one source failing to embed or insert is
//! recorded in the report and the pass moves on. Its old chunks were
//! already deleted, so the next pass sees it as missing and retries it.
//!
//! A wall-clock deadline bounds each pass: a source still in flight when
//! the deadline hits is abandoned and recorded as failed, sources not
//! reached at all are reported as skipped, and both are picked up next
//! pass.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::chunk::chunk_document;
use crate::config::ConfigRegistry;
use crate::embedding::Embedder;
use crate::error::SyncError;
use crate::index::{EmbeddedChunk, VectorIndex};
use crate::source::{DocumentRecord, DocumentSource};

/// Outcome of one sync pass.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Documents seen in the source collection.
    pub scanned: usize,
    /// Sources removed because they vanished from the collection.
    pub deleted: usize,
    /// Sources re-indexed (new or content changed).
    pub synced: usize,
    /// Sources whose re-indexing failed, with the failure message.
    pub failed: Vec<(String, String)>,
    /// Sources not reached before the pass deadline.
    pub skipped: usize,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped == 0
    }

    /// True when the pass changed the index at all. Failed sources count:
    /// their stale rows were deleted even though the re-insert never
    /// landed, so anything derived from the old index contents is stale.
    pub fn mutated_index(&self) -> bool {
        self.synced > 0 || self.deleted > 0 || !self.failed.is_empty()
    }
}

/// Drives reconciliation passes over a source/index/embedder triple.
pub struct SyncEngine {
    registry: Arc<ConfigRegistry>,
    source: Arc<dyn DocumentSource>,
    index: Arc<dyn VectorIndex>,
    embedder: RwLock<Arc<dyn Embedder>>,
}

impl SyncEngine {
    pub fn new(
        registry: Arc<ConfigRegistry>,
        source: Arc<dyn DocumentSource>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            registry,
            source,
            index,
            embedder: RwLock::new(embedder),
        }
    }

    /// Swap the embedding backend. The caller is responsible for rebuilding
    /// the index when the new backend's identity differs from the old one.
    pub async fn set_embedder(&self, embedder: Arc<dyn Embedder>) {
        *self.embedder.write().await = embedder;
    }

    /// One incremental reconciliation pass.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        self.run_pass(false).await
    }

    /// Drop the entire index and re-index the full collection. Used when
    /// incremental state cannot be trusted, e.g. after the embedding
    /// identity changes.
    pub async fn full_rebuild(&self) -> Result<SyncReport, SyncError> {
        self.run_pass(true).await
    }

    async fn run_pass(&self, full: bool) -> Result<SyncReport, SyncError> {
        let settings = self.registry.settings().await;
        let deadline = Instant::now() + Duration::from_secs(settings.sync.pass_timeout_secs);
        let started = Instant::now();

        if full {
            self.index.reset().await?;
        }

        let documents = self.source.list_documents().await?;
        let manifest = self.index.manifest().await?;

        let mut report = SyncReport {
            scanned: documents.len(),
            ..Default::default()
        };

        // Delete sources that vanished from the collection.
        let current_ids: std::collections::HashSet<&str> =
            documents.iter().map(|d| d.source_id.as_str()).collect();
        let vanished: Vec<String> = manifest
            .keys()
            .filter(|id| !current_ids.contains(id.as_str()))
            .cloned()
            .collect();
        if !vanished.is_empty() {
            self.index.delete_sources(&vanished).await?;
            report.deleted = vanished.len();
        }

        // Re-index changed and new sources, one at a time.
        for doc in &documents {
            if manifest.get(&doc.source_id).map(String::as_str) == Some(doc.content_hash.as_str())
            {
                continue; // unchanged
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                report.skipped += 1;
                continue;
            }

            // The remaining budget caps the source itself, so one slow
            // document cannot push the pass far past its deadline.
            let outcome = match tokio::time::timeout(remaining, self.reindex_document(doc, &settings))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout),
            };

            if let Err(e) = outcome {
                warn!(source_id = %doc.source_id, error = %e, "source sync failed");
                // Drop any partially inserted batches, otherwise the
                // manifest would record the new hash as current and the
                // next pass would skip the source.
                if let Err(cleanup) = self
                    .index
                    .delete_sources(std::slice::from_ref(&doc.source_id))
                    .await
                {
                    warn!(source_id = %doc.source_id, error = %cleanup, "partial-insert cleanup failed");
                }
                report.failed.push((doc.source_id.clone(), e.to_string()));
            } else {
                report.synced += 1;
            }
        }

        info!(
            scanned = report.scanned,
            synced = report.synced,
            deleted = report.deleted,
            failed = report.failed.len(),
            skipped = report.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            full,
            "sync pass complete"
        );

        Ok(report)
    }

    /// Replace one source's chunks: delete the stale rows first, then
    /// chunk, embed, and insert in bounded batches. Stale and fresh chunks
    /// never coexist, and a fresh insert never collides with leftover
    /// ordinals from a longer previous version.
    async fn reindex_document(
        &self,
        doc: &DocumentRecord,
        settings: &crate::config::Settings,
    ) -> Result<(), SyncError> {
        self.index
            .delete_sources(std::slice::from_ref(&doc.source_id))
            .await?;

        let chunk_chars = settings.chunking.chunk_chars;
        let overlap_chars = settings.chunking.overlap_chars;
        let doc_clone = doc.clone();
        let chunks = tokio::task::spawn_blocking(move || {
            chunk_document(&doc_clone, chunk_chars, overlap_chars)
        })
        .await
        .expect("chunking task must not panic");

        if chunks.is_empty() {
            return Ok(());
        }

        let embedder = self.embedder.read().await.clone();
        let embed_batch = settings.embedding.batch_size.max(1);
        let insert_batch = settings.sync.max_batch_size.max(1);

        let mut embedded = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(embed_batch) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = embedder.embed(&texts).await?;
            embedded.extend(
                batch
                    .iter()
                    .cloned()
                    .zip(vectors)
                    .map(|(chunk, vector)| EmbeddedChunk { chunk, vector }),
            );
        }

        for batch in embedded.chunks(insert_batch) {
            self.index.upsert(batch).await?;
        }

        Ok(())
    }
}
