//! Document source abstraction and the filesystem implementation.
//!
//! A source provides the *current* document collection keyed by stable
//! `source_id`, with a content hash per document for cheap change
//! detection. Records are ephemeral — recomputed on every sync pass.

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use walkdir::WalkDir;

use crate::config::{ConfigRegistry, SourceSettings};
use crate::error::{ConnectionError, SourceError};
use crate::service::{Lifecycle, Service};

/// One document as seen by the current pass.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    /// Stable key: path relative to the source root.
    pub source_id: String,
    /// SHA-256 hex digest over the raw file bytes.
    pub content_hash: String,
    /// Extracted text body.
    pub body: String,
}

/// Provider of the current document collection.
///
/// The sync engine depends only on this contract; how documents arrive in
/// the collection (git pull, rsync, manual edits) is not its concern.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn list_documents(&self) -> Result<Vec<DocumentRecord>, SourceError>;
}

/// Reads documents from a directory tree with include/exclude globs.
pub struct FilesystemSource {
    lifecycle: Lifecycle,
    registry: Arc<ConfigRegistry>,
    root: RwLock<PathBuf>,
}

impl FilesystemSource {
    pub fn new(registry: Arc<ConfigRegistry>) -> Self {
        Self {
            lifecycle: Lifecycle::new("source"),
            registry,
            root: RwLock::new(PathBuf::new()),
        }
    }
}

#[async_trait]
impl Service for FilesystemSource {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn acquire(&self) -> Result<(), ConnectionError> {
        let settings = self.registry.settings().await;
        if !settings.source.root.exists() {
            return Err(ConnectionError::new(
                "source",
                format!(
                    "source root does not exist: {}",
                    settings.source.root.display()
                ),
            ));
        }
        *self.root.write().await = settings.source.root.clone();
        Ok(())
    }

    async fn release(&self) {
        self.root.write().await.clear();
    }
}

#[async_trait]
impl DocumentSource for FilesystemSource {
    async fn list_documents(&self) -> Result<Vec<DocumentRecord>, SourceError> {
        let settings = self.registry.settings().await;
        let source = settings.source.clone();
        // Scanning and hashing are blocking, CPU/IO-bound work; keep them
        // off the scheduler loop.
        tokio::task::spawn_blocking(move || scan_directory(&source))
            .await
            .expect("scan task must not panic")
    }
}

fn scan_directory(settings: &SourceSettings) -> Result<Vec<DocumentRecord>, SourceError> {
    let root = &settings.root;
    if !root.exists() {
        return Err(SourceError::MissingRoot(root.display().to_string()));
    }

    let include_set = build_globset(&settings.include_globs)?;

    let mut default_excludes = vec!["**/.git/**".to_string()];
    default_excludes.extend(settings.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut records = Vec::new();

    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| SourceError::Io {
            path: root.display().to_string(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if !include_set.is_match(&rel_str) {
            continue;
        }

        let raw = std::fs::read(path).map_err(|e| SourceError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let mut hasher = Sha256::new();
        hasher.update(&raw);
        let content_hash = format!("{:x}", hasher.finalize());

        records.push(DocumentRecord {
            source_id: rel_str,
            content_hash,
            body: String::from_utf8_lossy(&raw).into_owned(),
        });
    }

    // Deterministic ordering
    records.sort_by(|a, b| a.source_id.cmp(&b.source_id));

    Ok(records)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, SourceError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
