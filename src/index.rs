//! SQLite-backed vector index.
//!
//! Chunks live in a single `chunks` table keyed by `(source_id, ordinal)`,
//! with the embedding stored as a little-endian f32 BLOB. Retrieval scans
//! candidates and ranks by cosine similarity in process; at wiki scale the
//! table is small enough that a linear scan beats maintaining an external
//! vector store.
//!
//! The manifest (`source_id -> content_hash`, derived from chunk rows) is
//! the sync engine's view of what is currently indexed.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::chunk::Chunk;
use crate::config::ConfigRegistry;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{ConnectionError, IndexError};
use crate::service::{Lifecycle, Service};

/// A chunk paired with its embedding vector, ready for insertion.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// A chunk returned from a similarity query.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub source_id: String,
    pub ordinal: i64,
    pub text: String,
    pub score: f32,
}

/// Storage contract the sync engine and orchestrator run against.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Current `source_id -> content_hash` of everything indexed.
    async fn manifest(&self) -> Result<HashMap<String, String>, IndexError>;

    /// Remove every chunk belonging to the given sources.
    async fn delete_sources(&self, source_ids: &[String]) -> Result<u64, IndexError>;

    /// Insert or replace a batch of embedded chunks.
    async fn upsert(&self, chunks: &[EmbeddedChunk]) -> Result<(), IndexError>;

    /// Top-k chunks by cosine similarity against `query`.
    async fn query(&self, query: &[f32], k: usize) -> Result<Vec<RetrievedChunk>, IndexError>;

    /// Drop every indexed chunk.
    async fn reset(&self) -> Result<(), IndexError>;

    /// Number of chunks currently indexed.
    async fn count(&self) -> Result<u64, IndexError>;
}

/// [`VectorIndex`] over a SQLite database in WAL mode.
pub struct SqliteIndex {
    lifecycle: Lifecycle,
    registry: Arc<ConfigRegistry>,
    pool: RwLock<Option<SqlitePool>>,
}

impl SqliteIndex {
    pub fn new(registry: Arc<ConfigRegistry>) -> Self {
        Self {
            lifecycle: Lifecycle::new("index"),
            registry,
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> Result<SqlitePool, IndexError> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or(IndexError::NotConnected)
    }
}

#[async_trait]
impl Service for SqliteIndex {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn acquire(&self) -> Result<(), ConnectionError> {
        let settings = self.registry.settings().await;
        let db_path = &settings.index.path;

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConnectionError::new("index", e))?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
            .map_err(|e| ConnectionError::new("index", e))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| ConnectionError::new("index", e))?;

        // Idempotent schema setup.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                source_id    TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                ordinal      INTEGER NOT NULL,
                text         TEXT NOT NULL,
                embedding    BLOB NOT NULL,
                indexed_at   TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (source_id, ordinal)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| ConnectionError::new("index", e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_hash ON chunks(source_id, content_hash)")
            .execute(&pool)
            .await
            .map_err(|e| ConnectionError::new("index", e))?;

        *self.pool.write().await = Some(pool);
        Ok(())
    }

    async fn release(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn manifest(&self) -> Result<HashMap<String, String>, IndexError> {
        let pool = self.pool().await?;
        let rows = sqlx::query("SELECT DISTINCT source_id, content_hash FROM chunks")
            .fetch_all(&pool)
            .await?;

        let mut manifest = HashMap::with_capacity(rows.len());
        for row in rows {
            manifest.insert(row.get::<String, _>("source_id"), row.get("content_hash"));
        }
        Ok(manifest)
    }

    async fn delete_sources(&self, source_ids: &[String]) -> Result<u64, IndexError> {
        if source_ids.is_empty() {
            return Ok(0);
        }
        let pool = self.pool().await?;

        let mut deleted = 0u64;
        let mut tx = pool.begin().await?;
        for source_id in source_ids {
            let result = sqlx::query("DELETE FROM chunks WHERE source_id = ?")
                .bind(source_id)
                .execute(&mut *tx)
                .await?;
            deleted += result.rows_affected();
        }
        tx.commit().await?;

        debug!(sources = source_ids.len(), chunks = deleted, "deleted from index");
        Ok(deleted)
    }

    async fn upsert(&self, chunks: &[EmbeddedChunk]) -> Result<(), IndexError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let pool = self.pool().await?;

        let mut tx = pool.begin().await?;
        for item in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (source_id, content_hash, ordinal, text, embedding)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(source_id, ordinal) DO UPDATE SET
                    content_hash = excluded.content_hash,
                    text = excluded.text,
                    embedding = excluded.embedding,
                    indexed_at = datetime('now')
                "#,
            )
            .bind(&item.chunk.source_id)
            .bind(&item.chunk.content_hash)
            .bind(item.chunk.ordinal)
            .bind(&item.chunk.text)
            .bind(vec_to_blob(&item.vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, query: &[f32], k: usize) -> Result<Vec<RetrievedChunk>, IndexError> {
        let pool = self.pool().await?;
        let rows = sqlx::query("SELECT source_id, ordinal, text, embedding FROM chunks")
            .fetch_all(&pool)
            .await?;

        let mut scored: Vec<RetrievedChunk> = rows
            .into_iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let score = cosine_similarity(query, &blob_to_vec(&blob));
                RetrievedChunk {
                    source_id: row.get("source_id"),
                    ordinal: row.get("ordinal"),
                    text: row.get("text"),
                    score,
                }
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn reset(&self) -> Result<(), IndexError> {
        let pool = self.pool().await?;
        sqlx::query("DELETE FROM chunks").execute(&pool).await?;
        Ok(())
    }

    async fn count(&self) -> Result<u64, IndexError> {
        let pool = self.pool().await?;
        let row = sqlx::query("SELECT COUNT(*) AS n FROM chunks")
            .fetch_one(&pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;

    fn embedded(source_id: &str, hash: &str, ordinal: i64, vector: Vec<f32>) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: Chunk {
                source_id: source_id.to_string(),
                content_hash: hash.to_string(),
                ordinal,
                text: format!("{} chunk {}", source_id, ordinal),
            },
            vector,
        }
    }

    async fn open_index(dir: &tempfile::TempDir) -> Arc<SqliteIndex> {
        let config = format!(
            r#"
[source]
root = "{}"

[index]
path = "{}"

[generation]
model = "llama3.2"

[server]
bind = "127.0.0.1:0"
"#,
            dir.path().display(),
            dir.path().join("index.db").display()
        );
        let config_path = dir.path().join("ragbot.toml");
        std::fs::write(&config_path, config).unwrap();

        let registry = Arc::new(ConfigRegistry::new(&config_path).unwrap());
        let index = Arc::new(SqliteIndex::new(registry));
        index.connect().await.unwrap();
        index
    }

    #[tokio::test]
    async fn test_manifest_reflects_upserts_and_deletes() {
        let dir = tempfile::TempDir::new().unwrap();
        let index = open_index(&dir).await;

        index
            .upsert(&[
                embedded("a.md", "h1", 0, vec![1.0, 0.0]),
                embedded("a.md", "h1", 1, vec![0.0, 1.0]),
                embedded("b.md", "h2", 0, vec![1.0, 1.0]),
            ])
            .await
            .unwrap();

        let manifest = index.manifest().await.unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest["a.md"], "h1");
        assert_eq!(manifest["b.md"], "h2");
        assert_eq!(index.count().await.unwrap(), 3);

        index.delete_sources(&["a.md".to_string()]).await.unwrap();
        let manifest = index.manifest().await.unwrap();
        assert_eq!(manifest.len(), 1);
        assert!(manifest.contains_key("b.md"));
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_query_ranks_by_cosine() {
        let dir = tempfile::TempDir::new().unwrap();
        let index = open_index(&dir).await;

        index
            .upsert(&[
                embedded("x.md", "h", 0, vec![1.0, 0.0]),
                embedded("y.md", "h", 0, vec![0.0, 1.0]),
                embedded("z.md", "h", 0, vec![0.7, 0.7]),
            ])
            .await
            .unwrap();

        let results = index.query(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].source_id, "x.md");
        assert_eq!(results[1].source_id, "z.md");
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_ordinal() {
        let dir = tempfile::TempDir::new().unwrap();
        let index = open_index(&dir).await;

        index
            .upsert(&[embedded("a.md", "old", 0, vec![1.0, 0.0])])
            .await
            .unwrap();
        index
            .upsert(&[embedded("a.md", "new", 0, vec![0.0, 1.0])])
            .await
            .unwrap();

        assert_eq!(index.count().await.unwrap(), 1);
        let manifest = index.manifest().await.unwrap();
        assert_eq!(manifest["a.md"], "new");
    }

    #[tokio::test]
    async fn test_reset_empties_index() {
        let dir = tempfile::TempDir::new().unwrap();
        let index = open_index(&dir).await;

        index
            .upsert(&[embedded("a.md", "h", 0, vec![1.0])])
            .await
            .unwrap();
        index.reset().await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
        assert!(index.manifest().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_before_connect_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("ragbot.toml");
        std::fs::write(
            &config_path,
            format!(
                "[source]\nroot = \"{}\"\n[index]\npath = \"{}\"\n[generation]\nmodel = \"m\"\n[server]\nbind = \"127.0.0.1:0\"\n",
                dir.path().display(),
                dir.path().join("i.db").display()
            ),
        )
        .unwrap();
        let registry = Arc::new(ConfigRegistry::new(&config_path).unwrap());
        let index = SqliteIndex::new(registry);
        assert!(matches!(
            index.query(&[1.0], 3).await,
            Err(IndexError::NotConnected)
        ));
    }
}
