//! Typed TOML configuration and the reload registry.
//!
//! Settings are loaded into one immutable snapshot; a reload replaces the
//! whole snapshot (never a partial update) and then notifies registered
//! dependents sequentially, in registration order. Registration order must
//! mirror the service dependency order — later dependents assume earlier
//! ones already reflect the new configuration.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info};

use crate::error::ConfigError;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub source: SourceSettings,
    #[serde(default)]
    pub chunking: ChunkingSettings,
    pub index: IndexSettings,
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    pub generation: GenerationSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    pub server: ServerSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceSettings {
    /// Directory holding the current document collection.
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingSettings {
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_chunk_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexSettings {
    /// SQLite database path for the vector index.
    pub path: PathBuf,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingSettings {
    /// `"openai"` or `"ollama"`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    #[serde(default = "default_embed_batch")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: default_dims(),
            base_url: default_ollama_url(),
            batch_size: default_embed_batch(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingSettings {
    /// Identity string scoping everything derived from the embedding space.
    /// When this changes on reload, existing vectors are invalid and the
    /// index needs a full rebuild.
    pub fn identity(&self) -> String {
        format!("{}/{}@{}", self.provider, self.model, self.dims)
    }
}

fn default_embedding_provider() -> String {
    "ollama".to_string()
}
fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_embed_batch() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationSettings {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
}

fn default_temperature() -> f64 {
    0.7
}
fn default_max_tokens() -> u32 {
    512
}
fn default_generation_timeout() -> u64 {
    120
}
fn default_system_prompt() -> String {
    "Use the following context to answer the user's question. \
     If you do not know the answer, say so instead of inventing one."
        .to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    /// Minimum cosine similarity between prompt embeddings for a
    /// non-exact hit.
    #[serde(default = "default_cache_threshold")]
    pub similarity_threshold: f32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            similarity_threshold: default_cache_threshold(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    3600
}
fn default_cache_threshold() -> f32 {
    0.95
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncSettings {
    /// Maximum chunks per index insert call.
    #[serde(default = "default_max_batch")]
    pub max_batch_size: usize,
    /// Wall-clock budget for one sync pass. Sources not reached before
    /// the deadline stay unsynced and are retried on the next pass.
    #[serde(default = "default_pass_timeout")]
    pub pass_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch(),
            pass_timeout_secs: default_pass_timeout(),
        }
    }
}

fn default_max_batch() -> usize {
    166
}
fn default_pass_timeout() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub bind: String,
    /// Shared secret for webhook HMAC verification. Unset disables the check.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// Git ref a webhook push must carry to trigger a sync.
    #[serde(default = "default_webhook_branch")]
    pub webhook_branch: String,
}

fn default_webhook_branch() -> String {
    "refs/heads/main".to_string()
}

/// Load and validate a settings snapshot from a TOML file.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;

    let settings: Settings = toml::from_str(&content)?;

    if settings.chunking.chunk_chars == 0 {
        return Err(ConfigError::Invalid(
            "chunking.chunk_chars must be > 0".into(),
        ));
    }
    if settings.chunking.overlap_chars >= settings.chunking.chunk_chars {
        return Err(ConfigError::Invalid(
            "chunking.overlap_chars must be smaller than chunk_chars".into(),
        ));
    }
    if settings.index.top_k == 0 {
        return Err(ConfigError::Invalid("index.top_k must be >= 1".into()));
    }
    if settings.embedding.dims == 0 {
        return Err(ConfigError::Invalid("embedding.dims must be > 0".into()));
    }
    match settings.embedding.provider.as_str() {
        "openai" | "ollama" => {}
        other => {
            return Err(ConfigError::Invalid(format!(
                "unknown embedding provider '{}'; must be openai or ollama",
                other
            )));
        }
    }
    if settings.sync.max_batch_size == 0 {
        return Err(ConfigError::Invalid(
            "sync.max_batch_size must be >= 1".into(),
        ));
    }
    if !(0.0..=1.0).contains(&settings.cache.similarity_threshold) {
        return Err(ConfigError::Invalid(
            "cache.similarity_threshold must be in [0.0, 1.0]".into(),
        ));
    }

    Ok(settings)
}

/// A dependent that must react to a configuration change.
///
/// Handlers run one at a time, in registration order, each awaited to
/// completion before the next starts.
#[async_trait]
pub trait ReloadHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn on_reload(&self, settings: &Settings) -> Result<()>;
}

/// Holds the current settings snapshot and cascades reloads to dependents.
pub struct ConfigRegistry {
    path: PathBuf,
    current: RwLock<Arc<Settings>>,
    version: AtomicU64,
    handlers: Mutex<Vec<Arc<dyn ReloadHandler>>>,
}

impl ConfigRegistry {
    /// Load the initial snapshot. Failure here is fatal.
    pub fn new(path: &Path) -> Result<Self, ConfigError> {
        let settings = load_settings(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            current: RwLock::new(Arc::new(settings)),
            version: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        })
    }

    /// Current snapshot. Holds no lock after returning.
    pub async fn settings(&self) -> Arc<Settings> {
        self.current.read().await.clone()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Append a reload handler. Registration order is cascade order.
    pub async fn register(&self, handler: Arc<dyn ReloadHandler>) {
        self.handlers.lock().await.push(handler);
    }

    /// Replace the snapshot and notify dependents in registration order.
    ///
    /// A load failure keeps the previous snapshot and returns the error
    /// without running any handler. A failing handler is logged and the
    /// cascade continues — later dependents must still observe the new
    /// snapshot — with the first failure returned at the end.
    pub async fn reload(&self) -> Result<()> {
        let settings = Arc::new(load_settings(&self.path)?);

        {
            let mut current = self.current.write().await;
            *current = settings.clone();
        }
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        info!(version, "configuration reloaded");

        let handlers = self.handlers.lock().await.clone();
        let mut first_failure: Option<anyhow::Error> = None;
        for handler in handlers {
            if let Err(e) = handler.on_reload(&settings).await {
                error!(handler = handler.name(), error = %e, "reload handler failed");
                if first_failure.is_none() {
                    first_failure =
                        Some(e.context(format!("reload handler '{}' failed", handler.name())));
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("ragbot.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    fn minimal_config(root: &Path, db: &Path) -> String {
        format!(
            r#"
[source]
root = "{}"

[index]
path = "{}"

[generation]
model = "llama3.2"

[server]
bind = "127.0.0.1:6000"
"#,
            root.display(),
            db.display()
        )
    }

    #[test]
    fn test_load_minimal_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(&dir, &minimal_config(dir.path(), &dir.path().join("x.db")));
        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.index.top_k, 3);
        assert_eq!(settings.sync.max_batch_size, 166);
        assert_eq!(settings.generation.model, "llama3.2");
    }

    #[test]
    fn test_missing_required_field_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(&dir, "[source]\nroot = \"/tmp\"\n");
        assert!(matches!(load_settings(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut body = minimal_config(dir.path(), &dir.path().join("x.db"));
        body.push_str("\n[chunking]\nchunk_chars = 100\noverlap_chars = 100\n");
        let path = write_config(&dir, &body);
        assert!(matches!(load_settings(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut body = minimal_config(dir.path(), &dir.path().join("x.db"));
        body.push_str("\n[embedding]\nprovider = \"chroma\"\n");
        let path = write_config(&dir, &body);
        assert!(matches!(load_settings(&path), Err(ConfigError::Invalid(_))));
    }

    struct OrderProbe {
        name: &'static str,
        log: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ReloadHandler for OrderProbe {
        fn name(&self) -> &str {
            self.name
        }
        async fn on_reload(&self, _settings: &Settings) -> Result<()> {
            self.log.lock().unwrap().push(self.name);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reload_cascade_runs_in_registration_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(&dir, &minimal_config(dir.path(), &dir.path().join("x.db")));
        let registry = ConfigRegistry::new(&path).unwrap();

        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        for name in ["source", "index", "cache", "chat"] {
            registry
                .register(Arc::new(OrderProbe {
                    name,
                    log: log.clone(),
                }))
                .await;
        }

        registry.reload().await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["source", "index", "cache", "chat"]
        );
        assert_eq!(registry.version(), 2);
    }

    #[tokio::test]
    async fn test_bad_reload_retains_previous_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(&dir, &minimal_config(dir.path(), &dir.path().join("x.db")));
        let registry = ConfigRegistry::new(&path).unwrap();
        let before = registry.settings().await;

        std::fs::write(&path, "not valid toml [").unwrap();
        assert!(registry.reload().await.is_err());

        let after = registry.settings().await;
        assert_eq!(before.generation.model, after.generation.model);
        assert_eq!(registry.version(), 1);
    }
}
