//! Retrieval-augmented chat orchestrator.
//!
//! One `ask` call runs the full pipeline: semantic cache lookup, question
//! embedding, top-k retrieval, prompt assembly with session history, and
//! generation. The cache key is the question under the active generation
//! fingerprint; session history shapes the prompt but not the cache key,
//! so rephrasing-independent questions hit across sessions.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::cache::ResponseCache;
use crate::config::ConfigRegistry;
use crate::embedding::{embed_one, Embedder};
use crate::error::{ChatError, ConnectionError, GenerationError};
use crate::generation::{Generator, OllamaGenerator};
use crate::index::VectorIndex;
use crate::service::{Lifecycle, Service};

/// Exchanges from the tail of a session rendered into the prompt. Stored
/// history is append-only; only the prompt view is capped so prompts stay
/// bounded.
const PROMPT_HISTORY_EXCHANGES: usize = 8;

/// One completed question/answer turn in a session.
#[derive(Debug, Clone)]
struct Exchange {
    question: String,
    answer: String,
}

/// The orchestrator's reply.
#[derive(Debug, Clone)]
pub struct ChatAnswer {
    pub answer: String,
    /// Deduplicated source ids of the retrieved context, in rank order.
    pub sources: Vec<String>,
    pub cached: bool,
}

/// Ties retrieval, caching, history, and generation together.
pub struct ChatEngine {
    lifecycle: Lifecycle,
    registry: Arc<ConfigRegistry>,
    embedder: RwLock<Arc<dyn Embedder>>,
    index: Arc<dyn VectorIndex>,
    cache: Arc<ResponseCache>,
    generator: RwLock<Option<Arc<dyn Generator>>>,
    sessions: RwLock<HashMap<String, Vec<Exchange>>>,
    deps: Vec<Arc<dyn Service>>,
}

impl ChatEngine {
    pub fn new(
        registry: Arc<ConfigRegistry>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        cache: Arc<ResponseCache>,
        deps: Vec<Arc<dyn Service>>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new("chat"),
            registry,
            embedder: RwLock::new(embedder),
            index,
            cache,
            generator: RwLock::new(None),
            sessions: RwLock::new(HashMap::new()),
            deps,
        }
    }

    pub async fn set_embedder(&self, embedder: Arc<dyn Embedder>) {
        *self.embedder.write().await = embedder;
    }

    /// Rebuild the generator from the current settings. Run on reload so a
    /// model change takes effect without a restart.
    pub async fn rebuild_generator(&self) -> Result<(), GenerationError> {
        let settings = self.registry.settings().await;
        let generator = OllamaGenerator::new(&settings.generation)?;
        *self.generator.write().await = Some(Arc::new(generator));
        Ok(())
    }

    /// Answer a question, optionally within a session whose history shapes
    /// the prompt.
    pub async fn ask(
        &self,
        session_id: Option<&str>,
        question: &str,
    ) -> Result<ChatAnswer, ChatError> {
        let generator = self
            .generator
            .read()
            .await
            .clone()
            .ok_or(GenerationError::NotConnected)?;
        let fingerprint = generator.fingerprint().to_string();

        if let Some(hit) = self.cache.get(question, &fingerprint).await {
            info!(similarity = hit.similarity, "answer served from cache");
            let answer = ChatAnswer {
                answer: hit.answer,
                sources: hit.sources,
                cached: true,
            };
            self.record_exchange(session_id, question, &answer.answer).await;
            return Ok(answer);
        }

        let settings = self.registry.settings().await;

        let embedder = self.embedder.read().await.clone();
        let query_vec = embed_one(embedder.as_ref(), question).await?;
        let retrieved = self.index.query(&query_vec, settings.index.top_k).await?;
        debug!(chunks = retrieved.len(), "retrieved context");

        let mut seen = HashSet::new();
        let sources: Vec<String> = retrieved
            .iter()
            .filter(|c| seen.insert(c.source_id.clone()))
            .map(|c| c.source_id.clone())
            .collect();

        let history = self.session_history(session_id).await;
        let user_prompt = build_user_prompt(&retrieved, &history, question);

        let answer_text = generator
            .complete(&settings.generation.system_prompt, &user_prompt)
            .await?;

        self.cache
            .set(question, &fingerprint, &answer_text, &sources)
            .await;
        self.record_exchange(session_id, question, &answer_text).await;

        Ok(ChatAnswer {
            answer: answer_text,
            sources,
            cached: false,
        })
    }

    async fn session_history(&self, session_id: Option<&str>) -> Vec<Exchange> {
        match session_id {
            Some(id) => self
                .sessions
                .read()
                .await
                .get(id)
                .cloned()
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    async fn record_exchange(&self, session_id: Option<&str>, question: &str, answer: &str) {
        let Some(id) = session_id else { return };
        let mut sessions = self.sessions.write().await;
        let history = sessions.entry(id.to_string()).or_default();
        history.push(Exchange {
            question: question.to_string(),
            answer: answer.to_string(),
        });
    }

    pub async fn clear_session_history(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn clear_all_history(&self) {
        self.sessions.write().await.clear();
    }
}

fn build_user_prompt(
    retrieved: &[crate::index::RetrievedChunk],
    history: &[Exchange],
    question: &str,
) -> String {
    let mut prompt = String::new();

    if !retrieved.is_empty() {
        prompt.push_str("Context:\n");
        for chunk in retrieved {
            let _ = writeln!(prompt, "[{}]\n{}\n---", chunk.source_id, chunk.text);
        }
        prompt.push('\n');
    }

    let recent = &history[history.len().saturating_sub(PROMPT_HISTORY_EXCHANGES)..];
    if !recent.is_empty() {
        prompt.push_str("Previous conversation:\n");
        for exchange in recent {
            let _ = writeln!(prompt, "User: {}", exchange.question);
            let _ = writeln!(prompt, "Assistant: {}", exchange.answer);
        }
        prompt.push('\n');
    }

    let _ = write!(prompt, "Question: {}", question);
    prompt
}

#[async_trait]
impl Service for ChatEngine {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn dependencies(&self) -> Vec<Arc<dyn Service>> {
        self.deps.clone()
    }

    async fn acquire(&self) -> Result<(), ConnectionError> {
        self.rebuild_generator()
            .await
            .map_err(|e| ConnectionError::new("chat", e))
    }

    async fn release(&self) {
        *self.generator.write().await = None;
        self.clear_all_history().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EmbeddingError, IndexError};
    use crate::index::{EmbeddedChunk, RetrievedChunk};
    use std::sync::Mutex;

    /// Assigns each distinct text its own one-hot vector, so equal texts
    /// embed identically and different texts are orthogonal.
    #[derive(Default)]
    struct StubEmbedder {
        slots: Mutex<HashMap<String, usize>>,
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        fn id(&self) -> &str {
            "stub/stub@64"
        }
        fn dims(&self) -> usize {
            64
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            let mut slots = self.slots.lock().unwrap();
            Ok(texts
                .iter()
                .map(|t| {
                    let next = slots.len();
                    let slot = *slots.entry(t.clone()).or_insert(next);
                    let mut v = vec![0.0; 64];
                    v[slot % 64] = 1.0;
                    v
                })
                .collect())
        }
    }

    /// Always returns the same ranked chunks.
    struct StubIndex {
        chunks: Vec<RetrievedChunk>,
    }

    #[async_trait]
    impl VectorIndex for StubIndex {
        async fn manifest(
            &self,
        ) -> Result<std::collections::HashMap<String, String>, IndexError> {
            Ok(Default::default())
        }
        async fn delete_sources(&self, _: &[String]) -> Result<u64, IndexError> {
            Ok(0)
        }
        async fn upsert(&self, _: &[EmbeddedChunk]) -> Result<(), IndexError> {
            Ok(())
        }
        async fn query(&self, _: &[f32], k: usize) -> Result<Vec<RetrievedChunk>, IndexError> {
            Ok(self.chunks.iter().take(k).cloned().collect())
        }
        async fn reset(&self) -> Result<(), IndexError> {
            Ok(())
        }
        async fn count(&self) -> Result<u64, IndexError> {
            Ok(self.chunks.len() as u64)
        }
    }

    /// Echoes the prompts it was given, and counts calls.
    struct RecordingGenerator {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Generator for RecordingGenerator {
        async fn complete(&self, _system: &str, user: &str) -> Result<String, GenerationError> {
            self.prompts.lock().unwrap().push(user.to_string());
            Ok(format!("answer #{}", self.prompts.lock().unwrap().len()))
        }
        fn fingerprint(&self) -> &str {
            "recording/v1"
        }
    }

    fn registry(dir: &tempfile::TempDir) -> Arc<ConfigRegistry> {
        let config = format!(
            r#"
[source]
root = "{}"

[index]
path = "{}"
top_k = 3

[generation]
model = "m"

[server]
bind = "127.0.0.1:0"
"#,
            dir.path().display(),
            dir.path().join("i.db").display()
        );
        let path = dir.path().join("ragbot.toml");
        std::fs::write(&path, config).unwrap();
        Arc::new(ConfigRegistry::new(&path).unwrap())
    }

    fn chunk(source_id: &str, ordinal: i64, text: &str, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            source_id: source_id.to_string(),
            ordinal,
            text: text.to_string(),
            score,
        }
    }

    async fn engine_with(
        dir: &tempfile::TempDir,
        chunks: Vec<RetrievedChunk>,
    ) -> (ChatEngine, Arc<RecordingGenerator>) {
        let registry = registry(dir);
        let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::default());
        let cache = Arc::new(ResponseCache::new(
            registry.clone(),
            embedder.clone(),
            Vec::new(),
        ));
        let engine = ChatEngine::new(
            registry,
            embedder,
            Arc::new(StubIndex { chunks }),
            cache,
            Vec::new(),
        );
        let generator = Arc::new(RecordingGenerator {
            prompts: Mutex::new(Vec::new()),
        });
        *engine.generator.write().await = Some(generator.clone());
        (engine, generator)
    }

    #[tokio::test]
    async fn test_ask_retrieves_and_generates() {
        let dir = tempfile::TempDir::new().unwrap();
        let (engine, generator) = engine_with(
            &dir,
            vec![
                chunk("intro.md", 0, "Rust is a systems language.", 0.9),
                chunk("intro.md", 1, "It has no garbage collector.", 0.8),
                chunk("faq.md", 0, "See the book.", 0.7),
            ],
        )
        .await;

        let reply = engine.ask(None, "what is rust").await.unwrap();
        assert!(!reply.cached);
        // Sources deduplicated, rank order preserved.
        assert_eq!(reply.sources, vec!["intro.md".to_string(), "faq.md".to_string()]);

        let prompt = generator.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("Rust is a systems language."));
        assert!(prompt.contains("Question: what is rust"));
    }

    #[tokio::test]
    async fn test_repeat_question_served_from_cache() {
        let dir = tempfile::TempDir::new().unwrap();
        let (engine, generator) = engine_with(&dir, vec![chunk("a.md", 0, "text", 0.9)]).await;

        let first = engine.ask(None, "what is rust").await.unwrap();
        let second = engine.ask(None, "what is rust").await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.answer, second.answer);
        assert_eq!(generator.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_session_history_appears_in_prompt() {
        let dir = tempfile::TempDir::new().unwrap();
        let (engine, generator) = engine_with(&dir, vec![chunk("a.md", 0, "text", 0.9)]).await;

        engine.ask(Some("s1"), "first question").await.unwrap();
        engine.ask(Some("s1"), "second question").await.unwrap();

        let prompts = generator.prompts.lock().unwrap();
        assert!(!prompts[0].contains("Previous conversation"));
        assert!(prompts[1].contains("Previous conversation"));
        assert!(prompts[1].contains("User: first question"));
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let dir = tempfile::TempDir::new().unwrap();
        let (engine, generator) = engine_with(&dir, vec![]).await;

        engine.ask(Some("s1"), "question one").await.unwrap();
        engine.ask(Some("s2"), "question two?").await.unwrap();

        let prompts = generator.prompts.lock().unwrap();
        assert!(
            !prompts[1].contains("question one"),
            "another session's history must not leak into the prompt"
        );
    }

    #[tokio::test]
    async fn test_clear_session_history() {
        let dir = tempfile::TempDir::new().unwrap();
        let (engine, generator) = engine_with(&dir, vec![]).await;

        engine.ask(Some("s1"), "first question").await.unwrap();
        engine.clear_session_history("s1").await;
        engine.ask(Some("s1"), "unrelated question?").await.unwrap();

        let prompts = generator.prompts.lock().unwrap();
        assert!(!prompts[1].contains("Previous conversation"));
    }

    #[tokio::test]
    async fn test_stored_history_is_append_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let (engine, _) = engine_with(&dir, vec![]).await;

        for i in 0..20 {
            engine.ask(Some("s1"), &format!("q{:03}", i)).await.unwrap();
        }

        // Every exchange is retained, in order. Only the prompt view is
        // capped.
        let history = engine.session_history(Some("s1")).await;
        assert_eq!(history.len(), 20);
        assert_eq!(history[0].question, "q000");
        assert_eq!(history.last().unwrap().question, "q019");
    }

    #[tokio::test]
    async fn test_prompt_renders_only_recent_history() {
        let dir = tempfile::TempDir::new().unwrap();
        let (engine, generator) = engine_with(&dir, vec![]).await;

        for i in 0..20 {
            engine.ask(Some("s1"), &format!("q{:03}", i)).await.unwrap();
        }

        // The prompt for q019 carries the eight exchanges before it and
        // nothing older.
        let prompts = generator.prompts.lock().unwrap();
        let last = prompts.last().unwrap();
        assert!(last.contains("User: q018"));
        assert!(last.contains("User: q011"));
        assert!(!last.contains("User: q010"));
    }

    #[tokio::test]
    async fn test_ask_without_generator_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let (engine, _) = engine_with(&dir, vec![]).await;
        *engine.generator.write().await = None;

        assert!(matches!(
            engine.ask(None, "q").await,
            Err(ChatError::Generation(GenerationError::NotConnected))
        ));
    }
}
