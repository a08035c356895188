//! Application assembly.
//!
//! Wires the configuration registry, services, sync engine, and chat
//! orchestrator together, registers the dependency graph with the
//! supervisor, and registers reload handlers in dependency order. This is
//! the only module that knows the concrete shape of the whole system;
//! everything else works against traits.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::cache::ResponseCache;
use crate::chat::ChatEngine;
use crate::config::{ConfigRegistry, ReloadHandler, Settings};
use crate::embedding::create_embedder;
use crate::index::{SqliteIndex, VectorIndex};
use crate::service::{Service, ServiceState};
use crate::source::FilesystemSource;
use crate::supervisor::Supervisor;
use crate::sync::{SyncEngine, SyncReport};

/// Reconnects a service when configuration changes, so it re-reads its
/// settings. Skipped for services that were never connected.
struct ReconnectOnReload<S: Service>(Arc<S>);

#[async_trait]
impl<S: Service + 'static> ReloadHandler for ReconnectOnReload<S> {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn on_reload(&self, _settings: &Settings) -> Result<()> {
        if self.0.lifecycle().state().await != ServiceState::Connected {
            return Ok(());
        }
        self.0.disconnect().await;
        self.0
            .connect()
            .await
            .with_context(|| format!("reconnecting '{}' after reload", self.0.name()))
    }
}

/// The assembled application.
pub struct App {
    pub registry: Arc<ConfigRegistry>,
    pub source: Arc<FilesystemSource>,
    pub index: Arc<SqliteIndex>,
    pub cache: Arc<ResponseCache>,
    pub chat: Arc<ChatEngine>,
    pub sync_engine: Arc<SyncEngine>,
    supervisor: Supervisor,
}

impl App {
    /// Build the full service graph from a config file. Nothing is
    /// connected yet; call [`App::start`] for that.
    pub async fn build(config_path: &Path) -> Result<App> {
        let registry = Arc::new(ConfigRegistry::new(config_path)?);
        let settings = registry.settings().await;

        let embedder = create_embedder(&settings.embedding)?;

        let source = Arc::new(FilesystemSource::new(registry.clone()));
        let index = Arc::new(SqliteIndex::new(registry.clone()));
        let cache = Arc::new(ResponseCache::new(
            registry.clone(),
            embedder.clone(),
            vec![index.clone() as Arc<dyn Service>],
        ));
        let chat = Arc::new(ChatEngine::new(
            registry.clone(),
            embedder.clone(),
            index.clone(),
            cache.clone(),
            vec![
                index.clone() as Arc<dyn Service>,
                cache.clone() as Arc<dyn Service>,
            ],
        ));
        let sync_engine = Arc::new(SyncEngine::new(
            registry.clone(),
            source.clone(),
            index.clone(),
            embedder,
        ));

        let mut supervisor = Supervisor::new();
        supervisor.register(source.clone())?;
        supervisor.register(index.clone())?;
        supervisor.register(cache.clone())?;
        supervisor.register(chat.clone())?;

        // Reload handlers cascade in registration order, which must mirror
        // the dependency order so a reconnecting dependent always finds its
        // upstreams already on the new configuration.
        registry
            .register(Arc::new(ReconnectOnReload(source.clone())))
            .await;
        registry
            .register(Arc::new(ReconnectOnReload(index.clone())))
            .await;
        registry
            .register(Arc::new(ReconnectOnReload(cache.clone())))
            .await;
        registry
            .register(Arc::new(ReconnectOnReload(chat.clone())))
            .await;

        Ok(App {
            registry,
            source,
            index,
            cache,
            chat,
            sync_engine,
            supervisor,
        })
    }

    /// Connect every service in dependency order. A completely empty index
    /// triggers an initial sync pass so a fresh install can answer
    /// questions without a separate sync step.
    pub async fn start(&self) -> Result<()> {
        self.supervisor.start_all().await?;
        if self.index.count().await? == 0 {
            info!("index is empty, running initial sync");
            let report = self.sync_engine.sync().await?;
            info!(
                synced = report.synced,
                failed = report.failed.len(),
                "initial sync complete"
            );
        }
        Ok(())
    }

    /// Disconnect every service in reverse dependency order.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }

    /// Run one sync pass, incremental or full.
    ///
    /// Cached answers were generated against the pre-sync context, so any
    /// pass that changed the index also drops the response cache. Failed
    /// sources count as changes: their stale rows are gone even though the
    /// re-insert never landed.
    pub async fn sync(&self, full: bool) -> Result<SyncReport> {
        let report = if full {
            self.sync_engine.full_rebuild().await?
        } else {
            self.sync_engine.sync().await?
        };
        if report.mutated_index() {
            self.cache.clear().await;
        }
        Ok(report)
    }

    /// Reload configuration and cascade the change.
    ///
    /// If the embedding identity changed, every stored vector belongs to a
    /// dead embedding space: the backend is swapped everywhere, the cache
    /// dropped, and the index fully rebuilt.
    pub async fn reload(&self) -> Result<()> {
        let old_identity = self.registry.settings().await.embedding.identity();

        let cascade = self.registry.reload().await;

        let settings = self.registry.settings().await;
        let new_identity = settings.embedding.identity();
        if new_identity != old_identity {
            info!(
                old = %old_identity,
                new = %new_identity,
                "embedding identity changed, rebuilding index"
            );
            let embedder = create_embedder(&settings.embedding)?;
            self.sync_engine.set_embedder(embedder.clone()).await;
            self.cache.set_embedder(embedder.clone()).await;
            self.chat.set_embedder(embedder).await;

            let report = self.sync_engine.full_rebuild().await?;
            info!(synced = report.synced, "index rebuilt");
        }

        cascade
    }
}
