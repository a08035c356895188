//! # ragbot
//!
//! A retrieval-augmented chat backend for wiki-style document collections.
//!
//! ragbot keeps a SQLite vector index synchronized with a directory of
//! documents via content-hash reconciliation, answers questions by
//! retrieving the most relevant chunks and prompting a local LLM, and
//! caches answers semantically so rephrased questions are served without
//! a generation call.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌─────────────┐   ┌───────────┐
//! │  Source    │──▶│ Sync Engine │──▶│  SQLite   │
//! │ (docs dir) │   │ hash diff   │   │  vectors  │
//! └───────────┘   └─────────────┘   └─────┬─────┘
//!                                         │
//!                 ┌────────────┐    ┌─────▼─────┐    ┌───────────┐
//!                 │  Semantic  │◀──▶│   Chat    │───▶│  Ollama   │
//!                 │   Cache    │    │  Engine   │    │ chat/embed│
//!                 └────────────┘    └─────┬─────┘    └───────────┘
//!                                         │
//!                                ┌────────┴────────┐
//!                                ▼                 ▼
//!                           ┌─────────┐      ┌─────────┐
//!                           │   CLI   │      │  HTTP   │
//!                           └─────────┘      └─────────┘
//! ```
//!
//! Services (source, index, cache, chat) share one connect/disconnect
//! state machine ([`service`]) and are started in dependency order by the
//! [`supervisor`]. Configuration lives in one TOML snapshot ([`config`])
//! whose reloads cascade to dependents in the same order.
//!
//! ## Quick Start
//!
//! ```bash
//! ragbot init                   # create the index database
//! ragbot sync                   # index the document collection
//! ragbot ask "how do I deploy?" # one-shot question
//! ragbot serve                  # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and reload cascade |
//! | [`service`] | Service lifecycle state machine |
//! | [`supervisor`] | Dependency-ordered startup/shutdown |
//! | [`source`] | Document source (filesystem) |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | SQLite vector index |
//! | [`sync`] | Incremental synchronization |
//! | [`cache`] | Semantic response cache |
//! | [`generation`] | LLM answer generation |
//! | [`chat`] | Retrieval-augmented orchestrator |
//! | [`app`] | Application assembly |
//! | [`server`] | HTTP API |

pub mod app;
pub mod cache;
pub mod chat;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod index;
pub mod server;
pub mod service;
pub mod source;
pub mod supervisor;
pub mod sync;
