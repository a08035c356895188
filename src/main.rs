//! # ragbot CLI
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragbot init` | Create the index database and schema |
//! | `ragbot sync` | Run an incremental sync pass (`--full` to rebuild) |
//! | `ragbot ask "<question>"` | Answer a question from the command line |
//! | `ragbot serve` | Start the HTTP API server |
//!
//! All commands accept a `--config` flag pointing to a TOML configuration
//! file. See `config/ragbot.example.toml` for a full example.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use ragbot::app::App;
use ragbot::server::run_server;

/// ragbot — retrieval-augmented chat over a wiki-style document collection.
#[derive(Parser)]
#[command(
    name = "ragbot",
    about = "Retrieval-augmented chat backend for wiki-style document collections",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragbot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the index database and schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Synchronize the index against the document collection.
    ///
    /// Only changed, new, and vanished documents are touched. Use `--full`
    /// to drop the index and re-embed everything, e.g. after switching
    /// embedding models.
    Sync {
        /// Drop the index and re-index the full collection.
        #[arg(long)]
        full: bool,
    },

    /// Ask a single question and print the answer.
    Ask {
        /// The question.
        question: String,

        /// Session id for conversational follow-ups.
        #[arg(long)]
        session: Option<String>,
    },

    /// Start the HTTP API server.
    ///
    /// Binds to `[server].bind` and serves `/query`, `/sync`, `/webhook`,
    /// `/reload`, and `/health`.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let app = Arc::new(App::build(&cli.config).await?);

    match cli.command {
        Commands::Init => {
            use ragbot::service::Service;
            app.index.connect().await?;
            println!("Index database initialized.");
            app.index.disconnect().await;
        }
        Commands::Sync { full } => {
            app.start().await?;
            let report = app.sync(full).await?;
            println!(
                "Scanned {} documents: {} synced, {} deleted, {} failed, {} skipped",
                report.scanned,
                report.synced,
                report.deleted,
                report.failed.len(),
                report.skipped
            );
            for (source_id, reason) in &report.failed {
                eprintln!("  failed: {}: {}", source_id, reason);
            }
            app.shutdown().await;
            if !report.failed.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::Ask { question, session } => {
            app.start().await?;
            let reply = app.chat.ask(session.as_deref(), &question).await?;
            println!("{}", reply.answer);
            if !reply.sources.is_empty() {
                println!("\nSources: {}", reply.sources.join(", "));
            }
            app.shutdown().await;
        }
        Commands::Serve => {
            app.start().await?;
            run_server(app).await?;
        }
    }

    Ok(())
}
