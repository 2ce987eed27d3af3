//! Thin binary entry point (§10): loads configuration, wires the `Engine`
//! against its reference collaborators, and runs until interrupted.
//! Mirrors the teacher's `main.rs` -> `cli_batteries::run` chain,
//! simplified to a direct `#[tokio::main]` since this crate does not carry
//! `cli-batteries` (see DESIGN.md).
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use pubtx_engine::config::load_config;
use pubtx_engine::interfaces::mock::{InMemoryStore, MockKeyManager, MockLedger, MockNotifier};
use pubtx_engine::Engine;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Public Transaction Engine")]
struct Args {
    /// Config file layered under `PTX__`-prefixed environment variables.
    #[arg(long, env = "PTX_CONFIG_FILE")]
    config_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(args.config_file.as_deref())?;

    // Reference collaborators only. A production deployment supplies its
    // own `LedgerRpc`/`KeyManager`/`TransactionStore`/`EventNotifier`,
    // wired against its own ledger node, signer and database — those
    // integrations are out of scope for this crate.
    let engine = Engine::new(
        config,
        Arc::new(MockLedger::new()),
        Arc::new(MockKeyManager::new()),
        Arc::new(InMemoryStore::new()),
        Arc::new(MockNotifier::new()),
    );

    let janitor = engine.spawn_janitor();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    janitor.abort();
    engine.shutdown().await;

    Ok(())
}
