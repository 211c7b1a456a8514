//! Command-line entrypoint: argument parsing, tracing setup, server boot.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::server::{build_router, ServeState};
use crate::session::{OpenAiFactory, SessionService};
use crate::storage::FileStore;

#[derive(Parser)]
#[command(name = "webpilot", version, about = "LLM-driven browser automation orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator HTTP server
    Serve(ServeArgs),
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, default_value_t = 8790)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Directory for durable session storage
    #[arg(long, default_value = "./webpilot-data")]
    storage_dir: PathBuf,

    /// OpenAI-compatible API base URL
    #[arg(long, default_value = "https://api.openai.com/v1")]
    api_base: String,

    /// Default model when the execute request names none
    #[arg(long, default_value = "gpt-4o-mini")]
    model: String,

    /// Environment variable holding the fallback API key
    #[arg(long, default_value = "WEBPILOT_API_KEY")]
    api_key_env: String,
}

pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let store = Arc::new(FileStore::new(&args.storage_dir));
    let factory = Arc::new(OpenAiFactory {
        api_base: args.api_base,
        default_model: args.model,
        api_key_env: args.api_key_env,
    });
    let service = SessionService::new(store, factory);
    service.hydrate().await;

    let state = ServeState::new(Arc::clone(&service));
    let router = build_router(state);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .context("invalid host/port")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "webpilot listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(service))
        .await
        .context("server error")
}

async fn shutdown_signal(service: Arc<SessionService>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested, cancelling session work");
    service.shutdown();
}
