mod adapters;
mod api;
mod auth;
mod config;
mod error;
mod runs;
mod store;
mod workspace;

use std::error::Error;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::adapters::AdapterRegistry;
use crate::adapters::ai::AiAdapter;
use crate::adapters::file_editor::FileEditorAdapter;
use crate::adapters::pty::PtyAdapter;
use crate::auth::Authenticator;
use crate::runs::manager::RunSessionManager;
use crate::store::EventStore;
use crate::workspace::WorkspaceRoot;

#[derive(Parser)]
#[command(name = "dispatch", about = "Browser-accessible multi-session runtime")]
enum Cli {
    /// Start the server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    // Default to Serve when no subcommand is given, but keep --help and
    // --version working.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 { Cli::Serve } else { Cli::parse() };

    match cli {
        Cli::Serve => run_server().await,
    }
}

async fn run_server() -> Result<(), Box<dyn Error>> {
    let config = config::Config::from_env();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            std::env::var("DISPATCH_LOG").map(EnvFilter::new)
        })
        .unwrap_or_else(|_| EnvFilter::new("dispatch=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let auth_key = config
        .auth_key
        .clone()
        .context("DISPATCH_AUTH_KEY must be set")?;

    std::fs::create_dir_all(&config.workspace_root).with_context(|| {
        format!(
            "failed to create workspace root {}",
            config.workspace_root.display()
        )
    })?;
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data dir {}", parent.display()))?;
    }

    let store = Arc::new(
        EventStore::open(&config.db_path)
            .with_context(|| format!("failed to open event store {}", config.db_path.display()))?,
    );

    let workspace = WorkspaceRoot::new(config.workspace_root.clone());
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(PtyAdapter::new(workspace.clone())));
    registry.register(Arc::new(AiAdapter::new(workspace.clone())));
    registry.register(Arc::new(FileEditorAdapter::new(workspace)));

    let manager = Arc::new(RunSessionManager::new(
        store,
        registry,
        config.close_grace,
    ));

    let swept = manager
        .startup_sweep()
        .await
        .context("startup session sweep failed")?;
    tracing::info!(
        kinds = ?manager.kinds(),
        swept,
        workspace_root = %config.workspace_root.display(),
        db = %config.db_path.display(),
        "run-session core ready"
    );

    let app = api::create_app(api::AppState {
        manager,
        auth: Authenticator::new(auth_key),
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    println!("Listening on http://{addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
