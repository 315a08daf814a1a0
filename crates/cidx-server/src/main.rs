//! `cidxd` — the CIDX server binary.
//!
//! Loads config, opens the SQLite registry, wires the store/job/query
//! subsystems together, and serves REST (`cidx_server::api`) and MCP
//! (`cidx_server::mcp`) side by side on one Axum listener. CLI parsing
//! (`Cli`/`Commands`) stays separate from subsystem wiring (`serve`).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::streamable_http_server::StreamableHttpService;
use tracing_subscriber::prelude::*;

use cidx_core::embedding::EmbeddingProvider;
use cidx_server::access::AccessControl;
use cidx_server::api::{self, AppState};
use cidx_server::config::{self, Config};
use cidx_server::db;
use cidx_server::embedding::{HttpEmbeddingConfig, HttpEmbeddingProvider, NullEmbeddingProvider};
use cidx_server::jobs::{JobQueue, JobQueueConfig};
use cidx_server::mcp::McpBridge;
use cidx_server::ops::Metrics;
use cidx_server::repo::pipeline::StorePipeline;
use cidx_server::repo::{IndexPipeline, RepoJobExecutor, RepoManager};
use cidx_server::store::StoreRegistry;

#[derive(Parser)]
#[command(name = "cidxd", about = "CIDX — multi-tenant code intelligence server", version)]
struct Cli {
    #[arg(long, global = true, default_value = "./config/cidxd.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the registry database schema
    Init,
    /// Start the REST + MCP server
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "cidx_server=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            db::connect(&cfg).await?;
            println!("Registry database initialized at {}", cfg.db.path.display());
            Ok(())
        }
        Commands::Serve => serve(cfg).await,
    }
}

fn build_embedder(cfg: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
    if !cfg.embedding.is_enabled() {
        return Ok(Arc::new(NullEmbeddingProvider));
    }
    let base_url = cfg.embedding.base_url.clone().context("embedding.base_url missing")?;
    let model = cfg.embedding.model.clone().context("embedding.model missing")?;
    let dims = cfg.embedding.dims.context("embedding.dims missing")?;
    let provider = HttpEmbeddingProvider::new(HttpEmbeddingConfig {
        base_url,
        model,
        dims,
        max_tokens_per_request: cfg.embedding.max_tokens_per_request,
        max_retries: cfg.embedding.max_retries,
        timeout: Duration::from_secs(cfg.embedding.timeout_secs),
    })?;
    Ok(Arc::new(provider))
}

async fn serve(cfg: Config) -> Result<()> {
    let pool = db::connect(&cfg).await?;
    std::fs::create_dir_all(&cfg.storage.data_dir)
        .with_context(|| format!("failed to create data dir {}", cfg.storage.data_dir.display()))?;

    let embedder = build_embedder(&cfg)?;
    let embedding_dims = embedder.dims();

    let access = Arc::new(AccessControl::new(pool.clone()));
    let repos = Arc::new(RepoManager::new(pool.clone(), cfg.storage.data_dir.clone()));
    let stores = Arc::new(StoreRegistry::new(cfg.storage.data_dir.clone(), embedding_dims));
    let pipeline: Arc<dyn IndexPipeline> = Arc::new(StorePipeline::new(
        repos.clone(),
        stores.clone(),
        embedder.clone(),
        cfg.indexing.chunk_max_tokens,
        cfg.indexing.scip_generator_command.clone(),
    ));
    let query = Arc::new(cidx_server::query::QueryEngine::new(stores.clone(), embedder.clone(), repos.clone()));
    let metrics = Arc::new(Metrics::new());

    let executor = Arc::new(RepoJobExecutor {
        manager: repos.clone(),
        pipeline,
        default_timeout: Duration::from_secs(cfg.jobs.default_job_timeout_secs),
        refresh_timeout: Duration::from_secs(cfg.jobs.default_job_timeout_secs * 3),
    });

    let queue = Arc::new(JobQueue::new(
        pool.clone(),
        JobQueueConfig {
            max_concurrent_background_jobs: cfg.jobs.max_concurrent_background_jobs,
            poll_interval: Duration::from_secs(1),
            callback_result_ttl: Duration::from_secs(cfg.jobs.callback_result_ttl_secs),
        },
    ));
    queue.recover_on_boot().await?;

    let worker_queue = queue.clone();
    let worker_handle = tokio::spawn(async move { worker_queue.run(executor).await });

    let state = AppState {
        access: access.clone(),
        jobs: queue.clone(),
        repos: repos.clone(),
        query: query.clone(),
        metrics: metrics.clone(),
        pool: pool.clone(),
    };

    let mcp_bridge = McpBridge::new(access, query, repos, metrics);
    let mcp_service = StreamableHttpService::new(
        move || Ok(mcp_bridge.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let app = api::router(state).nest_service("/mcp", mcp_service);

    let bind_addr = cfg.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(%bind_addr, "cidxd listening");

    tokio::select! {
        result = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()) => {
            result.context("server exited with error")?;
        }
        result = worker_handle => {
            result.context("job queue worker panicked")?;
            bail!("job queue worker exited unexpectedly");
        }
    }

    queue.request_shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
