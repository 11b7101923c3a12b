//! Entry point: load configuration, connect to Postgres, serve HTTP until
//! `SIGINT`/`SIGTERM`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use updsrv::admission::AdmissionController;
use updsrv::api::{AppState, HttpServer};
use updsrv::cache::{CacheStore, DiffCache, PostgresCacheStore};
use updsrv::catalog::{self, PostgresCatalog};
use updsrv::config::Config;
use updsrv::db::Db;
use updsrv::error::Error;
use updsrv::service::Service;
use updsrv::{blob, Result};

#[derive(Parser, Debug)]
#[command(name = "updsrv", about = "Differential software-update delivery server")]
struct Cli {
    /// Path to a TOML configuration file. Values present also as environment
    /// variables take precedence over the file.
    #[arg(long, env = "CONFIG_PATH")]
    config_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config_path.as_deref())?;

    let db = Db::connect(
        &config.database_url,
        config.max_db_sessions,
        Duration::from_secs(config.max_db_session_idle_time),
        Duration::from_secs(config.db_read_timeout),
        Duration::from_secs(config.db_write_timeout),
    )
    .await?;

    init_schema(&db).await?;

    let catalog: Arc<dyn catalog::Catalog> =
        Arc::new(PostgresCatalog::new(db.clone(), config.max_version_count, config.min_version_age));
    let admission = AdmissionController::new(config.rate_limit, config.rate_limit_burst);
    let cache_store: Arc<dyn CacheStore> = Arc::new(PostgresCacheStore::new(db.clone()));
    let cache = Arc::new(DiffCache::new(catalog.clone(), cache_store, admission));
    let service = Arc::new(Service::new(catalog, cache));

    let state = AppState {
        service,
        read_tokens: Arc::new(config.read_tokens()),
        write_tokens: Arc::new(config.write_tokens()),
        read_timeout: Duration::from_secs(config.http_read_timeout),
        write_timeout: Duration::from_secs(config.http_write_timeout),
    };

    let server = HttpServer::new(
        state,
        (config.max_update_size_mb as usize) * 1024 * 1024,
        Duration::from_secs(config.http_write_timeout),
        Duration::from_secs(config.http_shutdown_timeout),
    );

    let addr = config.bind_addr()?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "updsrv starting");

    let result = server.run(addr).await;

    match &result {
        Ok(()) => tracing::info!("server stopped gracefully"),
        Err(e) => tracing::error!(error = %e, "server stopped with error"),
    }

    result
}

/// Idempotent schema bootstrap; `blobs` must exist before `files`/`cache`
/// since both reference it.
async fn init_schema(db: &Db) -> Result<()> {
    let conn = db.acquire_write().await?;
    conn.batch_execute(blob::CREATE_TABLE_SQL).await.map_err(Error::from)?;
    conn.batch_execute(catalog::CREATE_TABLE_SQL).await.map_err(Error::from)?;
    Ok(())
}
