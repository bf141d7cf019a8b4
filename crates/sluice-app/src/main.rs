//! Sluice - interception proxy with ignore-host backoff and response archival.
//!
//! This binary wires the pieces together:
//! - datastore (MySQL from `DB_*` variables, or embedded SQLite)
//! - background store worker
//! - MITM proxy server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use sluice_proxy::{
    CaManager, ProxyConfig, ProxyServer, StoreWorker, WorkerConfig, WorkerStores,
    DEFAULT_HANDSHAKE_TIMEOUT,
};
use sluice_storage::{ArchiveStore, Database, DatastoreConfig, IgnoreHostStore, MySqlStore};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long shutdown waits for queued writes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Sluice - MITM proxy that backs off from hosts it keeps intercepting
#[derive(Parser, Debug)]
#[command(name = "sluice", version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Directory holding the root CA (default: platform data directory)
    #[arg(long)]
    ca_dir: Option<PathBuf>,

    /// Use an embedded SQLite database at this path instead of MySQL
    #[arg(long)]
    sqlite: Option<PathBuf>,

    /// Store commands buffered before new ones are dropped
    #[arg(long, default_value_t = sluice_proxy::worker::DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Store operations allowed to run at the same time
    #[arg(long, default_value_t = sluice_proxy::worker::DEFAULT_MAX_INFLIGHT)]
    max_inflight: usize,

    /// Seconds a client gets to use an intercepted tunnel
    #[arg(long, default_value_t = DEFAULT_HANDSHAKE_TIMEOUT.as_secs())]
    handshake_timeout: u64,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "sluice", "Sluice").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sluice={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            // Rotates daily, keeps five files
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("sluice")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// The datastore picked at startup.
enum Backend {
    MySql(MySqlStore),
    Sqlite(Database),
}

impl Backend {
    /// Opens the datastore. A failure here is fatal.
    async fn open(args: &Args) -> anyhow::Result<Self> {
        match &args.sqlite {
            Some(path) => {
                let db = Database::with_path(path)
                    .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;
                tracing::info!("Using SQLite database at {:?}", path);
                Ok(Self::Sqlite(db))
            }
            None => {
                let config =
                    DatastoreConfig::from_env().context("Invalid datastore configuration")?;
                tracing::debug!("Datastore config: {:?}", config);
                let store = MySqlStore::connect(&config)
                    .await
                    .context("Failed to connect to MySQL")?;
                Ok(Self::MySql(store))
            }
        }
    }

    fn ignore_hosts(&self) -> Arc<dyn IgnoreHostStore> {
        match self {
            Self::MySql(store) => Arc::new(store.clone()),
            Self::Sqlite(db) => Arc::new(db.clone()),
        }
    }

    fn archive(&self) -> Arc<dyn ArchiveStore> {
        match self {
            Self::MySql(store) => Arc::new(store.clone()),
            Self::Sqlite(db) => Arc::new(db.clone()),
        }
    }

    async fn close(&self) {
        match self {
            Self::MySql(store) => store.close().await,
            Self::Sqlite(db) => {
                if let Err(e) = db.close() {
                    tracing::warn!("Failed to close SQLite database: {}", e);
                }
            }
        }
    }
}

fn ca_manager(args: &Args) -> anyhow::Result<CaManager> {
    match &args.ca_dir {
        Some(dir) => Ok(CaManager::new(dir)),
        None => CaManager::with_default_dir().context("Failed to locate CA directory"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Initialize logging (keep guard alive for the duration of the program)
    let _log_guard = init_logging(&args);

    tracing::info!("Starting Sluice...");
    tracing::info!("Args: {:?}", args);

    let backend = Backend::open(&args).await?;

    let worker = StoreWorker::start(
        WorkerStores {
            ignore_hosts: backend.ignore_hosts(),
            archive: backend.archive(),
        },
        WorkerConfig {
            queue_capacity: args.queue_capacity,
            max_inflight: args.max_inflight,
        },
    );

    let config = ProxyConfig::with_ca_manager(ca_manager(&args)?)
        .with_addr(args.listen)
        .with_handshake_timeout(Duration::from_secs(args.handshake_timeout));

    let server = ProxyServer::new(config, backend.ignore_hosts(), worker.handle())
        .context("Failed to set up proxy")?;
    tracing::info!(
        "Clients must trust the CA certificate at {:?}",
        server.ca_cert_path()
    );
    let proxy = server.start().context("Failed to start proxy")?;
    tracing::info!("Sluice listening on {}", proxy.addr());

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
            tracing::info!("Shutdown requested");
        }
        _ = wait_finished(&proxy) => {
            tracing::error!("Proxy stopped unexpectedly");
        }
    }

    proxy.stop().await;
    worker.shutdown_timeout(DRAIN_TIMEOUT).await;
    backend.close().await;

    tracing::info!("Sluice shut down");
    Ok(())
}

/// Resolves once the proxy task exits on its own.
async fn wait_finished(proxy: &sluice_proxy::ProxyHandle) {
    while !proxy.is_finished() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["sluice"]).unwrap();
        assert_eq!(args.listen, SocketAddr::from(([127, 0, 0, 1], 8080)));
        assert_eq!(args.queue_capacity, 1024);
        assert_eq!(args.max_inflight, 16);
        assert_eq!(args.handshake_timeout, 10);
        assert!(args.sqlite.is_none());
        assert!(!args.debug);
    }

    #[test]
    fn sqlite_and_tuning_flags() {
        let args = Args::try_parse_from([
            "sluice",
            "--listen",
            "0.0.0.0:9090",
            "--sqlite",
            "/tmp/sluice.db",
            "--queue-capacity",
            "8",
            "--max-inflight",
            "2",
        ])
        .unwrap();

        assert_eq!(args.listen.port(), 9090);
        assert_eq!(args.sqlite, Some(PathBuf::from("/tmp/sluice.db")));
        assert_eq!(args.queue_capacity, 8);
        assert_eq!(args.max_inflight, 2);
    }

    #[test]
    fn invalid_listen_address_is_rejected() {
        assert!(Args::try_parse_from(["sluice", "--listen", "nowhere"]).is_err());
    }

    #[tokio::test]
    async fn sqlite_backend_opens_and_closes_twice() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data").join("sluice.db");
        let args = Args::try_parse_from(["sluice", "--sqlite", path.to_str().unwrap()]).unwrap();

        let backend = Backend::open(&args).await.unwrap();
        assert!(!backend
            .ignore_hosts()
            .is_ignored("example.com", chrono::Utc::now())
            .await
            .unwrap());

        backend.close().await;
        backend.close().await;
        assert!(path.exists());
    }
}
