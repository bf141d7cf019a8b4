//! MITM proxy server.
//!
//! Binds the listener, loads the root CA and runs the hudsucker proxy with a
//! [`ProxyHandler`] until shut down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use sluice_core::{Clock, SystemClock};
use sluice_storage::IgnoreHostStore;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::ca::CaManager;
use crate::engine::DecisionEngine;
use crate::error::{ProxyError, Result};
use crate::handler::ProxyHandler;
use crate::pipeline::ArchivalPipeline;
use crate::tunnel::{TunnelTracker, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::worker::StoreHandle;
use crate::DEFAULT_PROXY_PORT;

/// Proxy server configuration.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// The CA manager for certificate generation.
    pub ca_manager: CaManager,
    /// Time a client gets to use an intercepted tunnel before the handshake
    /// counts as failed.
    pub handshake_timeout: Duration,
    /// Source of `now` for backoff decisions.
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("addr", &self.addr)
            .field("ca_manager", &self.ca_manager)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl ProxyConfig {
    /// Creates a configuration listening on localhost with the given CA.
    pub fn with_ca_manager(ca_manager: CaManager) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            ca_manager,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// MITM proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    ignore_hosts: Arc<dyn IgnoreHostStore>,
    writes: StoreHandle,
}

impl ProxyServer {
    /// Creates a new proxy server. Generates the CA if it doesn't exist.
    ///
    /// Reads go straight to `ignore_hosts`; every write goes through `writes`.
    pub fn new(
        config: ProxyConfig,
        ignore_hosts: Arc<dyn IgnoreHostStore>,
        writes: StoreHandle,
    ) -> Result<Self> {
        config.ca_manager.ensure_ca()?;

        Ok(Self {
            config,
            ignore_hosts,
            writes,
        })
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    /// Returns the CA certificate path for client installation.
    pub fn ca_cert_path(&self) -> std::path::PathBuf {
        self.config.ca_manager.cert_path()
    }

    fn handler(&self) -> ProxyHandler {
        let engine = DecisionEngine::new(
            self.ignore_hosts.clone(),
            self.writes.clone(),
            self.config.clock.clone(),
        );
        ProxyHandler::new(
            engine,
            ArchivalPipeline::new(self.writes.clone()),
            TunnelTracker::new(self.config.handshake_timeout),
        )
    }

    /// Builds the proxy and spawns it on the current runtime.
    ///
    /// Build errors are returned here; a failure to bind or serve is logged
    /// by the spawned task, which then exits (see [`ProxyHandle::is_finished`]).
    pub fn start(self) -> Result<ProxyHandle> {
        let addr = self.config.addr;
        let authority = self.config.ca_manager.ensure_ca()?;

        let proxy = Proxy::builder()
            .with_addr(addr)
            .with_ca(authority)
            .with_rustls_connector(default_provider())
            .with_http_handler(self.handler())
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        info!(
            %addr,
            ca = ?self.ca_cert_path(),
            handshake_timeout = ?self.config.handshake_timeout,
            "Starting MITM proxy"
        );

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let handle = tokio::spawn(async move {
            tokio::select! {
                result = proxy.start() => {
                    if let Err(e) = result {
                        error!(%addr, error = %e, "Proxy stopped with error");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!(%addr, "Proxy shutting down");
                }
            }
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Returns true once the proxy task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_storage::Database;
    use tempfile::TempDir;

    use crate::worker::{StoreWorker, WorkerConfig, WorkerStores};

    fn test_config(dir: &TempDir) -> ProxyConfig {
        ProxyConfig::with_ca_manager(CaManager::new(dir.path().join("ca")))
            .with_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    fn worker(db: &Database) -> StoreWorker {
        StoreWorker::start(
            WorkerStores {
                ignore_hosts: Arc::new(db.clone()),
                archive: Arc::new(db.clone()),
            },
            WorkerConfig::default(),
        )
    }

    #[test]
    fn proxy_config_builders() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir)
            .with_addr(SocketAddr::from(([127, 0, 0, 1], 8888)))
            .with_handshake_timeout(Duration::from_secs(3));
        assert_eq!(config.addr.port(), 8888);
        assert_eq!(config.handshake_timeout, Duration::from_secs(3));
    }

    #[test]
    fn proxy_config_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ProxyConfig::with_ca_manager(CaManager::new(dir.path()));
        assert_eq!(config.addr.port(), DEFAULT_PROXY_PORT);
        assert_eq!(config.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
        assert!(format!("{:?}", config).contains("ProxyConfig"));
    }

    #[tokio::test]
    async fn proxy_server_generates_ca() {
        let dir = TempDir::new().unwrap();
        let db = Database::in_memory().unwrap();
        let worker = worker(&db);

        let server = ProxyServer::new(test_config(&dir), Arc::new(db.clone()), worker.handle())
            .unwrap();

        assert!(server.ca_cert_path().exists());
        assert!(server
            .ca_cert_path()
            .to_string_lossy()
            .contains("sluice-ca.crt"));
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn proxy_handle_shutdown() {
        let dir = TempDir::new().unwrap();
        let db = Database::in_memory().unwrap();
        let worker = worker(&db);

        let server = ProxyServer::new(test_config(&dir), Arc::new(db.clone()), worker.handle())
            .unwrap();
        let addr = server.addr();
        let handle = server.start().unwrap();
        assert_eq!(handle.addr(), addr);

        // Give it a moment to start
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.stop().await;
        worker.shutdown().await;
    }
}
