//! Sluice Proxy - MITM proxy that backs off from hosts it keeps intercepting
//! and archives every exchange it sees.
//!
//! ## Features
//!
//! - Generates root CA certificate on first run
//! - Creates per-host certificates on the fly
//! - Skips interception for destinations inside their backoff window
//! - Records successful interceptions and resets the backoff on failure
//! - Classifies and archives every completed request/response pair
//! - Keeps all datastore writes off the connection path
//!
//! ## Architecture
//!
//! ```text
//! CONNECT ──▶ DecisionEngine ──is_ignored?──▶ IgnoreHostStore
//!                 │
//!     ┌───────────┴───────────┐
//!     │ ignored               │ not ignored
//!     ▼                       ▼
//! Passthrough          Intercept TLS ──▶ established / failed
//!                             │                 │
//!                             ▼                 ▼
//!                      ArchivalPipeline     StoreHandle ──▶ StoreWorker ──▶ stores
//!                             │                                 ▲
//!                             └─────────────────────────────────┘
//! ```

mod ca;
pub mod engine;
mod error;
mod handler;
pub mod hooks;
pub mod pipeline;
mod proxy;
pub mod tunnel;
pub mod worker;

pub use ca::{CaManager, CaManagerError};
pub use engine::DecisionEngine;
pub use error::{ProxyError, Result};
pub use handler::ProxyHandler;
pub use hooks::{ClientHello, ConnectionInfo, ConnectionState, Decision};
pub use pipeline::ArchivalPipeline;
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};
pub use tunnel::{TunnelTracker, DEFAULT_HANDSHAKE_TIMEOUT};
pub use worker::{StoreCommand, StoreHandle, StoreWorker, WorkerConfig, WorkerStores};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8080;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_correct() {
        assert_eq!(DEFAULT_PROXY_PORT, 8080);
    }
}
