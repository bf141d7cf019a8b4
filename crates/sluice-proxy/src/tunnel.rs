//! Intercepted CONNECT tunnels waiting for their client handshake to finish.
//!
//! A tunnel is opened when we decide to intercept, keyed by the client socket
//! address. The first decrypted request on that socket proves the client
//! accepted our certificate; a tunnel that never carries a request before the
//! handshake timeout is treated as a failed handshake.
//!
//! The timeout cannot tell a rejected certificate from a client that
//! finished the handshake and then sat idle, such as a browser preconnect.
//! Both are reported as failed, and a request that arrives after expiry is
//! not counted as established.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::hooks::{ConnectionInfo, ConnectionState, Decision};

/// Default time a client gets to finish its handshake and send a request.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct Tunnel {
    id: u64,
    connection: ConnectionInfo,
    state: ConnectionState,
    opened_at: Instant,
}

/// Shared table of tunnels whose handshake outcome is still unknown.
#[derive(Debug, Clone)]
pub struct TunnelTracker {
    tunnels: Arc<Mutex<HashMap<SocketAddr, Tunnel>>>,
    next_id: Arc<AtomicU64>,
    handshake_timeout: Duration,
}

impl Default for TunnelTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HANDSHAKE_TIMEOUT)
    }
}

impl TunnelTracker {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self {
            tunnels: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            handshake_timeout,
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Starts tracking an intercepted tunnel. Returns its id.
    ///
    /// A tunnel still open on the same client address is replaced.
    pub fn open(&self, client: SocketAddr, connection: ConnectionInfo) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tunnel = Tunnel {
            id,
            connection,
            state: ConnectionState::HelloReceived.decided(Decision::Intercept),
            opened_at: Instant::now(),
        };

        let mut tunnels = self.tunnels.lock();
        // Entries whose timeout task never ran (runtime shutting down)
        let stale = self.handshake_timeout * 2;
        tunnels.retain(|_, t| t.opened_at.elapsed() < stale);
        tunnels.insert(client, tunnel);
        id
    }

    /// Marks the client's pending tunnel as established and stops tracking
    /// it. Returns the connection the first time only.
    pub fn established(&self, client: SocketAddr) -> Option<ConnectionInfo> {
        self.finish(client, None, ConnectionState::established)
    }

    /// Marks tunnel `id` as failed if it is still pending.
    pub fn expire(&self, client: SocketAddr, id: u64) -> Option<ConnectionInfo> {
        self.finish(client, Some(id), ConnectionState::failed)
    }

    /// Number of tunnels still waiting for a handshake outcome.
    pub fn pending(&self) -> usize {
        self.tunnels.lock().len()
    }

    fn finish(
        &self,
        client: SocketAddr,
        id: Option<u64>,
        transition: fn(ConnectionState) -> ConnectionState,
    ) -> Option<ConnectionInfo> {
        let mut tunnels = self.tunnels.lock();
        let tunnel = tunnels.get(&client)?;
        if id.is_some_and(|id| id != tunnel.id) || !tunnel.state.is_pending() {
            return None;
        }

        let tunnel = tunnels.remove(&client)?;
        trace!(
            %client,
            address = %tunnel.connection.destination(),
            state = ?transition(tunnel.state),
            elapsed = ?tunnel.opened_at.elapsed(),
            "Tunnel handshake settled"
        );
        Some(tunnel.connection)
    }
}
