//! Connection lifecycle events delivered by the proxy host.

use sluice_core::Destination;

/// What the proxy knows about a TLS connection when a hook fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// SNI sent by the client, if any.
    pub sni: Option<String>,
    /// Server the client asked for.
    pub server_host: String,
    pub server_port: u16,
}

impl ConnectionInfo {
    pub fn new(sni: Option<&str>, server_host: impl Into<String>, server_port: u16) -> Self {
        Self {
            sni: sni.map(str::to_string),
            server_host: server_host.into(),
            server_port,
        }
    }

    /// Store key for this connection. Every hook resolves it the same way.
    pub fn destination(&self) -> Destination {
        Destination::resolve(self.sni.as_deref(), &self.server_host, self.server_port)
    }
}

/// A client hello, with the flag that turns interception off for this
/// connection only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub connection: ConnectionInfo,
    pub ignore_connection: bool,
}

impl ClientHello {
    pub fn new(connection: ConnectionInfo) -> Self {
        Self {
            connection,
            ignore_connection: false,
        }
    }
}

/// Outcome of the hello hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Terminate TLS and inspect the traffic.
    Intercept,
    /// Pass the encrypted stream through untouched.
    Bypass,
}

/// Where a connection is in its TLS lifecycle.
///
/// ```text
/// Unknown ─hello─▶ HelloReceived ─┬─ bypass ──▶ Bypassed ─────────▶ Closed
///                                 └─ intercept ─┬─ established ─▶ Established ─▶ Closed
///                                               └─ failed ──────▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Unknown,
    HelloReceived,
    Bypassed,
    Intercepting,
    Established,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Applies the hello decision.
    pub fn decided(self, decision: Decision) -> Self {
        match (self, decision) {
            (Self::Unknown | Self::HelloReceived, Decision::Bypass) => Self::Bypassed,
            (Self::Unknown | Self::HelloReceived, Decision::Intercept) => Self::Intercepting,
            (other, _) => other,
        }
    }

    /// Handshake with the client completed. Only intercepted connections
    /// can get here.
    pub fn established(self) -> Self {
        match self {
            Self::Intercepting => Self::Established,
            other => other,
        }
    }

    /// Handshake with the client failed.
    pub fn failed(self) -> Self {
        match self {
            Self::Intercepting => Self::Failed,
            other => other,
        }
    }

    pub fn closed(self) -> Self {
        match self {
            Self::Failed => Self::Failed,
            _ => Self::Closed,
        }
    }

    /// Returns true while the handshake outcome is still pending.
    pub fn is_pending(self) -> bool {
        self == Self::Intercepting
    }
}
