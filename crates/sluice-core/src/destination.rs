//! Destination key used for ignore-host tracking.
//!
//! The key is the TLS SNI when the client sent one, and a printable
//! `host:port` of the server address otherwise. Every lifecycle hook must
//! resolve the destination the same way or backoff state ends up split across
//! two keys.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Store key identifying a destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Destination(String);

impl Destination {
    /// Resolves the destination from an optional SNI and the server address.
    ///
    /// An empty SNI counts as absent.
    pub fn resolve(sni: Option<&str>, host: &str, port: u16) -> Self {
        match sni.map(str::trim).filter(|s| !s.is_empty()) {
            Some(sni) => Self(sni.to_string()),
            None => Self(format_address(host, port)),
        }
    }

    /// Wraps an already-resolved key.
    pub fn from_key(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the store key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the destination, returning the store key.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Destination {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Formats a server address for humans.
///
/// IPv6 hosts are bracketed, IPv4-mapped IPv6 addresses are shown as IPv4,
/// and the unspecified address is shown as `*`. Hostnames are left as they
/// are.
pub fn format_address(host: &str, port: u16) -> String {
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    match bare.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => format!("*:{port}"),
        Ok(IpAddr::V4(v4)) => format!("{v4}:{port}"),
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => format!("{v4}:{port}"),
            None => format!("[{v6}]:{port}"),
        },
        Err(_) => format!("{host}:{port}"),
    }
}
