//! hudsucker handler wiring proxy callbacks to the decision engine and the
//! archive pipeline.
//!
//! | proxy callback                           | event                  |
//! |------------------------------------------|------------------------|
//! | `should_intercept` on a CONNECT          | client hello           |
//! | first request on an intercepted tunnel   | TLS established        |
//! | no request before the handshake timeout  | TLS failed             |
//! | `handle_response`                        | response complete      |

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hudsucker::{
    hyper::{Method, Request, Response, StatusCode},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::Bytes;
use hyper::http::request::Parts;
use hyper::http::uri::Authority;
use hyper::http::HeaderMap;
use sluice_core::{FlowSnapshot, Headers, RequestSnapshot, ResponseSnapshot};
use tracing::{debug, warn};

use crate::engine::DecisionEngine;
use crate::hooks::{ClientHello, ConnectionInfo, Decision};
use crate::pipeline::ArchivalPipeline;
use crate::tunnel::TunnelTracker;

/// Helper to convert bytes to Body
fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

/// Error reported when a client never used an intercepted tunnel.
#[derive(Debug)]
struct HandshakeTimeout(Duration);

impl fmt::Display for HandshakeTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "client sent no request within {:?} of the handshake (certificate rejected?)",
            self.0
        )
    }
}

/// HTTP handler for the MITM proxy.
///
/// hudsucker clones the handler for every request, so `pending` only ever
/// holds the request currently in flight on this clone.
#[derive(Clone, Debug)]
pub struct ProxyHandler {
    engine: DecisionEngine,
    pipeline: ArchivalPipeline,
    tunnels: TunnelTracker,
    pending: Option<RequestSnapshot>,
}

impl ProxyHandler {
    /// Creates a new proxy handler.
    pub fn new(engine: DecisionEngine, pipeline: ArchivalPipeline, tunnels: TunnelTracker) -> Self {
        Self {
            engine,
            pipeline,
            tunnels,
            pending: None,
        }
    }

    /// Decides whether to terminate TLS on a CONNECT tunnel.
    async fn decide(&self, client: SocketAddr, connect: &Request<Body>) -> bool {
        let Some(connection) = connect_target(connect) else {
            return true;
        };

        let mut hello = ClientHello::new(connection);
        match self.engine.on_client_hello(&mut hello).await {
            Decision::Bypass => false,
            Decision::Intercept => {
                let id = self.tunnels.open(client, hello.connection);
                self.watch_handshake(client, id);
                true
            }
        }
    }

    /// Reports a failed handshake if the tunnel is still pending after the
    /// timeout.
    fn watch_handshake(&self, client: SocketAddr, id: u64) {
        let tunnels = self.tunnels.clone();
        let engine = self.engine.clone();
        let timeout = tunnels.handshake_timeout();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(connection) = tunnels.expire(client, id) {
                engine.on_tls_failed(&connection, &HandshakeTimeout(timeout));
            }
        });
    }

    /// Called for every decrypted request.
    fn observe_request(&self, client: SocketAddr) {
        if let Some(connection) = self.tunnels.established(client) {
            self.engine.on_tls_established(&connection);
        }
    }

    /// Archives the exchange if the request half was captured.
    fn complete(&mut self, response: ResponseSnapshot) {
        if let Some(request) = self.pending.take() {
            self.pipeline.on_response_complete(FlowSnapshot { request, response });
        }
    }
}

impl HttpHandler for ProxyHandler {
    async fn handle_request(
        &mut self,
        ctx: &HttpContext,
        req: Request<Body>,
    ) -> RequestOrResponse {
        if req.method() == Method::CONNECT {
            return RequestOrResponse::Request(req);
        }

        self.observe_request(ctx.client_addr);

        let (parts, body) = req.into_parts();
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("Failed to read request body: {}", e);
                return RequestOrResponse::Request(Request::from_parts(parts, Body::empty()));
            }
        };

        self.pending = Some(request_snapshot(&parts, &body_bytes));

        RequestOrResponse::Request(Request::from_parts(parts, bytes_to_body(body_bytes)))
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        let (parts, body) = res.into_parts();
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("Failed to read response body: {}", e);
                self.pending = None;
                return Response::from_parts(parts, Body::empty());
            }
        };

        self.complete(ResponseSnapshot {
            status_code: parts.status.as_u16(),
            headers: header_pairs(&parts.headers),
            body: Some(body_bytes.to_vec()),
        });

        Response::from_parts(parts, bytes_to_body(body_bytes))
    }

    async fn handle_error(
        &mut self,
        _ctx: &HttpContext,
        err: hyper_util::client::legacy::Error,
    ) -> Response<Body> {
        let target = self
            .pending
            .take()
            .map(|r| format!("{}:{}{}", r.host, r.port, r.path))
            .unwrap_or_default();
        warn!(target = %target, error = %err, "Failed to forward request");

        let mut res = Response::new(Body::empty());
        *res.status_mut() = StatusCode::BAD_GATEWAY;
        res
    }

    async fn should_intercept(&mut self, ctx: &HttpContext, req: &Request<Body>) -> bool {
        self.decide(ctx.client_addr, req).await
    }
}

/// Connection info for a CONNECT request.
///
/// The SNI is not visible yet; a hostname authority is what the client will
/// send as SNI, so it stands in for it. IP literals fall back to the
/// formatted address.
fn connect_target(req: &Request<Body>) -> Option<ConnectionInfo> {
    let authority = req.uri().authority()?;
    let host = authority.host();
    let port = authority.port_u16().unwrap_or(443);

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    let sni = match bare.parse::<IpAddr>() {
        Ok(_) => None,
        Err(_) => Some(bare),
    };

    debug!(host = bare, port, "CONNECT");
    Some(ConnectionInfo::new(sni, bare, port))
}

fn request_snapshot(parts: &Parts, body: &Bytes) -> RequestSnapshot {
    let uri = &parts.uri;
    let scheme = uri.scheme_str().unwrap_or("http").to_string();

    // Origin-form requests only carry the target in the Host header
    let host_header: Option<Authority> = parts
        .headers
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.parse().ok());

    let host = uri
        .host()
        .or_else(|| host_header.as_ref().map(Authority::host))
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();

    let port = uri
        .port_u16()
        .or_else(|| host_header.as_ref().and_then(Authority::port_u16))
        .unwrap_or(if scheme == "https" { 443 } else { 80 });

    RequestSnapshot {
        host,
        port,
        method: parts.method.as_str().to_string(),
        scheme,
        authority: uri
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_default(),
        path: uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        http_version: format!("{:?}", parts.version),
        headers: header_pairs(&parts.headers),
        body: Some(body.to_vec()),
    }
}

/// Header list in map order: values of a repeated name come out together,
/// so interleaved names do not keep their wire order.
fn header_pairs(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use sluice_core::ManualClock;
    use sluice_storage::Database;

    use crate::worker::{StoreWorker, WorkerConfig, WorkerStores};

    fn connect(authority: &str) -> Request<Body> {
        Request::builder()
            .method(Method::CONNECT)
            .uri(authority)
            .body(Body::empty())
            .unwrap()
    }

    fn client() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 53000))
    }

    fn setup(timeout: Duration) -> (Database, StoreWorker, ProxyHandler) {
        let db = Database::in_memory().unwrap();
        let worker = StoreWorker::start(
            WorkerStores {
                ignore_hosts: Arc::new(db.clone()),
                archive: Arc::new(db.clone()),
            },
            WorkerConfig::default(),
        );
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap());
        let engine = DecisionEngine::new(Arc::new(db.clone()), worker.handle(), Arc::new(clock));
        let handler = ProxyHandler::new(
            engine,
            ArchivalPipeline::new(worker.handle()),
            TunnelTracker::new(timeout),
        );
        (db, worker, handler)
    }

    #[test]
    fn hostname_authority_stands_in_for_sni() {
        let target = connect_target(&connect("example.com:443")).unwrap();
        assert_eq!(target.sni.as_deref(), Some("example.com"));
        assert_eq!(target.destination().as_str(), "example.com");
    }

    #[test]
    fn ip_authority_uses_formatted_address() {
        let target = connect_target(&connect("93.184.216.34:8443")).unwrap();
        assert_eq!(target.sni, None);
        assert_eq!(target.destination().as_str(), "93.184.216.34:8443");

        let target = connect_target(&connect("[2001:db8::1]:443")).unwrap();
        assert_eq!(target.destination().as_str(), "[2001:db8::1]:443");
    }

    #[test]
    fn request_snapshot_reads_absolute_uri() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("https://api.example.com/v1/items?id=7")
            .header("accept", "application/json")
            .header("x-trace", "a")
            .header("x-trace", "b")
            .body(())
            .unwrap();
        let (parts, ()) = req.into_parts();

        let snapshot = request_snapshot(&parts, &Bytes::from_static(b"{}"));
        assert_eq!(snapshot.host, "api.example.com");
        assert_eq!(snapshot.port, 443);
        assert_eq!(snapshot.scheme, "https");
        assert_eq!(snapshot.method, "POST");
        assert_eq!(snapshot.authority, "api.example.com");
        assert_eq!(snapshot.path, "/v1/items?id=7");
        assert_eq!(snapshot.http_version, "HTTP/1.1");
        assert_eq!(snapshot.body.as_deref(), Some(&b"{}"[..]));
        assert_eq!(
            snapshot
                .headers
                .iter()
                .filter(|(name, _)| name == "x-trace")
                .count(),
            2
        );
    }

    #[test]
    fn header_pairs_group_repeated_names() {
        let mut headers = HeaderMap::new();
        headers.append("x-a", "1".parse().unwrap());
        headers.append("x-b", "2".parse().unwrap());
        headers.append("x-a", "3".parse().unwrap());

        let owned = header_pairs(&headers);
        let pairs: Vec<(&str, &str)> = owned
            .iter()
            .map(|(n, v)| (n.as_str(), v.as_str()))
            .collect();
        assert_eq!(pairs, vec![("x-a", "1"), ("x-a", "3"), ("x-b", "2")]);
    }

    #[test]
    fn request_snapshot_falls_back_to_host_header() {
        let req = Request::builder()
            .uri("/health")
            .header("host", "internal.example:8080")
            .body(())
            .unwrap();
        let (parts, ()) = req.into_parts();

        let snapshot = request_snapshot(&parts, &Bytes::new());
        assert_eq!(snapshot.host, "internal.example");
        assert_eq!(snapshot.port, 8080);
        assert_eq!(snapshot.path, "/health");
        assert_eq!(snapshot.body, Some(Vec::new()));
    }

    #[tokio::test]
    async fn first_request_records_established_tunnel() {
        let (db, worker, handler) = setup(Duration::from_secs(60));

        assert!(handler.decide(client(), &connect("example.com:443")).await);
        handler.observe_request(client());
        handler.observe_request(client());
        worker.shutdown().await;

        let record = db.find_ignore_host("example.com").unwrap().unwrap();
        assert_eq!(record.next_check_phase, 1);
    }

    #[tokio::test]
    async fn recently_seen_host_is_bypassed() {
        let (db, worker, handler) = setup(Duration::from_secs(60));
        db.upsert_ignore_host("example.com", Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap())
            .unwrap();

        assert!(!handler.decide(client(), &connect("example.com:443")).await);
        assert_eq!(handler.tunnels.pending(), 0);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn silent_tunnel_resets_backoff() {
        let (db, worker, handler) = setup(Duration::from_millis(20));
        db.upsert_ignore_host("example.com", Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap())
            .unwrap();

        assert!(handler.decide(client(), &connect("example.com:443")).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.shutdown().await;

        assert!(db.find_ignore_host("example.com").unwrap().is_none());
        assert_eq!(handler.tunnels.pending(), 0);
    }

    #[tokio::test]
    async fn completed_exchange_is_archived() {
        let (db, worker, mut handler) = setup(Duration::from_secs(60));
        handler.pending = Some(RequestSnapshot {
            host: "api.example.com".to_string(),
            port: 443,
            method: "GET".to_string(),
            scheme: "https".to_string(),
            path: "/".to_string(),
            http_version: "HTTP/1.1".to_string(),
            ..Default::default()
        });

        handler.complete(ResponseSnapshot {
            status_code: 204,
            ..Default::default()
        });
        handler.complete(ResponseSnapshot::default());
        worker.shutdown().await;

        assert_eq!(db.count_responses().unwrap(), 1);
    }
}
