//! Snapshot of a completed HTTP exchange handed over by the proxy host.

use std::borrow::Cow;
use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use serde::{Deserialize, Serialize};

/// Header list in header-map order: values of a repeated name are grouped
/// together and kept as separate entries.
pub type Headers = Vec<(String, String)>;

/// Request half of a flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    /// Target host name or address.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Request method, e.g. `GET`.
    pub method: String,
    /// `http` or `https`.
    pub scheme: String,
    /// Authority as sent by the client (may be empty).
    pub authority: String,
    /// Path including the query string.
    pub path: String,
    /// Protocol version string, e.g. `HTTP/1.1`.
    pub http_version: String,
    /// Request headers.
    pub headers: Headers,
    /// Raw body as received. An empty body is `Some` of an empty vec;
    /// `None` means no body was captured.
    pub body: Option<Vec<u8>>,
}

/// Response half of a flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    /// Status code.
    pub status_code: u16,
    /// Response headers.
    pub headers: Headers,
    /// Raw body as received. An empty body is `Some` of an empty vec;
    /// `None` means no body was captured.
    pub body: Option<Vec<u8>>,
}

/// A completed request/response pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub request: RequestSnapshot,
    pub response: ResponseSnapshot,
}

impl RequestSnapshot {
    /// Body with any `Content-Encoding` removed.
    pub fn content(&self) -> Option<Cow<'_, [u8]>> {
        decoded_content(&self.headers, self.body.as_deref())
    }
}

impl ResponseSnapshot {
    /// Body with any `Content-Encoding` removed.
    pub fn content(&self) -> Option<Cow<'_, [u8]>> {
        decoded_content(&self.headers, self.body.as_deref())
    }
}

/// Returns the first value of a header, matching the name case-insensitively.
pub fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn decoded_content<'a>(
    headers: &[(String, String)],
    body: Option<&'a [u8]>,
) -> Option<Cow<'a, [u8]>> {
    let body = body?;
    let encoding = header(headers, "content-encoding").unwrap_or("identity");
    Some(decode_body(body, encoding))
}

/// Removes a `Content-Encoding` from a body.
///
/// Supports `gzip`, `x-gzip` and `deflate` (zlib-wrapped or raw). Unknown
/// encodings and corrupt payloads are returned unchanged.
pub fn decode_body<'a>(body: &'a [u8], encoding: &str) -> Cow<'a, [u8]> {
    let encoding = encoding.trim().to_ascii_lowercase();
    let decoded = match encoding.as_str() {
        "" | "identity" => return Cow::Borrowed(body),
        "gzip" | "x-gzip" => read_all(GzDecoder::new(body)),
        "deflate" => {
            read_all(ZlibDecoder::new(body)).or_else(|| read_all(DeflateDecoder::new(body)))
        }
        other => {
            tracing::debug!(encoding = other, "Unsupported content encoding, keeping raw body");
            None
        }
    };

    match decoded {
        Some(bytes) => Cow::Owned(bytes),
        None => Cow::Borrowed(body),
    }
}

fn read_all(mut reader: impl Read) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    match reader.read_to_end(&mut out) {
        Ok(_) => Some(out),
        Err(e) => {
            tracing::debug!("Failed to decode body: {}", e);
            None
        }
    }
}
