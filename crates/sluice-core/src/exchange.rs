//! Archive row built from a completed flow.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::content::{encode_body, ContentType, StoredBody};
use crate::flow::FlowSnapshot;

/// One archived request/response pair, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedExchange {
    pub host: String,
    pub port: u16,
    pub method: String,
    pub scheme: String,
    pub authority: String,
    /// Path without the query string.
    pub path: String,
    /// MD5 hex digest of `path`.
    pub path_hash: String,
    /// Query parameters as a JSON object.
    pub query: String,
    /// Request body text, or base64 when `request_content_type` is `Binary`.
    pub request_content: Option<String>,
    pub request_content_type: ContentType,
    pub http_version: String,
    /// Request headers as a JSON array of `[name, value]` pairs.
    pub request_headers: String,
    pub status_code: u16,
    /// Response headers as a JSON array of `[name, value]` pairs.
    pub response_headers: String,
    /// Response body text, or base64 when `response_content_type` is `Binary`.
    pub response_content: Option<String>,
    pub response_content_type: ContentType,
}

impl ArchivedExchange {
    /// Builds the archive row for a flow.
    ///
    /// Bodies are decoded from their `Content-Encoding`, classified, and
    /// base64-encoded when they are not UTF-8.
    pub fn from_flow(flow: &FlowSnapshot) -> Self {
        let request = &flow.request;
        let response = &flow.response;

        let (path, query) = split_path(&request.path);
        let request_body = encode_body(request.content().as_deref());
        let response_body = encode_body(response.content().as_deref());

        Self {
            host: request.host.clone(),
            port: request.port,
            method: request.method.clone(),
            scheme: request.scheme.clone(),
            authority: request.authority.clone(),
            path: path.to_string(),
            path_hash: path_hash(path),
            query: serialize_query(query),
            request_content: request_body.content,
            request_content_type: request_body.content_type,
            http_version: request.http_version.clone(),
            request_headers: serialize_headers(&request.headers),
            status_code: response.status_code,
            response_headers: serialize_headers(&response.headers),
            response_content: response_body.content,
            response_content_type: response_body.content_type,
        }
    }

    /// Request body in its stored form.
    pub fn request_body(&self) -> StoredBody {
        StoredBody {
            content: self.request_content.clone(),
            content_type: self.request_content_type,
        }
    }

    /// Response body in its stored form.
    pub fn response_body(&self) -> StoredBody {
        StoredBody {
            content: self.response_content.clone(),
            content_type: self.response_content_type,
        }
    }
}

/// Splits a request target into the bare path and the raw query string.
pub fn split_path(target: &str) -> (&str, Option<&str>) {
    match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    }
}

/// MD5 hex digest of a path, used as an index key.
pub fn path_hash(path: &str) -> String {
    hex::encode(Md5::digest(path.as_bytes()))
}

/// Serializes a raw query string as a JSON object.
///
/// Keys and values are percent-decoded. When a key repeats, the first value
/// is kept.
pub fn serialize_query(query: Option<&str>) -> String {
    let mut params = Map::new();
    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            params
                .entry(key.into_owned())
                .or_insert_with(|| Value::String(value.into_owned()));
        }
    }
    Value::Object(params).to_string()
}

/// Serializes headers as a JSON array of `[name, value]` pairs, in the
/// order given.
pub fn serialize_headers(headers: &[(String, String)]) -> String {
    let pairs: Vec<Value> = headers
        .iter()
        .map(|(name, value)| {
            Value::Array(vec![Value::from(name.as_str()), Value::from(value.as_str())])
        })
        .collect();
    Value::Array(pairs).to_string()
}

/// Parses headers serialized by [`serialize_headers`].
pub fn deserialize_headers(serialized: &str) -> serde_json::Result<Vec<(String, String)>> {
    serde_json::from_str(serialized)
}
