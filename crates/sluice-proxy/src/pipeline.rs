//! Archival of completed exchanges.

use sluice_core::FlowSnapshot;
use tracing::trace;

use crate::worker::StoreHandle;

/// Hands completed flows to the store worker, which classifies and
/// archives them.
#[derive(Debug, Clone)]
pub struct ArchivalPipeline {
    writes: StoreHandle,
}

impl ArchivalPipeline {
    pub fn new(writes: StoreHandle) -> Self {
        Self { writes }
    }

    /// Queues the flow as is. Bodies are not decoded or classified on the
    /// caller, and the store is never waited on.
    ///
    /// Returns false if the flow was dropped because the queue is full.
    pub fn on_response_complete(&self, flow: FlowSnapshot) -> bool {
        trace!(
            host = %flow.request.host,
            path = %flow.request.path,
            status = flow.response.status_code,
            "Queueing exchange for archive"
        );
        self.writes.archive(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use sluice_core::{ContentType, RequestSnapshot, ResponseSnapshot};
    use sluice_storage::{ArchiveStore, Database};
    use tokio::sync::mpsc;

    use crate::worker::{StoreCommand, StoreHandle, StoreWorker, WorkerConfig, WorkerStores};

    fn start(db: &Database) -> StoreWorker {
        StoreWorker::start(
            WorkerStores {
                ignore_hosts: Arc::new(db.clone()),
                archive: Arc::new(db.clone()),
            },
            WorkerConfig::default(),
        )
    }

    fn flow(response_headers: Vec<(String, String)>, body: Option<Vec<u8>>) -> FlowSnapshot {
        FlowSnapshot {
            request: RequestSnapshot {
                host: "api.example.com".to_string(),
                port: 443,
                method: "GET".to_string(),
                scheme: "https".to_string(),
                authority: "api.example.com".to_string(),
                path: "/v2/search?q=rust%20lang&q=ignored&page=2".to_string(),
                http_version: "HTTP/2.0".to_string(),
                headers: vec![
                    ("cookie".to_string(), "a=1".to_string()),
                    ("cookie".to_string(), "b=2".to_string()),
                ],
                body: None,
            },
            response: ResponseSnapshot {
                status_code: 200,
                headers: response_headers,
                body,
            },
        }
    }

    #[tokio::test]
    async fn archives_classified_exchange() {
        let db = Database::in_memory().unwrap();
        let worker = start(&db);
        let pipeline = ArchivalPipeline::new(worker.handle());

        let headers = vec![("content-type".to_string(), "application/json".to_string())];
        assert!(pipeline.on_response_complete(flow(headers, Some(br#"{"hits":[]}"#.to_vec()))));
        worker.shutdown().await;

        let stored = db.get(1).await.unwrap().unwrap();
        assert_eq!(stored.path, "/v2/search");
        assert_eq!(stored.path_hash.len(), 32);
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&stored.query).unwrap(),
            serde_json::json!({"q": "rust lang", "page": "2"})
        );
        assert_eq!(stored.request_content_type, ContentType::Null);
        assert!(stored.request_content.is_none());
        assert_eq!(stored.response_content_type, ContentType::Json);
        assert_eq!(stored.response_content.as_deref(), Some(r#"{"hits":[]}"#));
        assert!(stored.request_headers.contains("a=1"));
        assert!(stored.request_headers.contains("b=2"));
    }

    #[tokio::test]
    async fn gzip_body_is_classified_after_decoding() {
        let db = Database::in_memory().unwrap();
        let worker = start(&db);
        let pipeline = ArchivalPipeline::new(worker.handle());

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"<rss><channel/></rss>").unwrap();
        let gzipped = encoder.finish().unwrap();

        let headers = vec![("Content-Encoding".to_string(), "gzip".to_string())];
        pipeline.on_response_complete(flow(headers, Some(gzipped)));
        worker.shutdown().await;

        let stored = db.get(1).await.unwrap().unwrap();
        assert_eq!(stored.response_content_type, ContentType::Xml);
        assert_eq!(
            stored.response_content.as_deref(),
            Some("<rss><channel/></rss>")
        );
    }

    #[tokio::test]
    async fn binary_response_is_base64() {
        let db = Database::in_memory().unwrap();
        let worker = start(&db);
        let pipeline = ArchivalPipeline::new(worker.handle());

        let png = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0xff, 0x00];
        pipeline.on_response_complete(flow(Vec::new(), Some(png.clone())));
        worker.shutdown().await;

        let stored = db.get(1).await.unwrap().unwrap();
        assert_eq!(stored.response_content_type, ContentType::Binary);
        assert_eq!(stored.response_body().decode().unwrap(), Some(png));
    }

    #[tokio::test]
    async fn closed_worker_drops_exchange() {
        let db = Database::in_memory().unwrap();
        let worker = start(&db);
        let pipeline = ArchivalPipeline::new(worker.handle());
        worker.shutdown().await;

        assert!(!pipeline.on_response_complete(flow(Vec::new(), None)));
        assert_eq!(db.count_responses().unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_body_is_archived_as_empty_text() {
        let db = Database::in_memory().unwrap();
        let worker = start(&db);
        let pipeline = ArchivalPipeline::new(worker.handle());

        let mut no_content = flow(Vec::new(), Some(Vec::new()));
        no_content.response.status_code = 204;
        no_content.request.body = Some(Vec::new());
        pipeline.on_response_complete(no_content);
        worker.shutdown().await;

        let stored = db.get(1).await.unwrap().unwrap();
        assert_eq!(stored.status_code, 204);
        assert_eq!(stored.request_content_type, ContentType::Text);
        assert_eq!(stored.request_content.as_deref(), Some(""));
        assert_eq!(stored.response_content_type, ContentType::Text);
        assert_eq!(stored.response_content.as_deref(), Some(""));
    }

    #[test]
    fn flow_is_queued_without_classification() {
        let (tx, mut rx) = mpsc::channel(4);
        let pipeline = ArchivalPipeline::new(StoreHandle::new(tx));

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(br#"{"large":true}"#).unwrap();
        let headers = vec![("content-encoding".to_string(), "gzip".to_string())];
        let original = flow(headers, Some(encoder.finish().unwrap()));

        assert!(pipeline.on_response_complete(original.clone()));

        match rx.try_recv().unwrap() {
            // Still the raw gzip body: decoding happens in the worker
            StoreCommand::Archive(queued) => assert_eq!(*queued, original),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
