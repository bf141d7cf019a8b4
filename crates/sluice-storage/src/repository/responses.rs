//! Response archive repository.

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use sluice_core::{ArchivedExchange, ContentType};

use crate::error::Result;

/// Repository for `responses` operations.
pub struct ResponsesRepo;

impl ResponsesRepo {
    /// Insert an archived exchange.
    pub fn insert(conn: &Connection, exchange: &ArchivedExchange) -> Result<i64> {
        conn.execute(
            "INSERT INTO responses (
                host, port, method, scheme, authority, path, path_hash, query,
                request_content, request_content_type, http_version, request_headers,
                status_code, response_headers, response_content, response_content_type
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                exchange.host,
                exchange.port,
                exchange.method,
                exchange.scheme,
                exchange.authority,
                exchange.path,
                exchange.path_hash,
                exchange.query,
                exchange.request_content,
                exchange.request_content_type.as_str(),
                exchange.http_version,
                exchange.request_headers,
                exchange.status_code,
                exchange.response_headers,
                exchange.response_content,
                exchange.response_content_type.as_str(),
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Get an archived exchange by ID.
    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<ArchivedExchange>> {
        let exchange = conn
            .query_row(
                "SELECT host, port, method, scheme, authority, path, path_hash, query,
                        request_content, request_content_type, http_version, request_headers,
                        status_code, response_headers, response_content, response_content_type
                 FROM responses WHERE id = ?1",
                [id],
                map_exchange,
            )
            .optional()?;

        Ok(exchange)
    }

    /// Count archived exchanges.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count = conn.query_row("SELECT COUNT(*) FROM responses", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn map_exchange(row: &Row<'_>) -> rusqlite::Result<ArchivedExchange> {
    Ok(ArchivedExchange {
        host: row.get(0)?,
        port: row.get(1)?,
        method: row.get(2)?,
        scheme: row.get(3)?,
        authority: row.get(4)?,
        path: row.get(5)?,
        path_hash: row.get(6)?,
        query: row.get(7)?,
        request_content: row.get(8)?,
        request_content_type: content_type_column(row, 9)?,
        http_version: row.get(10)?,
        request_headers: row.get(11)?,
        status_code: row.get(12)?,
        response_headers: row.get(13)?,
        response_content: row.get(14)?,
        response_content_type: content_type_column(row, 15)?,
    })
}

fn content_type_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<ContentType> {
    let raw: String = row.get(idx)?;
    ContentType::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown content type {raw:?}").into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ConnectionPool;
    use sluice_core::{FlowSnapshot, RequestSnapshot, ResponseSnapshot};

    fn exchange() -> ArchivedExchange {
        ArchivedExchange::from_flow(&FlowSnapshot {
            request: RequestSnapshot {
                host: "api.example.com".to_string(),
                port: 443,
                method: "GET".to_string(),
                scheme: "https".to_string(),
                authority: "api.example.com".to_string(),
                path: "/v1/feed?cursor=abc".to_string(),
                http_version: "HTTP/2.0".to_string(),
                headers: vec![("accept".to_string(), "*/*".to_string())],
                body: None,
            },
            response: ResponseSnapshot {
                status_code: 200,
                headers: vec![
                    ("set-cookie".to_string(), "a=1".to_string()),
                    ("set-cookie".to_string(), "b=2".to_string()),
                ],
                body: Some(b"<feed/>".to_vec()),
            },
        })
    }

    #[test]
    fn insert_and_get() {
        let pool = ConnectionPool::in_memory().unwrap();
        let conn = pool.get().unwrap();
        let original = exchange();

        let id = ResponsesRepo::insert(&conn, &original).unwrap();
        let stored = ResponsesRepo::get_by_id(&conn, id).unwrap().unwrap();

        assert_eq!(stored, original);
        assert_eq!(stored.response_content_type, ContentType::Xml);
        assert_eq!(stored.request_content_type, ContentType::Null);
        assert_eq!(ResponsesRepo::count(&conn).unwrap(), 1);
    }

    #[test]
    fn archive_is_append_only() {
        let pool = ConnectionPool::in_memory().unwrap();
        let conn = pool.get().unwrap();

        let first = ResponsesRepo::insert(&conn, &exchange()).unwrap();
        let second = ResponsesRepo::insert(&conn, &exchange()).unwrap();

        assert_ne!(first, second);
        assert_eq!(ResponsesRepo::count(&conn).unwrap(), 2);
    }

    #[test]
    fn unknown_id_is_none() {
        let pool = ConnectionPool::in_memory().unwrap();
        let conn = pool.get().unwrap();
        assert!(ResponsesRepo::get_by_id(&conn, 42).unwrap().is_none());
    }

    #[test]
    fn corrupt_content_type_is_an_error() {
        let pool = ConnectionPool::in_memory().unwrap();
        let conn = pool.get().unwrap();
        let id = ResponsesRepo::insert(&conn, &exchange()).unwrap();

        conn.execute(
            "UPDATE responses SET response_content_type = 'PDF' WHERE id = ?1",
            [id],
        )
        .unwrap();

        assert!(ResponsesRepo::get_by_id(&conn, id).is_err());
    }
}
