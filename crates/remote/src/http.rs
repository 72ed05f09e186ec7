//! Source replica reached over HTTP.
//!
//! Scalars are exchanged as JSON bodies. Enumeration answers with newline-delimited JSON,
//! one array of up to `chunkSize` records per line, and is read incrementally so that the
//! response is abandoned once enough records were consumed.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{
    cache::ClientFactory,
    error::{RemoteError, RemoteErrorKind},
    source::{MigrationRecord, SourceReplica},
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HttpSourceReplica {
    client: Client,
    base_url: Url,
}

impl HttpSourceReplica {
    pub fn new(client: Client, address: &str) -> Result<Self, RemoteError> {
        let mut base_url = Url::parse(address).map_err(|err| {
            RemoteError::new(
                RemoteErrorKind::EndpointNotFound,
                format!("invalid replica address {address:?}: {err}"),
            )
        })?;
        // Endpoint paths are joined relative to the last segment
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url, RemoteError> {
        self.base_url.join(path).map_err(|err| {
            RemoteError::new(
                RemoteErrorKind::EndpointNotFound,
                format!("invalid path {path:?} for {}: {err}", self.base_url),
            )
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let response = self
            .client
            .get(self.url(path)?)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(response)
            .await?
            .json::<T>()
            .await
            .map_err(map_reqwest_error)
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let response = self
            .client
            .post(self.url(path)?)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(response)
            .await?
            .json::<T>()
            .await
            .map_err(map_reqwest_error)
    }
}

#[async_trait::async_trait]
impl SourceReplica for HttpSourceReplica {
    async fn first_sequence_number(&self) -> Result<i64, RemoteError> {
        self.get_json("migration/sequence-numbers/first").await
    }

    async fn last_sequence_number(&self) -> Result<i64, RemoteError> {
        self.get_json("migration/sequence-numbers/last").await
    }

    async fn enumerate_by_sequence_number(
        &self,
        start: i64,
        chunk_size: usize,
        item_count: usize,
        include_deletes: bool,
    ) -> Result<Vec<MigrationRecord>, RemoteError> {
        let response = self
            .client
            .get(self.url("migration/records")?)
            .query(&[
                ("start", start.to_string()),
                ("chunkSize", chunk_size.to_string()),
                ("itemCount", item_count.to_string()),
                ("includeDeletes", include_deletes.to_string()),
            ])
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let mut response = check_status(response).await?;

        let mut reader = RecordLines::new(item_count);
        while !reader.is_full() {
            match response.chunk().await.map_err(map_reqwest_error)? {
                Some(bytes) => reader.push(&bytes)?,
                None => break,
            }
        }
        let records = reader.finish()?;
        debug!(
            start,
            requested = item_count,
            received = records.len(),
            "Enumerated source records"
        );
        Ok(records)
    }

    async fn reject_writes(&self) -> Result<bool, RemoteError> {
        self.post_json("migration/writes/reject").await
    }

    async fn resume_writes(&self) -> Result<bool, RemoteError> {
        self.post_json("migration/writes/resume").await
    }
}

/// Creates [`HttpSourceReplica`]s sharing one connection pool.
#[derive(Debug, Clone)]
pub struct HttpSourceReplicaFactory {
    client: Client,
}

impl HttpSourceReplicaFactory {
    pub fn new(request_timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| RemoteError::new(RemoteErrorKind::Unknown, err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl ClientFactory for HttpSourceReplicaFactory {
    type Client = HttpSourceReplica;

    async fn create_client(&self, address: &str) -> Result<HttpSourceReplica, RemoteError> {
        HttpSourceReplica::new(self.client.clone(), address)
    }
}

/// Accumulates an NDJSON body of record arrays until `limit` records were read.
struct RecordLines {
    limit: usize,
    pending: Vec<u8>,
    records: Vec<MigrationRecord>,
}

impl RecordLines {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            pending: Vec::new(),
            records: Vec::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.records.len() >= self.limit
    }

    fn push(&mut self, bytes: &[u8]) -> Result<(), RemoteError> {
        self.pending.extend_from_slice(bytes);
        while !self.is_full() {
            let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            self.parse_line(&line)?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<MigrationRecord>, RemoteError> {
        if !self.is_full() {
            let rest = std::mem::take(&mut self.pending);
            self.parse_line(&rest)?;
        }
        self.records.truncate(self.limit);
        Ok(self.records)
    }

    fn parse_line(&mut self, line: &[u8]) -> Result<(), RemoteError> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return Ok(());
        }
        let chunk: Vec<MigrationRecord> = serde_json::from_slice(line).map_err(|err| {
            RemoteError::new(
                RemoteErrorKind::InvalidResponse,
                format!("malformed record chunk: {err}"),
            )
        })?;
        let room = self.limit - self.records.len();
        self.records.extend(chunk.into_iter().take(room));
        Ok(())
    }
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::new(
        status_kind(status),
        format!("replica answered {status}: {body}"),
    ))
}

pub fn status_kind(status: StatusCode) -> RemoteErrorKind {
    match status {
        StatusCode::NOT_FOUND => RemoteErrorKind::EndpointNotFound,
        StatusCode::CONFLICT | StatusCode::MISDIRECTED_REQUEST => RemoteErrorKind::NotPrimary,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            RemoteErrorKind::ServiceBusy
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => RemoteErrorKind::Timeout,
        status if status.is_server_error() => RemoteErrorKind::Server,
        _ => RemoteErrorKind::Unknown,
    }
}

fn map_reqwest_error(err: reqwest::Error) -> RemoteError {
    let kind = if err.is_timeout() {
        RemoteErrorKind::Timeout
    } else if err.is_connect() {
        RemoteErrorKind::ConnectionRefused
    } else if err.is_decode() {
        RemoteErrorKind::InvalidResponse
    } else if let Some(status) = err.status() {
        status_kind(status)
    } else {
        RemoteErrorKind::Transport
    };
    RemoteError::new(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    /// Serves a single canned HTTP response and returns the base address.
    async fn serve_once(status: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}/", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 4096];
            let _ = socket.read(&mut request).await.unwrap();
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        address
    }

    fn replica(address: &str) -> HttpSourceReplica {
        HttpSourceReplica::new(Client::new(), address).unwrap()
    }

    fn record(sequence_number: i64) -> String {
        format!(r#"{{"sequenceNumber":{sequence_number},"key":"@@k{sequence_number}","value":"v"}}"#)
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        assert_eq!(status_kind(StatusCode::NOT_FOUND), RemoteErrorKind::EndpointNotFound);
        assert_eq!(status_kind(StatusCode::CONFLICT), RemoteErrorKind::NotPrimary);
        assert_eq!(
            status_kind(StatusCode::MISDIRECTED_REQUEST),
            RemoteErrorKind::NotPrimary
        );
        assert_eq!(
            status_kind(StatusCode::SERVICE_UNAVAILABLE),
            RemoteErrorKind::ServiceBusy
        );
        assert_eq!(
            status_kind(StatusCode::TOO_MANY_REQUESTS),
            RemoteErrorKind::ServiceBusy
        );
        assert_eq!(status_kind(StatusCode::GATEWAY_TIMEOUT), RemoteErrorKind::Timeout);
        assert_eq!(
            status_kind(StatusCode::INTERNAL_SERVER_ERROR),
            RemoteErrorKind::Server
        );
        assert_eq!(status_kind(StatusCode::BAD_REQUEST), RemoteErrorKind::Unknown);
    }

    #[test]
    fn record_lines_stop_at_limit_across_split_chunks() {
        let body = format!("[{},{}]\n[{},{}]\n", record(1), record(2), record(3), record(4));
        let (head, tail) = body.as_bytes().split_at(17);

        let mut reader = RecordLines::new(3);
        reader.push(head).unwrap();
        reader.push(tail).unwrap();
        assert!(reader.is_full());
        let records = reader.finish().unwrap();
        let sequence_numbers: Vec<i64> = records.iter().map(|r| r.sequence_number).collect();
        assert_eq!(sequence_numbers, vec![1, 2, 3]);
    }

    #[test]
    fn record_lines_accept_unterminated_last_line_and_deletes() {
        let body = r#"[{"sequenceNumber":7,"key":"@@gone","isDeleted":true}]"#;
        let mut reader = RecordLines::new(10);
        reader.push(body.as_bytes()).unwrap();
        let records = reader.finish().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_deleted);
        assert_eq!(records[0].value, None);
    }

    #[test]
    fn malformed_chunk_is_invalid_response() {
        let mut reader = RecordLines::new(10);
        let err = reader.push(b"{not json}\n").unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::InvalidResponse);
    }

    #[tokio::test]
    async fn enumerates_ndjson_body() {
        let body = format!("[{},{}]\n[{}]\n", record(10), record(11), record(12));
        let address = serve_once("200 OK", body).await;

        let records = replica(&address)
            .enumerate_by_sequence_number(10, 2, 100, false)
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].key, "@@k12");
    }

    #[tokio::test]
    async fn reads_last_sequence_number() {
        let address = serve_once("200 OK", "4711".to_owned()).await;
        assert_eq!(replica(&address).last_sequence_number().await.unwrap(), 4711);
    }

    #[tokio::test]
    async fn reject_writes_reports_readiness() {
        let address = serve_once("200 OK", "true".to_owned()).await;
        assert!(replica(&address).reject_writes().await.unwrap());
    }

    #[tokio::test]
    async fn busy_replica_maps_to_service_busy() {
        let address = serve_once("503 Service Unavailable", "busy".to_owned()).await;
        let err = replica(&address).reject_writes().await.unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::ServiceBusy);
    }

    #[tokio::test]
    async fn closed_port_is_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);
        let err = replica(&address).first_sequence_number().await.unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::ConnectionRefused);
    }

    #[test]
    fn invalid_address_is_endpoint_not_found() {
        let err = HttpSourceReplica::new(Client::new(), "not a url").unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::EndpointNotFound);
    }

    #[test]
    fn base_path_is_kept_without_trailing_slash() {
        let replica = HttpSourceReplica::new(Client::new(), "http://source:8080/api").unwrap();
        assert_eq!(
            replica.url("migration/sequence-numbers/last").unwrap().as_str(),
            "http://source:8080/api/migration/sequence-numbers/last"
        );

        let replica = HttpSourceReplica::new(Client::new(), "http://source:8080/api/").unwrap();
        assert_eq!(
            replica.url("migration/writes/reject").unwrap().as_str(),
            "http://source:8080/api/migration/writes/reject"
        );
    }
}
