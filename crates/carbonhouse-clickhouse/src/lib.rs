use anyhow::{anyhow, Context, Result};
use carbonhouse_config::ClickHouseConfig;
use reqwest::{
    header::{CONTENT_LENGTH, CONTENT_TYPE},
    Body, Client, StatusCode, Url,
};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InsertError {
    #[error("invalid clickhouse url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid table name {0:?}")]
    InvalidTable(String),
    #[error("clickhouse request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("failed to read clickhouse response body (status {status}): {source}")]
    Body {
        status: StatusCode,
        #[source]
        source: reqwest::Error,
    },
    #[error("clickhouse response status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl InsertError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } | Self::Body { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Request body for a bulk insert.
///
/// The caller keeps ownership of whatever backs the payload until the call
/// returns; a file payload is streamed and announced with its length.
#[derive(Debug)]
pub enum InsertPayload {
    File { file: tokio::fs::File, len: u64 },
    Bytes(Vec<u8>),
}

impl InsertPayload {
    pub fn len(&self) -> u64 {
        match self {
            Self::File { len, .. } => *len,
            Self::Bytes(bytes) => bytes.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn into_body(self) -> (Body, u64) {
        match self {
            Self::File { file, len } => (Body::from(file), len),
            Self::Bytes(bytes) => {
                let len = bytes.len() as u64;
                (Body::from(bytes), len)
            }
        }
    }
}

#[derive(Clone)]
pub struct ClickHouseClient {
    cfg: ClickHouseConfig,
    http: Client,
}

impl ClickHouseClient {
    pub fn new(cfg: ClickHouseConfig) -> Result<Self> {
        // Timeouts are set per request; data and tree tables have their own.
        let http = Client::builder()
            .build()
            .context("failed to construct reqwest client")?;

        Ok(Self { cfg, http })
    }

    fn base_url(&self) -> Result<Url, InsertError> {
        Url::parse(&self.cfg.url).map_err(|exc| InsertError::InvalidUrl {
            url: self.cfg.url.clone(),
            reason: exc.to_string(),
        })
    }

    async fn post(
        &self,
        query: &str,
        payload: InsertPayload,
        timeout: Duration,
    ) -> Result<String, InsertError> {
        let mut url = self.base_url()?;
        url.query_pairs_mut().append_pair("query", query);

        let (body, body_len) = payload.into_body();

        let mut req = self
            .http
            .post(url)
            .timeout(timeout)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            // Some ClickHouse builds require an explicit Content-Length on POST.
            .header(CONTENT_LENGTH, body_len)
            .body(body);

        if !self.cfg.username.is_empty() {
            req = req.basic_auth(self.cfg.username.clone(), Some(self.cfg.password.clone()));
        }

        let response = req.send().await.map_err(InsertError::Transport)?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|source| InsertError::Body { status, source })?;

        if status != StatusCode::OK {
            return Err(InsertError::Status { status, body: text });
        }

        Ok(text)
    }

    /// Loads `payload` into `table` as `TabSeparated` rows in a single call.
    pub async fn insert_tab_separated(
        &self,
        table: &str,
        timeout: Duration,
        payload: InsertPayload,
    ) -> Result<(), InsertError> {
        let query = format!(
            "INSERT INTO {} FORMAT TabSeparated",
            qualified_table(table)?
        );
        self.post(&query, payload, timeout).await?;
        Ok(())
    }

    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        let response = self
            .post("SELECT 1", InsertPayload::Bytes(Vec::new()), timeout)
            .await?;
        if response.trim() == "1" {
            Ok(())
        } else {
            Err(anyhow!("unexpected ping response: {}", response.trim()))
        }
    }
}

fn validate_identifier(identifier: &str) -> bool {
    !identifier.is_empty()
        && identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn escape_identifier(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

/// Quotes `table` or `database.table` for use in a query.
pub fn qualified_table(table: &str) -> Result<String, InsertError> {
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() > 2 || !parts.iter().all(|part| validate_identifier(part)) {
        return Err(InsertError::InvalidTable(table.to_string()));
    }

    Ok(parts
        .iter()
        .map(|part| escape_identifier(part))
        .collect::<Vec<_>>()
        .join("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Bytes,
        extract::{Query, State},
        http::{HeaderMap, StatusCode},
        routing::post,
        Router,
    };
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct MockState {
        requests: Mutex<Vec<(String, Vec<u8>)>>,
    }

    fn test_clickhouse_config(url: String) -> ClickHouseConfig {
        ClickHouseConfig {
            url,
            username: String::new(),
            password: String::new(),
        }
    }

    async fn spawn_mock_server() -> (String, Arc<MockState>) {
        async fn handler(
            State(state): State<Arc<MockState>>,
            Query(params): Query<HashMap<String, String>>,
            headers: HeaderMap,
            body: Bytes,
        ) -> (StatusCode, String) {
            if headers.get("content-length").is_none() {
                return (
                    StatusCode::LENGTH_REQUIRED,
                    "missing content-length".to_string(),
                );
            }

            let query = params.get("query").cloned().unwrap_or_default();
            state
                .requests
                .lock()
                .expect("request lock")
                .push((query.clone(), body.to_vec()));

            if query.contains("broken") {
                return (StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string());
            }
            if query == "SELECT 1" {
                return (StatusCode::OK, "1\n".to_string());
            }

            (StatusCode::OK, String::new())
        }

        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/", post(handler))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");

        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        (format!("http://{}", addr), state)
    }

    fn spawn_truncated_body_server() -> String {
        use std::io::Read;
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind raw listener");
        let addr = listener.local_addr().expect("raw listener addr");

        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = [0_u8; 4096];
                let _ = stream.read(&mut request);

                let response = concat!(
                    "HTTP/1.1 200 OK\r\n",
                    "Content-Type: text/plain; charset=utf-8\r\n",
                    "Content-Length: 20\r\n",
                    "Connection: close\r\n",
                    "\r\n",
                    "short",
                );
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.flush();
            }
        });

        format!("http://{}", addr)
    }

    #[test]
    fn qualified_table_quotes_database_and_table() {
        assert_eq!(qualified_table("graphite").unwrap(), "`graphite`");
        assert_eq!(
            qualified_table("metrics.graphite_tree").unwrap(),
            "`metrics`.`graphite_tree`"
        );
    }

    #[test]
    fn qualified_table_rejects_invalid_names() {
        assert!(qualified_table("").is_err());
        assert!(qualified_table("a.b.c").is_err());
        assert!(qualified_table("graphite; DROP TABLE x").is_err());
        assert!(qualified_table("db.").is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn insert_sends_query_and_bytes_body() {
        let (base_url, state) = spawn_mock_server().await;
        let client = ClickHouseClient::new(test_clickhouse_config(base_url)).expect("new client");

        client
            .insert_tab_separated(
                "graphite_tree",
                Duration::from_secs(5),
                InsertPayload::Bytes(b"20240301\t1\ta.\n".to_vec()),
            )
            .await
            .expect("insert succeeds");

        let requests = state.requests.lock().expect("request lock");
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].0,
            "INSERT INTO `graphite_tree` FORMAT TabSeparated"
        );
        assert_eq!(requests[0].1, b"20240301\t1\ta.\n".to_vec());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn insert_streams_file_body() {
        let (base_url, state) = spawn_mock_server().await;
        let client = ClickHouseClient::new(test_clickhouse_config(base_url)).expect("new client");

        let mut source = tempfile::NamedTempFile::new().expect("temp file");
        source
            .write_all(b"a.b.c\t1\t1710460800\t2024031512000\n")
            .expect("write temp file");
        let file = tokio::fs::File::open(source.path())
            .await
            .expect("open temp file");
        let len = file.metadata().await.expect("metadata").len();

        client
            .insert_tab_separated(
                "graphite",
                Duration::from_secs(5),
                InsertPayload::File { file, len },
            )
            .await
            .expect("insert succeeds");

        let requests = state.requests.lock().expect("request lock");
        assert_eq!(
            requests[0].1,
            b"a.b.c\t1\t1710460800\t2024031512000\n".to_vec()
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn insert_includes_status_and_body_on_http_failure() {
        let (base_url, _state) = spawn_mock_server().await;
        let client = ClickHouseClient::new(test_clickhouse_config(base_url)).expect("new client");

        let err = client
            .insert_tab_separated(
                "broken",
                Duration::from_secs(5),
                InsertPayload::Bytes(b"x\n".to_vec()),
            )
            .await
            .expect_err("expected HTTP failure");

        assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        let msg = err.to_string();
        assert!(msg.contains("500"));
        assert!(msg.contains("boom"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn insert_rejects_invalid_table_without_request() {
        let (base_url, state) = spawn_mock_server().await;
        let client = ClickHouseClient::new(test_clickhouse_config(base_url)).expect("new client");

        let err = client
            .insert_tab_separated(
                "bad table",
                Duration::from_secs(5),
                InsertPayload::Bytes(Vec::new()),
            )
            .await
            .expect_err("invalid table");

        assert!(matches!(err, InsertError::InvalidTable(_)));
        assert!(state.requests.lock().expect("request lock").is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn insert_reports_transport_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let client = ClickHouseClient::new(test_clickhouse_config(format!("http://{}", addr)))
            .expect("new client");
        let err = client
            .insert_tab_separated(
                "graphite",
                Duration::from_secs(5),
                InsertPayload::Bytes(b"x\n".to_vec()),
            )
            .await
            .expect_err("connection refused");

        assert!(matches!(err, InsertError::Transport(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn insert_propagates_response_body_read_errors() {
        let base_url = spawn_truncated_body_server();
        let client = ClickHouseClient::new(test_clickhouse_config(base_url)).expect("new client");

        let err = client
            .insert_tab_separated(
                "graphite",
                Duration::from_secs(5),
                InsertPayload::Bytes(b"x\n".to_vec()),
            )
            .await
            .expect_err("expected response body read failure");

        assert!(err
            .to_string()
            .contains("failed to read clickhouse response body"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ping_accepts_one() {
        let (base_url, _state) = spawn_mock_server().await;
        let client = ClickHouseClient::new(test_clickhouse_config(base_url)).expect("new client");
        client.ping(Duration::from_secs(5)).await.expect("ping");
    }

    #[test]
    fn invalid_url_is_reported() {
        let client =
            ClickHouseClient::new(test_clickhouse_config("not a url".to_string())).expect("client");
        let err = client.base_url().expect_err("bad url");
        assert!(matches!(err, InsertError::InvalidUrl { .. }));
    }
}
