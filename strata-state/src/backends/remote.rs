//! HTTP state service backend
//!
//! Talks to a state service over a small REST surface rooted at the
//! configured address:
//!
//! | Method | Path | Meaning |
//! |--------|------|---------|
//! | GET | `/workspaces` | names holding state |
//! | GET/PUT/DELETE | `/workspaces/{ws}/state` | document; PUT carries `If-Match: <version>` |
//! | GET/POST/DELETE | `/workspaces/{ws}/lock` | lock; DELETE takes `?id=` and `&force=true` |
//! | GET | `/workspaces/{ws}/backups` | backup metadata |
//! | GET/PUT/DELETE | `/workspaces/{ws}/backups/{id}` | one backup |
//! | GET/PUT | `/workspaces/{ws}/migration` | migration marker |
//!
//! The service is responsible for keeping a backup before it replaces
//! a document. `412` answers a failed version check, `409` or `423` a
//! held lock. The bearer token is read from the environment variable
//! named by the `token_env` parameter, never from the configuration.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, IF_MATCH};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{BackendConfig, BackendError, BackendKind, BackendResult, StateBackend};
use crate::backup::{BackupInfo, MigrationMarker};
use crate::lock::LockInfo;
use crate::state::StateDocument;

/// Environment variable consulted for the bearer token when `token_env` is unset
pub const DEFAULT_TOKEN_ENV: &str = "STRATA_REMOTE_TOKEN";

/// Body returned by a successful state write
#[derive(Debug, Serialize, Deserialize)]
struct WriteAck {
    version: u64,
}

/// Body returned with a failed version check
#[derive(Debug, Default, Deserialize)]
struct ConflictBody {
    #[serde(default)]
    version: Option<u64>,
    #[serde(default)]
    lineage: Option<String>,
}

/// Remote state service backend
pub struct RemoteBackend {
    client: Client,
    /// Base URL without a trailing slash
    address: String,
}

impl RemoteBackend {
    /// Create a RemoteBackend from configuration
    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let address = config.require("address")?.trim_end_matches('/').to_string();
        if !address.starts_with("http://") && !address.starts_with("https://") {
            return Err(BackendError::configuration(format!(
                "remote address must be an http(s) URL, got '{}'",
                address
            )));
        }

        let token_env = config.get_string("token_env").unwrap_or(DEFAULT_TOKEN_ENV);
        let token = std::env::var(token_env).ok().filter(|t| !t.is_empty());

        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                BackendError::configuration(format!("token in ${} is not a valid header value", token_env))
            })?;
            headers.insert(AUTHORIZATION, value);
        } else {
            debug!(token_env, "no token found, calling remote state service unauthenticated");
        }

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| BackendError::configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, address })
    }

    fn url(&self, workspace: &str, resource: &str) -> String {
        if resource.is_empty() {
            format!("{}/workspaces/{}", self.address, workspace)
        } else {
            format!("{}/workspaces/{}/{}", self.address, workspace, resource)
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> BackendResult<Response> {
        request
            .send()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))
    }

    /// GET a JSON body, mapping 404 to `None`
    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> BackendResult<Option<T>> {
        let response = self.send(self.client.get(url)).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json()
                .await
                .map(Some)
                .map_err(|e| BackendError::Serialization(format!("{}: {}", url, e))),
            _ => Err(unexpected(url, response).await),
        }
    }

    async fn get_document(&self, url: &str) -> BackendResult<Option<StateDocument>> {
        let response = self.send(self.client.get(url)).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| BackendError::Http(e.to_string()))?;
                StateDocument::load(&bytes).map(Some)
            }
            _ => Err(unexpected(url, response).await),
        }
    }

    async fn put_json(&self, url: &str, body: Vec<u8>) -> BackendResult<()> {
        let request = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        let response = self.send(request).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(unexpected(url, response).await)
        }
    }

    async fn delete_lock(&self, workspace: &str, lock_id: &str, force: bool) -> BackendResult<()> {
        let url = self.url(workspace, "lock");
        let mut query = vec![("id", lock_id.to_string())];
        if force {
            query.push(("force", "true".to_string()));
        }

        let response = self.send(self.client.delete(&url).query(&query)).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(BackendError::LockNotFound(lock_id.to_string())),
            StatusCode::CONFLICT => {
                let actual = response
                    .json::<LockInfo>()
                    .await
                    .map(|held| held.id)
                    .unwrap_or_else(|_| "unknown".to_string());
                Err(BackendError::LockMismatch {
                    expected: lock_id.to_string(),
                    actual,
                })
            }
            _ => Err(unexpected(&url, response).await),
        }
    }
}

#[async_trait]
impl StateBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::RemoteService
    }

    fn location(&self) -> String {
        self.address.clone()
    }

    async fn read_state(&self, workspace: &str) -> BackendResult<Option<StateDocument>> {
        self.get_document(&self.url(workspace, "state")).await
    }

    async fn write_state(
        &self,
        workspace: &str,
        state: &StateDocument,
        expected_version: u64,
    ) -> BackendResult<u64> {
        let url = self.url(workspace, "state");
        let mut next = state.clone();
        next.version = expected_version + 1;

        let request = self
            .client
            .put(&url)
            .header(IF_MATCH, expected_version.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(next.serialize()?);
        let response = self.send(request).await?;

        match response.status() {
            status if status.is_success() => {
                let ack: WriteAck = response
                    .json()
                    .await
                    .unwrap_or(WriteAck { version: next.version });
                Ok(ack.version)
            }
            StatusCode::PRECONDITION_FAILED => {
                let body: ConflictBody = response.json().await.unwrap_or_default();
                Err(BackendError::VersionConflict {
                    workspace: workspace.to_string(),
                    expected: expected_version,
                    actual: body.version.unwrap_or(0),
                })
            }
            StatusCode::CONFLICT => {
                let body: ConflictBody = response.json().await.unwrap_or_default();
                Err(BackendError::LineageMismatch {
                    expected: body.lineage.unwrap_or_else(|| "unknown".to_string()),
                    actual: state.lineage.clone(),
                })
            }
            _ => Err(unexpected(&url, response).await),
        }
    }

    async fn delete_state(&self, workspace: &str) -> BackendResult<()> {
        let url = self.url(workspace, "state");
        let response = self.send(self.client.delete(&url)).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(BackendError::not_found(format!(
                "state for workspace '{}'",
                workspace
            ))),
            _ => Err(unexpected(&url, response).await),
        }
    }

    async fn list_workspaces(&self) -> BackendResult<Vec<String>> {
        let url = format!("{}/workspaces", self.address);
        let mut names: Vec<String> = self.get_json(&url).await?.unwrap_or_default();
        names.sort();
        Ok(names)
    }

    async fn try_lock(&self, lock: &LockInfo) -> BackendResult<()> {
        let url = self.url(&lock.workspace, "lock");
        let response = self.send(self.client.post(&url).json(lock)).await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT | StatusCode::LOCKED => match response.json::<LockInfo>().await {
                Ok(held) => Err(BackendError::locked(&held)),
                Err(_) => Err(BackendError::LockConflict {
                    workspace: lock.workspace.clone(),
                    lock_id: "unknown".to_string(),
                    who: "unknown".to_string(),
                    operation: "unknown".to_string(),
                }),
            },
            _ => Err(unexpected(&url, response).await),
        }
    }

    async fn release_lock(&self, lock: &LockInfo) -> BackendResult<()> {
        self.delete_lock(&lock.workspace, &lock.id, false).await
    }

    async fn force_unlock(&self, workspace: &str, lock_id: &str) -> BackendResult<()> {
        self.delete_lock(workspace, lock_id, true).await
    }

    async fn current_lock(&self, workspace: &str) -> BackendResult<Option<LockInfo>> {
        self.get_json(&self.url(workspace, "lock")).await
    }

    async fn list_backups(&self, workspace: &str) -> BackendResult<Vec<BackupInfo>> {
        Ok(self
            .get_json(&self.url(workspace, "backups"))
            .await?
            .unwrap_or_default())
    }

    async fn read_backup(&self, workspace: &str, backup_id: &str) -> BackendResult<StateDocument> {
        let url = self.url(workspace, &format!("backups/{}", backup_id));
        self.get_document(&url).await?.ok_or_else(|| {
            BackendError::not_found(format!("backup '{}' of workspace '{}'", backup_id, workspace))
        })
    }

    async fn put_backup(
        &self,
        workspace: &str,
        backup: &BackupInfo,
        state: &StateDocument,
    ) -> BackendResult<()> {
        let url = self.url(workspace, &format!("backups/{}", backup.id));
        self.put_json(&url, state.serialize()?).await
    }

    async fn delete_backup(&self, workspace: &str, backup_id: &str) -> BackendResult<()> {
        let url = self.url(workspace, &format!("backups/{}", backup_id));
        let response = self.send(self.client.delete(&url)).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(BackendError::not_found(format!(
                "backup '{}' of workspace '{}'",
                backup_id, workspace
            ))),
            _ => Err(unexpected(&url, response).await),
        }
    }

    async fn mark_migrated(&self, workspace: &str, marker: &MigrationMarker) -> BackendResult<()> {
        let body = serde_json::to_vec(marker).map_err(|e| BackendError::Serialization(e.to_string()))?;
        self.put_json(&self.url(workspace, "migration"), body).await
    }

    async fn migration_marker(&self, workspace: &str) -> BackendResult<Option<MigrationMarker>> {
        self.get_json(&self.url(workspace, "migration")).await
    }

    async fn init(&self) -> BackendResult<()> {
        // Reachability and credentials check
        self.list_workspaces().await.map(|_| ())
    }
}

/// Turn an unexpected response into an error carrying status and body
async fn unexpected(url: &str, response: Response) -> BackendError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::configuration(format!(
            "remote state service rejected credentials ({}) for {}",
            status, url
        )),
        _ => BackendError::Http(format!("{} returned {}: {}", url, status, body.trim())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// A request as the stub service received it
    #[derive(Debug, Clone)]
    struct Seen {
        method: String,
        target: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    impl Seen {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        }
    }

    /// Serve canned responses on a loopback port; returns the base URL and the requests seen
    async fn stub_service(
        respond: impl Fn(&Seen) -> (u16, String) + Send + Sync + 'static,
    ) -> (String, Arc<Mutex<Vec<Seen>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let request = read_request(&mut socket).await;
                let (status, body) = respond(&request);
                log.lock().unwrap().push(request);
                let response = format!(
                    "HTTP/1.1 {} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (address, seen)
    }

    async fn read_request(socket: &mut TcpStream) -> Seen {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_end = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before the request head");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let mut lines = head.split("\r\n");
        let mut start = lines.next().unwrap().split(' ');
        let method = start.next().unwrap().to_string();
        let target = start.next().unwrap().to_string();
        let headers: Vec<(String, String)> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();

        let length: usize = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map_or(0, |(_, v)| v.parse().unwrap());
        let mut body = buf[head_end..].to_vec();
        while body.len() < length {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }

        Seen {
            method,
            target,
            headers,
            body,
        }
    }

    fn backend_at(address: &str) -> RemoteBackend {
        let config = BackendConfig::remote(address).with_param("token_env", "STRATA_TEST_TOKEN_UNSET");
        RemoteBackend::from_config(&config).unwrap()
    }

    fn holder() -> LockInfo {
        LockInfo::new("prod", "apply")
    }

    #[tokio::test]
    async fn test_write_sends_expected_version() {
        let (address, seen) = stub_service(|_| (200, r#"{"version":8}"#.to_string())).await;
        let backend = backend_at(&address);

        let doc = StateDocument::with_lineage("lineage-a");
        let version = backend.write_state("prod", &doc, 7).await.unwrap();
        assert_eq!(version, 8);

        let request = seen.lock().unwrap()[0].clone();
        assert_eq!(request.method, "PUT");
        assert_eq!(request.target, "/workspaces/prod/state");
        assert_eq!(request.header("if-match"), Some("7"));
        let sent = StateDocument::load(&request.body).unwrap();
        assert_eq!(sent.version, 8);
        assert_eq!(sent.lineage, "lineage-a");
    }

    #[tokio::test]
    async fn test_write_conflicts() {
        let (address, _) = stub_service(|request| match request.header("if-match") {
            Some("7") => (412, r#"{"version":9}"#.to_string()),
            _ => (409, r#"{"lineage":"lineage-b"}"#.to_string()),
        })
        .await;
        let backend = backend_at(&address);
        let doc = StateDocument::with_lineage("lineage-a");

        assert!(matches!(
            backend.write_state("prod", &doc, 7).await,
            Err(BackendError::VersionConflict { expected: 7, actual: 9, .. })
        ));
        match backend.write_state("prod", &doc, 1).await {
            Err(BackendError::LineageMismatch { expected, actual }) => {
                assert_eq!(expected, "lineage-b");
                assert_eq!(actual, "lineage-a");
            }
            other => panic!("expected lineage mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_held_lock_is_lock_conflict() {
        let held = holder();
        let body = serde_json::to_string(&held).unwrap();
        let (address, seen) = stub_service(move |_| (423, body.clone())).await;
        let backend = backend_at(&address);

        match backend.try_lock(&LockInfo::new("prod", "push")).await {
            Err(BackendError::LockConflict { lock_id, who, .. }) => {
                assert_eq!(lock_id, held.id);
                assert_eq!(who, held.who);
            }
            other => panic!("expected lock conflict, got {:?}", other),
        }

        let request = seen.lock().unwrap()[0].clone();
        assert_eq!(request.method, "POST");
        assert_eq!(request.target, "/workspaces/prod/lock");
        let sent: LockInfo = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(sent.operation, "push");
    }

    #[tokio::test]
    async fn test_lock_conflict_without_holder_body() {
        let (address, _) = stub_service(|_| (409, String::new())).await;
        let backend = backend_at(&address);

        let err = backend.try_lock(&LockInfo::new("prod", "push")).await.unwrap_err();
        assert!(err.is_lock_conflict());
    }

    #[tokio::test]
    async fn test_force_unlock_and_release() {
        let held = holder();
        let body = serde_json::to_string(&held).unwrap();
        let (address, seen) = stub_service(move |request| {
            if request.target.contains("force=true") {
                (204, String::new())
            } else if request.target.contains("id=gone") {
                (404, String::new())
            } else {
                (409, body.clone())
            }
        })
        .await;
        let backend = backend_at(&address);

        backend.force_unlock("prod", &held.id).await.unwrap();
        let request = seen.lock().unwrap()[0].clone();
        assert_eq!(request.method, "DELETE");
        assert!(request.target.starts_with("/workspaces/prod/lock?"));
        assert!(request.target.contains(&format!("id={}", held.id)));

        match backend.release_lock(&LockInfo::new("prod", "push")).await {
            Err(BackendError::LockMismatch { actual, .. }) => assert_eq!(actual, held.id),
            other => panic!("expected lock mismatch, got {:?}", other),
        }
        assert!(matches!(
            backend.force_unlock("prod", "gone").await,
            Err(BackendError::LockNotFound(id)) if id == "gone"
        ));
    }

    #[tokio::test]
    async fn test_missing_documents_and_rejected_credentials() {
        let (address, _) = stub_service(|request| match request.target.as_str() {
            "/workspaces" => (401, "token expired".to_string()),
            _ => (404, String::new()),
        })
        .await;
        let backend = backend_at(&address);

        assert!(backend.read_state("prod").await.unwrap().is_none());
        assert!(backend.current_lock("prod").await.unwrap().is_none());
        assert!(matches!(
            backend.read_backup("prod", "20261018T000000000Z-v2").await,
            Err(BackendError::NotFound(_))
        ));
        assert!(matches!(
            backend.list_workspaces().await,
            Err(BackendError::Configuration(_))
        ));
        assert!(matches!(backend.init().await, Err(BackendError::Configuration(_))));
    }

    #[test]
    fn test_from_config_requires_http_address() {
        let config = BackendConfig::remote("ftp://state.example.com");
        assert!(matches!(
            RemoteBackend::from_config(&config),
            Err(BackendError::Configuration(_))
        ));

        let config = BackendConfig::new(BackendKind::RemoteService);
        assert!(RemoteBackend::from_config(&config).is_err());
    }

    #[test]
    fn test_urls() {
        let config = BackendConfig::remote("https://state.example.com/api/")
            .with_param("token_env", "STRATA_TEST_TOKEN_UNSET");
        let backend = RemoteBackend::from_config(&config).unwrap();
        assert_eq!(backend.location(), "https://state.example.com/api");
        assert_eq!(
            backend.url("prod", "state"),
            "https://state.example.com/api/workspaces/prod/state"
        );
        assert_eq!(
            backend.url("prod", "backups/20261018T000000000Z-v2"),
            "https://state.example.com/api/workspaces/prod/backups/20261018T000000000Z-v2"
        );
    }

    #[tokio::test]
    async fn test_unreachable_service_is_http_error() {
        // Port 9 (discard) is not expected to serve HTTP
        let config = BackendConfig::remote("http://127.0.0.1:9")
            .with_param("token_env", "STRATA_TEST_TOKEN_UNSET");
        let backend = RemoteBackend::from_config(&config).unwrap();
        assert!(matches!(
            backend.read_state("default").await,
            Err(BackendError::Http(_))
        ));
    }
}
