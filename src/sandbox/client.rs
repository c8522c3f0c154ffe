//! Remote sandbox service client.
//!
//! The hosted execution service is consumed strictly through the
//! `SandboxService` trait; `E2bClient` is the one production
//! implementation, speaking the service's REST API. Control-plane calls
//! (create/list/connect/timeout/kill) go to the central API host;
//! data-plane calls (run code, files) go to the per-sandbox envd
//! endpoint exposed on a well-known port.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::errors::SandboxError;

/// Metadata key tagging a sandbox with its owning session.
pub const SESSION_METADATA_KEY: &str = "sessionID";

/// Port the in-sandbox daemon listens on.
const ENVD_PORT: u16 = 49999;

/// A connection to one remote sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub sandbox_id: String,
    pub template: String,
    pub metadata: HashMap<String, String>,
}

/// One entry of the live-sandbox listing.
#[derive(Debug, Clone)]
pub struct SandboxInfo {
    pub sandbox_id: String,
    pub template: String,
    pub metadata: HashMap<String, String>,
}

/// Structured artifacts of one code execution, returned verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Execution {
    pub results: Vec<serde_json::Value>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub error: Option<ExecutionError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionError {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

/// One node of a sandbox file listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub name: String,
    pub is_directory: bool,
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FileNode>,
}

/// Public interface of the hosted sandbox execution service.
#[async_trait]
pub trait SandboxService: Send + Sync {
    async fn create(
        &self,
        template: &str,
        metadata: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<SandboxHandle, SandboxError>;

    /// Reconnect to an existing sandbox by its remote identifier.
    async fn connect(&self, sandbox_id: &str) -> Result<SandboxHandle, SandboxError>;

    /// List currently-live sandboxes.
    async fn list(&self) -> Result<Vec<SandboxInfo>, SandboxError>;

    /// Extend the sandbox's expiry.
    async fn set_timeout(&self, sandbox_id: &str, timeout: Duration) -> Result<(), SandboxError>;

    async fn run_code(&self, sandbox_id: &str, code: &str) -> Result<Execution, SandboxError>;

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError>;

    async fn list_files(
        &self,
        sandbox_id: &str,
        path: &str,
    ) -> Result<Vec<FileNode>, SandboxError>;

    async fn kill(&self, sandbox_id: &str) -> Result<(), SandboxError>;

    /// Public hostname serving the given port of a sandbox.
    fn preview_host(&self, sandbox_id: &str, port: u16) -> String;
}

// ── Wire types ────────────────────────────────────────────────────────

#[derive(Serialize)]
struct CreateSandboxRequest<'a> {
    #[serde(rename = "templateID")]
    template_id: &'a str,
    metadata: &'a HashMap<String, String>,
    /// Seconds until the service expires the sandbox.
    timeout: u64,
}

#[derive(Deserialize)]
struct SandboxResponse {
    #[serde(rename = "sandboxID", alias = "sandboxId")]
    sandbox_id: String,
    #[serde(rename = "templateID", alias = "templateId", default)]
    template_id: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Serialize)]
struct SetTimeoutRequest {
    timeout: u64,
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    code: &'a str,
}

#[derive(Deserialize, Default)]
struct ExecuteLogs {
    #[serde(default)]
    stdout: Vec<String>,
    #[serde(default)]
    stderr: Vec<String>,
}

#[derive(Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    results: Vec<serde_json::Value>,
    #[serde(default)]
    logs: ExecuteLogs,
    #[serde(default)]
    error: Option<ExecutionError>,
}

#[derive(Deserialize)]
struct EntryInfo {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    path: String,
}

// ── Production client ─────────────────────────────────────────────────

pub struct E2bClient {
    http: reqwest::Client,
    api_key: Option<String>,
    api_url: String,
    domain: String,
}

impl E2bClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: config.e2b_api_key.clone(),
            api_url: config.e2b_api_url.trim_end_matches('/').to_string(),
            domain: config.e2b_domain.clone(),
        }
    }

    /// The credential is only demanded at first use, never at startup.
    fn api_key(&self) -> Result<&str, SandboxError> {
        self.api_key.as_deref().ok_or(SandboxError::MissingApiKey)
    }

    fn envd_url(&self, sandbox_id: &str, path: &str) -> String {
        format!(
            "https://{}-{}.{}{}",
            ENVD_PORT, sandbox_id, self.domain, path
        )
    }

    async fn ensure_success(
        resp: reqwest::Response,
        sandbox_id: Option<&str>,
    ) -> Result<reqwest::Response, SandboxError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            if let Some(id) = sandbox_id {
                return Err(SandboxError::NotFound { id: id.to_string() });
            }
        }
        let message = resp.text().await.unwrap_or_default();
        Err(SandboxError::Service {
            status: status.as_u16(),
            message,
        })
    }

    fn handle_from(resp: SandboxResponse) -> SandboxHandle {
        SandboxHandle {
            sandbox_id: resp.sandbox_id,
            template: resp.template_id,
            metadata: resp.metadata,
        }
    }
}

#[async_trait]
impl SandboxService for E2bClient {
    async fn create(
        &self,
        template: &str,
        metadata: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<SandboxHandle, SandboxError> {
        let key = self.api_key()?;
        let body = CreateSandboxRequest {
            template_id: template,
            metadata: &metadata,
            timeout: timeout.as_secs(),
        };
        let resp = self
            .http
            .post(format!("{}/sandboxes", self.api_url))
            .header("X-API-KEY", key)
            .json(&body)
            .send()
            .await?;
        let resp = Self::ensure_success(resp, None).await?;
        let parsed: SandboxResponse = resp
            .json()
            .await
            .map_err(|e| SandboxError::Decode(e.to_string()))?;
        let mut handle = Self::handle_from(parsed);
        if handle.metadata.is_empty() {
            handle.metadata = metadata;
        }
        Ok(handle)
    }

    async fn connect(&self, sandbox_id: &str) -> Result<SandboxHandle, SandboxError> {
        let key = self.api_key()?;
        let resp = self
            .http
            .get(format!("{}/sandboxes/{}", self.api_url, sandbox_id))
            .header("X-API-KEY", key)
            .send()
            .await?;
        let resp = Self::ensure_success(resp, Some(sandbox_id)).await?;
        let parsed: SandboxResponse = resp
            .json()
            .await
            .map_err(|e| SandboxError::Decode(e.to_string()))?;
        Ok(Self::handle_from(parsed))
    }

    async fn list(&self) -> Result<Vec<SandboxInfo>, SandboxError> {
        let key = self.api_key()?;
        let resp = self
            .http
            .get(format!("{}/sandboxes", self.api_url))
            .header("X-API-KEY", key)
            .send()
            .await?;
        let resp = Self::ensure_success(resp, None).await?;
        let parsed: Vec<SandboxResponse> = resp
            .json()
            .await
            .map_err(|e| SandboxError::Decode(e.to_string()))?;
        Ok(parsed
            .into_iter()
            .map(|s| SandboxInfo {
                sandbox_id: s.sandbox_id,
                template: s.template_id,
                metadata: s.metadata,
            })
            .collect())
    }

    async fn set_timeout(&self, sandbox_id: &str, timeout: Duration) -> Result<(), SandboxError> {
        let key = self.api_key()?;
        let resp = self
            .http
            .post(format!("{}/sandboxes/{}/timeout", self.api_url, sandbox_id))
            .header("X-API-KEY", key)
            .json(&SetTimeoutRequest {
                timeout: timeout.as_secs(),
            })
            .send()
            .await?;
        Self::ensure_success(resp, Some(sandbox_id)).await?;
        Ok(())
    }

    async fn run_code(&self, sandbox_id: &str, code: &str) -> Result<Execution, SandboxError> {
        let resp = self
            .http
            .post(self.envd_url(sandbox_id, "/execute"))
            .json(&ExecuteRequest { code })
            .send()
            .await?;
        let resp = Self::ensure_success(resp, Some(sandbox_id)).await?;
        let parsed: ExecuteResponse = resp
            .json()
            .await
            .map_err(|e| SandboxError::Decode(e.to_string()))?;
        Ok(Execution {
            results: parsed.results,
            stdout: parsed.logs.stdout,
            stderr: parsed.logs.stderr,
            error: parsed.error,
        })
    }

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        let resp = self
            .http
            .post(self.envd_url(sandbox_id, "/files"))
            .query(&[("path", path), ("username", "user")])
            .body(content.to_string())
            .send()
            .await?;
        Self::ensure_success(resp, Some(sandbox_id)).await?;
        Ok(())
    }

    async fn list_files(
        &self,
        sandbox_id: &str,
        path: &str,
    ) -> Result<Vec<FileNode>, SandboxError> {
        let resp = self
            .http
            .get(self.envd_url(sandbox_id, "/files"))
            .query(&[("path", path), ("username", "user")])
            .send()
            .await?;
        let resp = Self::ensure_success(resp, Some(sandbox_id)).await?;
        let parsed: Vec<EntryInfo> = resp
            .json()
            .await
            .map_err(|e| SandboxError::Decode(e.to_string()))?;
        Ok(parsed
            .into_iter()
            .map(|entry| FileNode {
                name: entry.name,
                is_directory: entry.kind == "dir",
                path: entry.path,
                children: Vec::new(),
            })
            .collect())
    }

    async fn kill(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let key = self.api_key()?;
        let resp = self
            .http
            .delete(format!("{}/sandboxes/{}", self.api_url, sandbox_id))
            .header("X-API-KEY", key)
            .send()
            .await?;
        Self::ensure_success(resp, Some(sandbox_id)).await?;
        Ok(())
    }

    fn preview_host(&self, sandbox_id: &str, port: u16) -> String {
        format!("{}-{}.{}", port, sandbox_id, self.domain)
    }
}

// ── Test double ───────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory stand-in for the hosted service, recording every call.
    #[derive(Default)]
    pub struct MockSandboxService {
        pub live: Mutex<Vec<SandboxInfo>>,
        pub files: Mutex<Vec<FileNode>>,
        pub execution: Mutex<Execution>,
        pub create_calls: AtomicUsize,
        pub list_calls: AtomicUsize,
        pub connect_calls: AtomicUsize,
        pub timeout_calls: AtomicUsize,
        pub executed: Mutex<Vec<(String, String)>>,
        pub written: Mutex<Vec<(String, String, String)>>,
        pub killed: Mutex<Vec<String>>,
        pub missing_key: AtomicBool,
        pub create_delay: Option<Duration>,
        pub next_id: AtomicUsize,
    }

    impl MockSandboxService {
        fn check_key(&self) -> Result<(), SandboxError> {
            if self.missing_key.load(Ordering::SeqCst) {
                Err(SandboxError::MissingApiKey)
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SandboxService for MockSandboxService {
        async fn create(
            &self,
            template: &str,
            metadata: HashMap<String, String>,
            _timeout: Duration,
        ) -> Result<SandboxHandle, SandboxError> {
            self.check_key()?;
            if let Some(delay) = self.create_delay {
                tokio::time::sleep(delay).await;
            }
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            let info = SandboxInfo {
                sandbox_id: format!("sbx-{}", n),
                template: template.to_string(),
                metadata: metadata.clone(),
            };
            self.live.lock().unwrap().push(info.clone());
            Ok(SandboxHandle {
                sandbox_id: info.sandbox_id,
                template: info.template,
                metadata,
            })
        }

        async fn connect(&self, sandbox_id: &str) -> Result<SandboxHandle, SandboxError> {
            self.check_key()?;
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            let live = self.live.lock().unwrap();
            live.iter()
                .find(|info| info.sandbox_id == sandbox_id)
                .map(|info| SandboxHandle {
                    sandbox_id: info.sandbox_id.clone(),
                    template: info.template.clone(),
                    metadata: info.metadata.clone(),
                })
                .ok_or_else(|| SandboxError::NotFound {
                    id: sandbox_id.to_string(),
                })
        }

        async fn list(&self) -> Result<Vec<SandboxInfo>, SandboxError> {
            self.check_key()?;
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.live.lock().unwrap().clone())
        }

        async fn set_timeout(
            &self,
            _sandbox_id: &str,
            _timeout: Duration,
        ) -> Result<(), SandboxError> {
            self.timeout_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn run_code(&self, sandbox_id: &str, code: &str) -> Result<Execution, SandboxError> {
            self.executed
                .lock()
                .unwrap()
                .push((sandbox_id.to_string(), code.to_string()));
            Ok(self.execution.lock().unwrap().clone())
        }

        async fn write_file(
            &self,
            sandbox_id: &str,
            path: &str,
            content: &str,
        ) -> Result<(), SandboxError> {
            self.written.lock().unwrap().push((
                sandbox_id.to_string(),
                path.to_string(),
                content.to_string(),
            ));
            Ok(())
        }

        async fn list_files(
            &self,
            _sandbox_id: &str,
            _path: &str,
        ) -> Result<Vec<FileNode>, SandboxError> {
            Ok(self.files.lock().unwrap().clone())
        }

        async fn kill(&self, sandbox_id: &str) -> Result<(), SandboxError> {
            self.killed.lock().unwrap().push(sandbox_id.to_string());
            self.live
                .lock()
                .unwrap()
                .retain(|info| info.sandbox_id != sandbox_id);
            Ok(())
        }

        fn preview_host(&self, sandbox_id: &str, port: u16) -> String {
            format!("{}-{}.mock.dev", port, sandbox_id)
        }
    }
}
