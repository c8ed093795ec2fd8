//! HTTP client for the sandbox daemon control plane.
//!
//! One always-running control-plane process hosts many logical sandboxes,
//! disambiguated by a numeric index. The control plane is also the proxy:
//! service addressing is subdomain-based off its own base URL, so no
//! separate public-proxy rewrite step exists for this backend.
//!
//! API: POST /sandboxes, POST /sandboxes/{i}/ready, GET /sandboxes/{i},
//! DELETE /sandboxes/{i}, POST /sandboxes/{i}/exec,
//! POST /sandboxes/{i}/tar, POST /sandboxes/{i}/terminals

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::sandbox::error::SandboxError;
use crate::sandbox::types::ExecResult;

// ── Request / Response types ────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CreateSandboxRequest {
    /// Tenant-scoped name.
    pub name: String,
    /// Workspace mount declared at creation.
    pub workspace: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSandboxResponse {
    pub index: u32,
}

#[derive(Debug, Clone, Serialize)]
struct AwaitReadyRequest<'a> {
    services: &'a [String],
    timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AwaitReadyResponse {
    pub ready: bool,
    #[serde(default)]
    pub pending: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxStateResponse {
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DaemonExecRequest<'a> {
    command: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    env: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DaemonExecResponse {
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

#[derive(Debug, Clone, Serialize)]
struct CreateTerminalRequest<'a> {
    command: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateTerminalResponse {
    terminal_id: String,
}

// ── Client ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DaemonClient {
    base_url: String,
    client: reqwest::Client,
}

impl DaemonClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Subdomain address of one service port of one sandbox, derived from
    /// the control plane's own base URL: `{index}-{port}.{host}`.
    pub fn service_url(&self, index: u32, port: u16) -> String {
        match Url::parse(&self.base_url) {
            Ok(url) => {
                let scheme = url.scheme();
                let host = url.host_str().unwrap_or("localhost");
                match url.port() {
                    Some(base_port) => {
                        format!("{scheme}://{index}-{port}.{host}:{base_port}")
                    }
                    None => format!("{scheme}://{index}-{port}.{host}"),
                }
            }
            Err(_) => format!("http://{index}-{port}.localhost"),
        }
    }

    /// Check that the control plane answers.
    pub async fn health(&self) -> Result<(), SandboxError> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("daemon health check failed: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SandboxError::Transport(format!(
                "daemon health check returned {}",
                resp.status()
            )))
        }
    }

    pub async fn create_sandbox(
        &self,
        req: &CreateSandboxRequest,
    ) -> Result<CreateSandboxResponse, SandboxError> {
        let url = format!("{}/sandboxes", self.base_url);

        tracing::info!(name = %req.name, workspace = %req.workspace, "creating daemon sandbox");

        let resp = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| SandboxError::Provision(format!("daemon create failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Provision(format!(
                "daemon create returned {status}: {body}"
            )));
        }

        resp.json::<CreateSandboxResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse create response: {e}")))
    }

    /// Block until the named services inside the sandbox are ready, or the
    /// timeout elapses. On timeout the response names the stragglers.
    pub async fn await_ready(
        &self,
        index: u32,
        services: &[String],
        timeout: Duration,
    ) -> Result<(), SandboxError> {
        let url = format!("{}/sandboxes/{}/ready", self.base_url, index);
        let resp = self
            .client
            .post(&url)
            .json(&AwaitReadyRequest {
                services,
                timeout_ms: timeout.as_millis() as u64,
            })
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("daemon await-ready failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Transport(format!(
                "daemon await-ready returned {status}: {body}"
            )));
        }

        let ready = resp
            .json::<AwaitReadyResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse ready response: {e}")))?;

        if ready.ready {
            Ok(())
        } else {
            let services = if ready.pending.is_empty() {
                services.to_vec()
            } else {
                ready.pending
            };
            Err(SandboxError::ServicesNotReady { services })
        }
    }

    pub async fn get_sandbox(&self, index: u32) -> Result<SandboxStateResponse, SandboxError> {
        let url = format!("{}/sandboxes/{}", self.base_url, index);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("daemon get failed: {e}")))?;

        if resp.status().as_u16() == 404 {
            return Err(SandboxError::NotFound(format!("sandbox {index} not found")));
        }
        if !resp.status().is_success() {
            return Err(SandboxError::Transport(format!(
                "daemon get returned {}",
                resp.status()
            )));
        }

        resp.json::<SandboxStateResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse state response: {e}")))
    }

    /// Delete a sandbox. A 404 means it is already gone.
    pub async fn delete_sandbox(&self, index: u32) -> Result<(), SandboxError> {
        let url = format!("{}/sandboxes/{}", self.base_url, index);

        tracing::info!(index, "deleting daemon sandbox");

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| SandboxError::Teardown(format!("daemon delete failed: {e}")))?;

        if resp.status().as_u16() == 404 {
            tracing::warn!(index, "sandbox already deleted");
            return Ok(());
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Teardown(format!(
                "daemon delete returned {status}: {body}"
            )));
        }
        Ok(())
    }

    /// Run a command to completion. The optional deadline aborts the
    /// request through the transport.
    pub async fn exec(
        &self,
        index: u32,
        command: &[String],
        cwd: Option<&str>,
        env: &BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<ExecResult, SandboxError> {
        let url = format!("{}/sandboxes/{}/exec", self.base_url, index);
        let mut builder = self
            .client
            .post(&url)
            .json(&DaemonExecRequest { command, cwd, env });
        if let Some(limit) = timeout {
            builder = builder.timeout(limit);
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                SandboxError::Timeout
            } else {
                SandboxError::Transport(format!("daemon exec failed: {e}"))
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Transport(format!(
                "daemon exec returned {status}: {body}"
            )));
        }

        let out = resp
            .json::<DaemonExecResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse exec response: {e}")))?;

        Ok(ExecResult {
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    /// Upload a tar archive; the control plane extracts it at the
    /// workspace root.
    pub async fn upload_tar(&self, index: u32, archive: Vec<u8>) -> Result<(), SandboxError> {
        let url = format!("{}/sandboxes/{}/tar", self.base_url, index);
        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/x-tar")
            .body(archive)
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("daemon tar upload failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Transport(format!(
                "daemon tar upload returned {status}: {body}"
            )));
        }
        Ok(())
    }

    /// Create a PTY-backed terminal session through the control plane.
    pub async fn create_terminal(&self, index: u32, command: &str) -> Result<String, SandboxError> {
        let url = format!("{}/sandboxes/{}/terminals", self.base_url, index);
        let resp = self
            .client
            .post(&url)
            .json(&CreateTerminalRequest { command })
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("daemon terminal create failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Transport(format!(
                "daemon terminal create returned {status}: {body}"
            )));
        }

        let created = resp
            .json::<CreateTerminalResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse terminal response: {e}")))?;
        Ok(created.terminal_id)
    }

    pub async fn start_file_watch(&self, index: u32, path: &str) -> Result<(), SandboxError> {
        let url = format!("{}/sandboxes/{}/watch", self.base_url, index);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "path": path }))
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("daemon watch start failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(SandboxError::Transport(format!(
                "daemon watch start returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    pub async fn stop_file_watch(&self, index: u32) -> Result<(), SandboxError> {
        let url = format!("{}/sandboxes/{}/watch", self.base_url, index);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("daemon watch stop failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(SandboxError::Transport(format!(
                "daemon watch stop returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
