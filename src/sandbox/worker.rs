//! HTTP client for the in-sandbox worker service.
//!
//! Every sandbox runs a worker process on a well-known port that exposes
//! the control channel: health, bulk file upload, and file watching. The
//! docker adapter reaches it through the dynamically bound host port; the
//! cloud-VM adapter through the per-port service hostname.

use serde::Serialize;

use super::error::SandboxError;

#[derive(Debug, Clone, Serialize)]
struct WatchRequest<'a> {
    path: &'a str,
}

/// Client for one worker base URL.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    base_url: String,
    client: reqwest::Client,
}

impl WorkerClient {
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

    pub async fn health(&self) -> Result<(), SandboxError> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("worker health check failed: {e}")))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SandboxError::Transport(format!(
                "worker health check returned {}",
                resp.status()
            )))
        }
    }

    /// Upload a tar archive; the worker extracts it at the workspace root.
    pub async fn upload_tar(&self, archive: Vec<u8>) -> Result<(), SandboxError> {
        let url = format!("{}/files/tar", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/x-tar")
            .body(archive)
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("tar upload failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Transport(format!(
                "tar upload returned {status}: {body}"
            )));
        }
        Ok(())
    }

    pub async fn start_file_watch(&self, path: &str) -> Result<(), SandboxError> {
        let url = format!("{}/watch", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&WatchRequest { path })
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("start file watch failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(SandboxError::Transport(format!(
                "start file watch returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    pub async fn stop_file_watch(&self) -> Result<(), SandboxError> {
        let url = format!("{}/watch", self.base_url);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("stop file watch failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(SandboxError::Transport(format!(
                "stop file watch returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
