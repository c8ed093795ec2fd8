//! HTTP client for the Morph Cloud instance API.
//!
//! The provider boots instances from named snapshots and reports its own
//! readiness signal through instance status. Per-service reachability is
//! layered on top by the adapter, not here.
//!
//! API: POST /instance, GET /instance/{id}, DELETE /instance/{id},
//! POST /instance/{id}/exec

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sandbox::error::SandboxError;
use crate::sandbox::types::ExecResult;

// ── Request / Response types ────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct BootInstanceRequest {
    pub snapshot_id: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceResponse {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub snapshot_id: Option<String>,
}

impl InstanceResponse {
    pub fn is_ready(&self) -> bool {
        self.status == "ready"
    }
}

#[derive(Debug, Clone, Serialize)]
struct InstanceExecRequest<'a> {
    command: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    env: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct InstanceExecResponse {
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

// ── Client ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MorphClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl MorphClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            base_url,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.header("Authorization", format!("Bearer {}", self.api_key))
    }

    /// Check that the provider API answers.
    pub async fn health(&self) -> Result<(), SandboxError> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("morph health check failed: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SandboxError::Transport(format!(
                "morph health check returned {}",
                resp.status()
            )))
        }
    }

    /// Boot a new instance from a named snapshot.
    pub async fn boot_instance(
        &self,
        req: &BootInstanceRequest,
    ) -> Result<InstanceResponse, SandboxError> {
        let url = format!("{}/instance", self.base_url);

        tracing::info!(snapshot_id = %req.snapshot_id, "booting morph instance");

        let resp = self
            .authed(self.client.post(&url))
            .json(req)
            .send()
            .await
            .map_err(|e| SandboxError::Provision(format!("morph boot failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Provision(format!(
                "morph boot returned {status}: {body}"
            )));
        }

        let instance = resp
            .json::<InstanceResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse instance response: {e}")))?;

        tracing::info!(
            instance_id = %instance.id,
            status = %instance.status,
            "morph instance booting"
        );
        Ok(instance)
    }

    pub async fn get_instance(&self, instance_id: &str) -> Result<InstanceResponse, SandboxError> {
        let url = format!("{}/instance/{}", self.base_url, instance_id);
        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("morph get instance failed: {e}")))?;

        if resp.status().as_u16() == 404 {
            return Err(SandboxError::NotFound(format!(
                "instance {instance_id} not found"
            )));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Transport(format!(
                "morph get instance returned {status}: {body}"
            )));
        }

        resp.json::<InstanceResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse instance response: {e}")))
    }

    /// Poll until the provider reports the instance ready.
    pub async fn wait_until_ready(
        &self,
        instance_id: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<InstanceResponse, SandboxError> {
        let start = tokio::time::Instant::now();
        loop {
            if start.elapsed() > timeout {
                return Err(SandboxError::Timeout);
            }
            match self.get_instance(instance_id).await {
                Ok(instance) if instance.is_ready() => {
                    tracing::info!(
                        instance_id,
                        elapsed_ms = start.elapsed().as_millis(),
                        "morph instance ready"
                    );
                    return Ok(instance);
                }
                Ok(_) | Err(SandboxError::Transport(_)) => {
                    tokio::time::sleep(poll_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop (and release) an instance. A 404 means it is already gone.
    pub async fn stop_instance(&self, instance_id: &str) -> Result<(), SandboxError> {
        let url = format!("{}/instance/{}", self.base_url, instance_id);

        tracing::info!(instance_id, "stopping morph instance");

        let resp = self
            .authed(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| SandboxError::Teardown(format!("morph stop failed: {e}")))?;

        if resp.status().as_u16() == 404 {
            tracing::warn!(instance_id, "instance already deleted");
            return Ok(());
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Teardown(format!(
                "morph stop returned {status}: {body}"
            )));
        }
        Ok(())
    }

    /// Run a command inside the instance and capture its outcome. The
    /// optional timeout aborts the underlying request.
    pub async fn exec(
        &self,
        instance_id: &str,
        command: &[String],
        cwd: Option<&str>,
        env: &BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<ExecResult, SandboxError> {
        let url = format!("{}/instance/{}/exec", self.base_url, instance_id);
        let mut builder = self
            .authed(self.client.post(&url))
            .json(&InstanceExecRequest { command, cwd, env });
        if let Some(limit) = timeout {
            builder = builder.timeout(limit);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SandboxError::Timeout
                } else {
                    SandboxError::Transport(format!("morph exec failed: {e}"))
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Transport(format!(
                "morph exec returned {status}: {body}"
            )));
        }

        let out = resp
            .json::<InstanceExecResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse exec response: {e}")))?;

        Ok(ExecResult {
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_trims_trailing_slash() {
        let c = MorphClient::new("https://cloud.morph.so/api/".into(), "key".into());
        assert_eq!(c.base_url, "https://cloud.morph.so/api");
    }

    #[test]
    fn boot_request_serializes_without_empty_metadata() {
        let req = BootInstanceRequest {
            snapshot_id: "snap_base".into(),
            metadata: BTreeMap::new(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["snapshot_id"], "snap_base");
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn instance_response_deserializes() {
        let json = r#"{"id":"abc123","status":"pending","snapshot_id":"snap_base"}"#;
        let instance: InstanceResponse = serde_json::from_str(json).unwrap();
        assert_eq!(instance.id, "abc123");
        assert!(!instance.is_ready());

        let json = r#"{"id":"abc123","status":"ready"}"#;
        let instance: InstanceResponse = serde_json::from_str(json).unwrap();
        assert!(instance.is_ready());
        assert!(instance.snapshot_id.is_none());
    }

    #[test]
    fn exec_response_defaults_missing_streams() {
        let json = r#"{"exit_code":3}"#;
        let out: InstanceExecResponse = serde_json::from_str(json).unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(out.stdout.is_empty());
        assert!(out.stderr.is_empty());
    }
}
