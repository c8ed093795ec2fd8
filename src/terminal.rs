//! Terminal/PTY session manager.
//!
//! Sessions are created against a sandbox's terminal-control base URL and
//! cached per (base URL, context key) pair so that multiple logical
//! consumers attaching to the same sandbox each get a stable session.
//! Creation is single-flight per pair: concurrent callers racing before
//! the first creation completes still produce exactly one session.
//! Sessions are never destroyed by this layer; the sandbox tears its own
//! sessions down on stop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::sandbox::error::SandboxError;

/// Attach to the well-known persistent multiplexed shell.
pub const DEFAULT_TERMINAL_COMMAND: &str = "tmux new-session -A -s main";

/// Control-plane operations a session manager needs.
#[async_trait]
pub trait TerminalBackend: Send + Sync {
    async fn create_session(&self, base_url: &str, command: &str) -> Result<String, SandboxError>;
    async fn list_sessions(&self, base_url: &str) -> Result<Vec<String>, SandboxError>;
}

// ── HTTP client ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
struct CreateSessionRequest<'a> {
    command: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateSessionResponse {
    session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ListSessionsResponse {
    #[serde(default)]
    sessions: Vec<String>,
}

/// HTTP client for a terminal-control service.
#[derive(Debug, Clone, Default)]
pub struct TerminalClient {
    client: reqwest::Client,
}

impl TerminalClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_session(
        &self,
        base_url: &str,
        command: &str,
    ) -> Result<String, SandboxError> {
        let url = format!("{}/sessions", base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(&CreateSessionRequest { command })
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("terminal create failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Transport(format!(
                "terminal create returned {status}: {body}"
            )));
        }

        let created = resp
            .json::<CreateSessionResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse session response: {e}")))?;

        tracing::debug!(session_id = %created.session_id, base_url, "terminal session created");
        Ok(created.session_id)
    }

    pub async fn list_sessions(&self, base_url: &str) -> Result<Vec<String>, SandboxError> {
        let url = format!("{}/sessions", base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SandboxError::Transport(format!("terminal list failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(SandboxError::Transport(format!(
                "terminal list returned {}",
                resp.status()
            )));
        }

        let listed = resp
            .json::<ListSessionsResponse>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse sessions response: {e}")))?;
        Ok(listed.sessions)
    }
}

#[async_trait]
impl TerminalBackend for TerminalClient {
    async fn create_session(&self, base_url: &str, command: &str) -> Result<String, SandboxError> {
        TerminalClient::create_session(self, base_url, command).await
    }

    async fn list_sessions(&self, base_url: &str) -> Result<Vec<String>, SandboxError> {
        TerminalClient::list_sessions(self, base_url).await
    }
}

// ── Manager ─────────────────────────────────────────────────────────

type PairKey = (String, String);

pub struct TerminalManager {
    backend: Arc<dyn TerminalBackend>,
    sessions: Mutex<HashMap<PairKey, Arc<Mutex<Vec<String>>>>>,
}

impl TerminalManager {
    pub fn new(backend: Arc<dyn TerminalBackend>) -> Self {
        Self {
            backend,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_http_client() -> Self {
        Self::new(Arc::new(TerminalClient::new()))
    }

    /// Return the cached session for the pair, creating exactly one with
    /// the default attach command if none exists yet. Concurrent callers
    /// for the same pair serialize on the pair's slot, so only the first
    /// one creates.
    pub async fn ensure_session(
        &self,
        base_url: &str,
        context_key: &str,
    ) -> Result<String, SandboxError> {
        let slot = {
            let mut map = self.sessions.lock().await;
            map.entry((base_url.to_string(), context_key.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
                .clone()
        };

        let mut ids = slot.lock().await;
        if let Some(id) = ids.first() {
            return Ok(id.clone());
        }

        let id = self
            .backend
            .create_session(base_url, DEFAULT_TERMINAL_COMMAND)
            .await?;
        ids.push(id.clone());
        Ok(id)
    }

    /// Passthrough read to the control plane.
    pub async fn list_sessions(&self, base_url: &str) -> Result<Vec<String>, SandboxError> {
        self.backend.list_sessions(base_url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingBackend {
        created: AtomicUsize,
    }

    #[async_trait]
    impl TerminalBackend for CountingBackend {
        async fn create_session(
            &self,
            _base_url: &str,
            command: &str,
        ) -> Result<String, SandboxError> {
            assert_eq!(command, DEFAULT_TERMINAL_COMMAND);
            // Stretch the window so racing callers would both be inside
            // creation if single-flight were broken.
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("term-{}", uuid::Uuid::new_v4()))
        }

        async fn list_sessions(&self, _base_url: &str) -> Result<Vec<String>, SandboxError> {
            Ok(vec!["term-listed".into()])
        }
    }

    fn manager() -> (Arc<TerminalManager>, Arc<CountingBackend>) {
        let backend = Arc::new(CountingBackend {
            created: AtomicUsize::new(0),
        });
        (
            Arc::new(TerminalManager::new(backend.clone())),
            backend,
        )
    }

    #[tokio::test]
    async fn concurrent_ensure_creates_exactly_one_session() {
        let (manager, backend) = manager();
        let a = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.ensure_session("https://t.example", "ctx").await })
        };
        let b = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.ensure_session("https://t.example", "ctx").await })
        };
        let id_a = a.await.unwrap().unwrap();
        let id_b = b.await.unwrap().unwrap();

        assert_eq!(id_a, id_b);
        assert_eq!(backend.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_context_keys_get_distinct_sessions() {
        let (manager, backend) = manager();
        let id_a = manager
            .ensure_session("https://t.example", "preview-3000")
            .await
            .unwrap();
        let id_b = manager
            .ensure_session("https://t.example", "preview-8080")
            .await
            .unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(backend.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ensure_is_stable_across_calls() {
        let (manager, backend) = manager();
        let first = manager.ensure_session("https://t.example", "ctx").await.unwrap();
        let second = manager.ensure_session("https://t.example", "ctx").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn list_is_a_passthrough() {
        let (manager, _) = manager();
        let sessions = manager.list_sessions("https://t.example").await.unwrap();
        assert_eq!(sessions, vec!["term-listed"]);
    }

    #[test]
    fn session_wire_types() {
        let req = CreateSessionRequest {
            command: DEFAULT_TERMINAL_COMMAND,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["command"], DEFAULT_TERMINAL_COMMAND);

        let resp: CreateSessionResponse =
            serde_json::from_str(r#"{"session_id":"s-1"}"#).unwrap();
        assert_eq!(resp.session_id, "s-1");

        let listed: ListSessionsResponse = serde_json::from_str(r#"{}"#).unwrap();
        assert!(listed.sessions.is_empty());
    }
}
