//! Daemon-hosted sandbox backend.
//!
//! Talks to an always-running control plane that hosts many logical
//! sandboxes. The control plane is also the proxy, so addressing needs no
//! rewrite step: every service is a subdomain of the control plane's own
//! host.

pub mod client;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::RwLock;

use crate::config::DaemonBackendConfig;
use crate::sandbox::contract::Sandbox;
use crate::sandbox::error::SandboxError;
use crate::sandbox::registry::SandboxRegistry;
use crate::sandbox::shell_escape;
use crate::sandbox::types::*;
use crate::terminal::DEFAULT_TERMINAL_COMMAND;

use client::{CreateSandboxRequest, DaemonClient};

/// Workspace mount root inside daemon sandboxes.
pub const DAEMON_WORKSPACE_ROOT: &str = "/workspace";

/// Services named in the control plane's await-ready call.
const REQUIRED_SERVICES: &[&str] = &["vscode", "worker"];

#[derive(Default)]
struct DaemonState {
    index: Option<u32>,
    stopped: bool,
}

pub struct DaemonSandbox {
    config: SandboxConfig,
    backend: DaemonBackendConfig,
    client: DaemonClient,
    registry: SandboxRegistry,
    state: RwLock<DaemonState>,
    connected: AtomicBool,
}

impl DaemonSandbox {
    pub async fn create(
        config: SandboxConfig,
        backend: DaemonBackendConfig,
        registry: &SandboxRegistry,
    ) -> Result<Arc<Self>, SandboxError> {
        let client = DaemonClient::new(backend.base_url.clone());
        let task_run_id = config.task_run_id.clone();
        let sandbox = Arc::new(Self {
            config,
            backend,
            client,
            registry: registry.clone(),
            state: RwLock::new(DaemonState::default()),
            connected: AtomicBool::new(false),
        });
        registry.insert(&task_run_id, sandbox.clone()).await;
        Ok(sandbox)
    }

    fn info_for(&self, index: u32) -> SandboxInfo {
        let url = self.client.service_url(index, EDITOR_PORT);
        SandboxInfo {
            workspace_url: format!("{url}{DAEMON_WORKSPACE_FOLDER_QUERY}"),
            url,
            instance_id: index.to_string(),
            task_run_id: self.config.task_run_id.clone(),
            provider: SandboxProviderKind::Daemon,
            urls_persisted: false,
        }
    }

    async fn ready_index(&self) -> Result<u32, SandboxError> {
        self.state
            .read()
            .await
            .index
            .ok_or_else(|| SandboxError::Transport("sandbox not started".into()))
    }

    async fn exec_shell_checked(
        &self,
        index: u32,
        script: String,
        what: &str,
    ) -> Result<(), SandboxError> {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), script];
        let result = self
            .client
            .exec(index, &argv, None, &Default::default(), None)
            .await?;
        if result.success() {
            Ok(())
        } else {
            Err(SandboxError::Transport(format!(
                "{what} failed with code {}: {}",
                result.exit_code,
                result.stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl Sandbox for DaemonSandbox {
    fn name(&self) -> String {
        format!("daemon-{}", self.config.task_run_id)
    }

    fn provider(&self) -> SandboxProviderKind {
        SandboxProviderKind::Daemon
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn start(&self) -> Result<SandboxInfo, SandboxError> {
        let mut state = self.state.write().await;
        if let Some(index) = state.index {
            return Ok(self.info_for(index));
        }
        // A start after stop creates a fresh sandbox (resume).
        state.stopped = false;

        let created = self
            .client
            .create_sandbox(&CreateSandboxRequest {
                name: format!(
                    "{}/{}",
                    self.config.team_slug_or_id, self.config.task_run_id
                ),
                workspace: self
                    .config
                    .workspace_path
                    .clone()
                    .unwrap_or_else(|| DAEMON_WORKSPACE_ROOT.to_string()),
            })
            .await?;

        let services: Vec<String> = REQUIRED_SERVICES.iter().map(|s| s.to_string()).collect();
        if let Err(e) = self
            .client
            .await_ready(created.index, &services, self.backend.ready_timeout)
            .await
        {
            // No silent leak: delete the partially created sandbox before
            // the error surfaces.
            if let Err(delete_err) = self.client.delete_sandbox(created.index).await {
                tracing::warn!(index = created.index, error = %delete_err, "rollback delete failed");
            }
            return Err(e);
        }

        tracing::info!(
            index = created.index,
            task_run_id = %self.config.task_run_id,
            "daemon sandbox ready"
        );

        state.index = Some(created.index);
        self.connected.store(true, Ordering::SeqCst);
        Ok(self.info_for(created.index))
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        let mut state = self.state.write().await;
        if state.stopped {
            return Ok(());
        }
        state.stopped = true;
        let index = state.index.take();
        self.connected.store(false, Ordering::SeqCst);
        drop(state);

        if let Some(index) = index {
            if let Err(e) = self.client.delete_sandbox(index).await {
                tracing::warn!(index, error = %e, "sandbox delete failed");
            }
        }
        self.registry.remove(&self.config.task_run_id).await;
        Ok(())
    }

    async fn status(&self) -> Result<SandboxStatusReport, SandboxError> {
        let index = {
            let state = self.state.read().await;
            state.index
        };
        let Some(index) = index else {
            return Ok(SandboxStatusReport {
                running: false,
                info: None,
            });
        };

        match self.client.get_sandbox(index).await {
            Ok(state) => Ok(SandboxStatusReport {
                running: state.running,
                info: Some(self.info_for(index)),
            }),
            Err(SandboxError::NotFound(_)) => Ok(SandboxStatusReport {
                running: false,
                info: None,
            }),
            Err(e) => Err(e),
        }
    }

    async fn exec(&self, req: ExecRequest) -> Result<ExecResult, SandboxError> {
        let index = self.ready_index().await?;
        self.client
            .exec(
                index,
                &req.argv(),
                req.cwd.as_deref(),
                &req.env,
                req.timeout,
            )
            .await
    }

    // The daemon exposes no dedicated single-file endpoint yet, so the
    // file is written by a shell one-liner inside the sandbox.
    async fn upload_file(&self, path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        let index = self.ready_index().await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        let dir = path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
        let script = if dir.is_empty() {
            format!("echo '{encoded}' | base64 -d > {}", shell_escape(path))
        } else {
            format!(
                "mkdir -p {} && echo '{}' | base64 -d > {}",
                shell_escape(dir),
                encoded,
                shell_escape(path)
            )
        };
        self.exec_shell_checked(index, script, "file upload").await
    }

    async fn upload_tar(&self, archive: Vec<u8>) -> Result<(), SandboxError> {
        let index = self.ready_index().await?;
        self.client.upload_tar(index, archive).await
    }

    async fn create_terminal(&self, opts: TerminalOptions) -> Result<TerminalTab, SandboxError> {
        let index = self.ready_index().await?;

        let command = opts.command.as_deref().unwrap_or(DEFAULT_TERMINAL_COMMAND);
        let terminal_id = self.client.create_terminal(index, command).await?;

        // Auth material lands after the PTY exists and before the session
        // is handed out, with explicit permission bits.
        for file in &opts.auth_files {
            self.upload_file(&file.path, &file.bytes).await?;
            self.exec_shell_checked(
                index,
                format!("chmod {:o} {}", file.mode, shell_escape(&file.path)),
                "auth file chmod",
            )
            .await?;
        }

        for command in &opts.startup_commands {
            self.exec_shell_checked(index, command.clone(), "terminal startup command")
                .await?;
        }

        Ok(TerminalTab {
            terminal_id,
            control_url: self.client.service_url(index, TERMINAL_PORT),
        })
    }

    async fn start_file_watch(&self, path: &str) -> Result<(), SandboxError> {
        let index = self.ready_index().await?;
        self.client.start_file_watch(index, path).await
    }

    async fn stop_file_watch(&self) -> Result<(), SandboxError> {
        let index = self.ready_index().await?;
        self.client.stop_file_watch(index).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_config(id: &str) -> SandboxConfig {
        SandboxConfig {
            task_run_id: id.into(),
            task_id: "task-1".into(),
            team_slug_or_id: "acme".into(),
            workspace_path: None,
            repo_url: None,
            branch: None,
            snapshot_id: None,
            env: Default::default(),
        }
    }

    #[tokio::test]
    async fn create_registers_and_stop_unregisters() {
        let registry = SandboxRegistry::new();
        let sandbox = DaemonSandbox::create(
            run_config("run-d1"),
            DaemonBackendConfig::default(),
            &registry,
        )
        .await
        .unwrap();

        assert!(registry.get("run-d1").await.is_some());
        sandbox.stop().await.unwrap();
        assert!(registry.get("run-d1").await.is_none());
        sandbox.stop().await.unwrap();
    }

    #[tokio::test]
    async fn operations_before_start_are_rejected() {
        let registry = SandboxRegistry::new();
        let sandbox = DaemonSandbox::create(
            run_config("run-d2"),
            DaemonBackendConfig::default(),
            &registry,
        )
        .await
        .unwrap();

        let err = sandbox.upload_tar(vec![]).await.unwrap_err();
        assert!(matches!(err, SandboxError::Transport(_)));
        let err = sandbox
            .create_terminal(TerminalOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Transport(_)));
    }

    #[test]
    fn workspace_folder_query_uses_daemon_mount_root() {
        assert_eq!(DAEMON_WORKSPACE_FOLDER_QUERY, "/?folder=/workspace");
        assert!(DAEMON_WORKSPACE_FOLDER_QUERY.contains(DAEMON_WORKSPACE_ROOT));
    }
}
