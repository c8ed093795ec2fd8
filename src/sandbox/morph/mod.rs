//! Morph Cloud VM sandbox backend.
//!
//! Instances boot from a named snapshot that already carries the workspace
//! services. The provider's own readiness signal only says the VM is up;
//! this adapter layers per-service reachability checks on top and rolls
//! the instance back if any requested service never answers.

pub mod client;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::RwLock;

use crate::addressing;
use crate::config::MorphBackendConfig;
use crate::sandbox::contract::Sandbox;
use crate::sandbox::error::SandboxError;
use crate::sandbox::readiness::{self, DEFAULT_POLL_DELAY, ServiceProbe};
use crate::sandbox::registry::SandboxRegistry;
use crate::sandbox::shell_escape;
use crate::sandbox::types::*;
use crate::sandbox::worker::WorkerClient;
use crate::terminal::{DEFAULT_TERMINAL_COMMAND, TerminalClient};

use client::{BootInstanceRequest, MorphClient};

/// Services that must answer before `start()` returns.
const REQUIRED_SERVICES: &[(&str, u16)] = &[("vscode", EDITOR_PORT), ("terminal", TERMINAL_PORT)];

#[derive(Default)]
struct MorphState {
    instance_id: Option<String>,
    stopped: bool,
}

pub struct MorphSandbox {
    config: SandboxConfig,
    backend: MorphBackendConfig,
    client: MorphClient,
    http: reqwest::Client,
    registry: SandboxRegistry,
    terminals: TerminalClient,
    state: RwLock<MorphState>,
    connected: AtomicBool,
}

impl MorphSandbox {
    pub async fn create(
        config: SandboxConfig,
        backend: MorphBackendConfig,
        registry: &SandboxRegistry,
    ) -> Result<Arc<Self>, SandboxError> {
        let client = MorphClient::new(backend.api_base_url.clone(), backend.api_key.clone());
        let task_run_id = config.task_run_id.clone();
        let sandbox = Arc::new(Self {
            config,
            backend,
            client,
            http: reqwest::Client::new(),
            registry: registry.clone(),
            terminals: TerminalClient::new(),
            state: RwLock::new(MorphState::default()),
            connected: AtomicBool::new(false),
        });
        registry.insert(&task_run_id, sandbox.clone()).await;
        Ok(sandbox)
    }

    fn info_for(&self, instance_id: &str) -> SandboxInfo {
        let url = addressing::cloud_service_url(instance_id, EDITOR_PORT);
        SandboxInfo {
            workspace_url: format!("{url}{WORKSPACE_FOLDER_QUERY}"),
            url,
            instance_id: instance_id.to_string(),
            task_run_id: self.config.task_run_id.clone(),
            provider: SandboxProviderKind::Morph,
            urls_persisted: false,
        }
    }

    async fn ready_instance(&self) -> Result<String, SandboxError> {
        self.state
            .read()
            .await
            .instance_id
            .clone()
            .ok_or_else(|| SandboxError::Transport("sandbox not started".into()))
    }

    async fn exec_shell_checked(
        &self,
        instance_id: &str,
        script: String,
        what: &str,
    ) -> Result<(), SandboxError> {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), script];
        let result = self
            .client
            .exec(instance_id, &argv, None, &Default::default(), None)
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
impl Sandbox for MorphSandbox {
    fn name(&self) -> String {
        format!("morph-{}", self.config.task_run_id)
    }

    fn provider(&self) -> SandboxProviderKind {
        SandboxProviderKind::Morph
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn start(&self) -> Result<SandboxInfo, SandboxError> {
        let mut state = self.state.write().await;
        if let Some(instance_id) = &state.instance_id {
            return Ok(self.info_for(instance_id));
        }
        // A start after stop boots a fresh instance (resume).
        state.stopped = false;

        let snapshot_id = self
            .config
            .snapshot_id
            .clone()
            .unwrap_or_else(|| self.backend.default_snapshot_id.clone());

        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("task_run_id".to_string(), self.config.task_run_id.clone());
        metadata.insert("team".to_string(), self.config.team_slug_or_id.clone());

        let instance = self
            .client
            .boot_instance(&BootInstanceRequest {
                snapshot_id,
                metadata,
            })
            .await?;

        // The provider's ready signal first, then our own per-service
        // checks. Any readiness failure rolls the instance back before
        // the error surfaces.
        if let Err(e) = self
            .client
            .wait_until_ready(&instance.id, self.backend.ready_timeout, DEFAULT_POLL_DELAY)
            .await
        {
            if let Err(stop_err) = self.client.stop_instance(&instance.id).await {
                tracing::warn!(instance_id = %instance.id, error = %stop_err, "rollback stop failed");
            }
            return Err(match e {
                SandboxError::Timeout => SandboxError::Provision(format!(
                    "instance {} never reported ready",
                    instance.id
                )),
                other => other,
            });
        }

        let probes: Vec<ServiceProbe> = REQUIRED_SERVICES
            .iter()
            .map(|(name, port)| {
                ServiceProbe::new(
                    *name,
                    format!("{}/health", addressing::cloud_service_url(&instance.id, *port)),
                )
            })
            .collect();
        if let Err(e) = readiness::await_services(
            &self.http,
            &probes,
            self.backend.ready_timeout,
            DEFAULT_POLL_DELAY,
        )
        .await
        {
            if let Err(stop_err) = self.client.stop_instance(&instance.id).await {
                tracing::warn!(instance_id = %instance.id, error = %stop_err, "rollback stop failed");
            }
            return Err(e);
        }

        tracing::info!(
            instance_id = %instance.id,
            task_run_id = %self.config.task_run_id,
            "morph sandbox ready"
        );

        state.instance_id = Some(instance.id.clone());
        self.connected.store(true, Ordering::SeqCst);
        Ok(self.info_for(&instance.id))
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        let mut state = self.state.write().await;
        if state.stopped {
            return Ok(());
        }
        state.stopped = true;
        let instance_id = state.instance_id.take();
        self.connected.store(false, Ordering::SeqCst);
        drop(state);

        if let Some(instance_id) = instance_id {
            if let Err(e) = self.client.stop_instance(&instance_id).await {
                tracing::warn!(instance_id = %instance_id, error = %e, "instance stop failed");
            }
        }
        self.registry.remove(&self.config.task_run_id).await;
        Ok(())
    }

    async fn status(&self) -> Result<SandboxStatusReport, SandboxError> {
        let instance_id = {
            let state = self.state.read().await;
            state.instance_id.clone()
        };
        let Some(instance_id) = instance_id else {
            return Ok(SandboxStatusReport {
                running: false,
                info: None,
            });
        };

        match self.client.get_instance(&instance_id).await {
            Ok(instance) => Ok(SandboxStatusReport {
                running: instance.is_ready(),
                info: Some(self.info_for(&instance.id)),
            }),
            Err(SandboxError::NotFound(_)) => Ok(SandboxStatusReport {
                running: false,
                info: None,
            }),
            Err(e) => Err(e),
        }
    }

    async fn exec(&self, req: ExecRequest) -> Result<ExecResult, SandboxError> {
        let instance_id = self.ready_instance().await?;
        self.client
            .exec(
                &instance_id,
                &req.argv(),
                req.cwd.as_deref(),
                &req.env,
                req.timeout,
            )
            .await
    }

    async fn upload_file(&self, path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        let instance_id = self.ready_instance().await?;
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
        self.exec_shell_checked(&instance_id, script, "file upload")
            .await
    }

    async fn upload_tar(&self, archive: Vec<u8>) -> Result<(), SandboxError> {
        let instance_id = self.ready_instance().await?;
        let worker = WorkerClient::new(addressing::cloud_service_url(&instance_id, WORKER_PORT));
        worker.upload_tar(archive).await
    }

    async fn create_terminal(&self, opts: TerminalOptions) -> Result<TerminalTab, SandboxError> {
        let instance_id = self.ready_instance().await?;

        for file in &opts.auth_files {
            self.upload_file(&file.path, &file.bytes).await?;
            self.exec_shell_checked(
                &instance_id,
                format!("chmod {:o} {}", file.mode, shell_escape(&file.path)),
                "auth file chmod",
            )
            .await?;
        }

        let raw_editor_url = addressing::cloud_service_url(&instance_id, EDITOR_PORT);
        let control_url = addressing::terminal_base_url(&raw_editor_url, self.backend.direct_vm_hosts)
            .ok_or_else(|| {
                SandboxError::Transport("could not derive terminal control url".into())
            })?;
        let command = opts.command.as_deref().unwrap_or(DEFAULT_TERMINAL_COMMAND);
        let terminal_id = self.terminals.create_session(&control_url, command).await?;

        for command in &opts.startup_commands {
            self.exec_shell_checked(&instance_id, command.clone(), "terminal startup command")
                .await?;
        }

        Ok(TerminalTab {
            terminal_id,
            control_url,
        })
    }

    async fn start_file_watch(&self, path: &str) -> Result<(), SandboxError> {
        let instance_id = self.ready_instance().await?;
        let worker = WorkerClient::new(addressing::cloud_service_url(&instance_id, WORKER_PORT));
        worker.start_file_watch(path).await
    }

    async fn stop_file_watch(&self) -> Result<(), SandboxError> {
        let instance_id = self.ready_instance().await?;
        let worker = WorkerClient::new(addressing::cloud_service_url(&instance_id, WORKER_PORT));
        worker.stop_file_watch().await
    }
}
