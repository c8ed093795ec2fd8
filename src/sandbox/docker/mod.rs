//! Docker container sandbox backend.
//!
//! Each sandbox is one privileged container (the workspace image launches
//! nested processes) with fixed in-container service ports bound to
//! dynamically assigned loopback host ports. The engine's auto-remove flag
//! is set so a stopped container cleans itself up; the event synchronizer
//! reconciles the mapping table when a container starts or stops outside
//! this process's control.

pub mod events;
pub mod mapping;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding, PortMap};
use futures::StreamExt;
use tokio::sync::RwLock;

use crate::config::DockerBackendConfig;
use crate::sandbox::contract::Sandbox;
use crate::sandbox::error::SandboxError;
use crate::sandbox::readiness::{self, DEFAULT_POLL_ATTEMPTS, DEFAULT_POLL_DELAY};
use crate::sandbox::registry::SandboxRegistry;
use crate::sandbox::shell_escape;
use crate::sandbox::types::*;
use crate::terminal::{DEFAULT_TERMINAL_COMMAND, TerminalClient};

use mapping::{ContainerMapping, ContainerMappings, ContainerStatus, ServicePorts};

/// Fixed prefix for backend container names.
pub const CONTAINER_NAME_PREFIX: &str = "manaflow";

/// Backend container name: `manaflow-<taskRunId>`.
pub fn backend_container_name(task_run_id: &str) -> String {
    format!("{CONTAINER_NAME_PREFIX}-{task_run_id}")
}

/// Caller-facing name: `docker-manaflow-<taskRunId>`. The provider tag is
/// a deliberate redundancy so name-inspecting code can identify the
/// managing backend without querying the engine.
pub fn caller_facing_name(task_run_id: &str) -> String {
    format!("docker-{}", backend_container_name(task_run_id))
}

/// Shell one-liner writing `bytes` to `path` inside the container.
fn file_write_command(path: &str, bytes: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    let dir = path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
    if dir.is_empty() {
        format!("echo '{encoded}' | base64 -d > {}", shell_escape(path))
    } else {
        format!(
            "mkdir -p {} && echo '{}' | base64 -d > {}",
            shell_escape(dir),
            encoded,
            shell_escape(path)
        )
    }
}

/// Shell one-liner extracting a tar archive at the container root.
fn tar_extract_command(archive: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(archive);
    format!("echo '{encoded}' | base64 -d | tar -xf - -C /")
}

fn host_port(ports: &PortMap, container_port: u16) -> Result<u16, SandboxError> {
    ports
        .get(&format!("{container_port}/tcp"))
        .and_then(|bindings| bindings.as_ref())
        .and_then(|bindings| bindings.first())
        .and_then(|binding| binding.host_port.as_deref())
        .and_then(|port| port.parse().ok())
        .ok_or_else(|| {
            SandboxError::Provision(format!("no host port bound for {container_port}/tcp"))
        })
}

fn read_service_ports(inspect: &ContainerInspectResponse) -> Result<ServicePorts, SandboxError> {
    let ports = inspect
        .network_settings
        .as_ref()
        .and_then(|ns| ns.ports.as_ref())
        .ok_or_else(|| SandboxError::Provision("container reports no port map".into()))?;
    Ok(ServicePorts {
        editor: host_port(ports, EDITOR_PORT)?,
        worker: host_port(ports, WORKER_PORT)?,
        proxy: host_port(ports, PROXY_PORT)?,
    })
}

#[derive(Default)]
struct DockerState {
    ports: Option<ServicePorts>,
    stopped: bool,
}

pub struct DockerSandbox {
    config: SandboxConfig,
    backend: DockerBackendConfig,
    docker: Docker,
    http: reqwest::Client,
    registry: SandboxRegistry,
    mappings: ContainerMappings,
    terminals: TerminalClient,
    state: RwLock<DockerState>,
    connected: AtomicBool,
}

impl DockerSandbox {
    /// Build the adapter and register it under the run id. Connecting to
    /// the engine is lazy; no container exists until `start()`.
    pub async fn create(
        config: SandboxConfig,
        backend: DockerBackendConfig,
        registry: &SandboxRegistry,
        mappings: &ContainerMappings,
    ) -> Result<Arc<Self>, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Provision(format!("docker connect failed: {e}")))?;

        let task_run_id = config.task_run_id.clone();
        let sandbox = Arc::new(Self {
            config,
            backend,
            docker,
            http: reqwest::Client::new(),
            registry: registry.clone(),
            mappings: mappings.clone(),
            terminals: TerminalClient::new(),
            state: RwLock::new(DockerState::default()),
            connected: AtomicBool::new(false),
        });
        registry.insert(&task_run_id, sandbox.clone()).await;
        Ok(sandbox)
    }

    fn container_name(&self) -> String {
        backend_container_name(&self.config.task_run_id)
    }

    fn info_for(&self, ports: ServicePorts) -> SandboxInfo {
        let url = format!("http://127.0.0.1:{}", ports.editor);
        SandboxInfo {
            workspace_url: format!("{url}{WORKSPACE_FOLDER_QUERY}"),
            url,
            instance_id: self.container_name(),
            task_run_id: self.config.task_run_id.clone(),
            provider: SandboxProviderKind::Docker,
            urls_persisted: false,
        }
    }

    async fn ready_ports(&self) -> Result<ServicePorts, SandboxError> {
        self.state
            .read()
            .await
            .ports
            .ok_or_else(|| SandboxError::Transport("sandbox not started".into()))
    }

    /// Best-effort stop+remove after a partial provision. No orphaned
    /// containers on failure paths.
    async fn rollback_container(&self, name: &str) {
        if let Err(e) = self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: 2 }))
            .await
        {
            tracing::warn!(container = name, error = %e, "rollback stop failed");
        }
        if let Err(e) = self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            tracing::debug!(container = name, error = %e, "rollback remove failed (auto-remove may have raced)");
        }
        self.mappings.remove(name).await;
    }

    async fn exec_argv(
        &self,
        argv: Vec<String>,
        cwd: Option<String>,
        env: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<ExecResult, SandboxError> {
        let name = self.container_name();

        let exec = self
            .docker
            .create_exec(
                &name,
                CreateExecOptions::<String> {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(argv),
                    working_dir: cwd,
                    env: if env.is_empty() { None } else { Some(env) },
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::Transport(format!("exec create failed: {e}")))?;

        let results = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::Transport(format!("exec start failed: {e}")))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let StartExecResults::Attached { mut output, .. } = results {
            let drain = async {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            stdout.extend_from_slice(&message);
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            stderr.extend_from_slice(&message);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "exec output stream error");
                            break;
                        }
                    }
                }
            };
            match timeout {
                Some(limit) => tokio::time::timeout(limit, drain)
                    .await
                    .map_err(|_| SandboxError::Timeout)?,
                None => drain.await,
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::Transport(format!("exec inspect failed: {e}")))?;

        Ok(ExecResult {
            exit_code: inspect.exit_code.map(|c| c as i32).unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    /// Run a shell one-liner and fail on non-zero exit.
    async fn exec_shell_checked(&self, script: String, what: &str) -> Result<(), SandboxError> {
        let result = self
            .exec_argv(
                vec!["/bin/sh".into(), "-c".into(), script],
                None,
                vec![],
                None,
            )
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
impl Sandbox for DockerSandbox {
    fn name(&self) -> String {
        caller_facing_name(&self.config.task_run_id)
    }

    fn provider(&self) -> SandboxProviderKind {
        SandboxProviderKind::Docker
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn start(&self) -> Result<SandboxInfo, SandboxError> {
        let mut state = self.state.write().await;
        if let Some(ports) = state.ports {
            return Ok(self.info_for(ports));
        }
        // A start after stop provisions a fresh container (resume).
        state.stopped = false;

        let name = self.container_name();

        let service_ports = [EDITOR_PORT, WORKER_PORT, PROXY_PORT];
        let exposed_ports: HashMap<String, HashMap<(), ()>> = service_ports
            .iter()
            .map(|p| (format!("{p}/tcp"), HashMap::new()))
            .collect();
        let port_bindings: PortMap = service_ports
            .iter()
            .map(|p| {
                (
                    format!("{p}/tcp"),
                    Some(vec![PortBinding {
                        host_ip: Some("127.0.0.1".into()),
                        host_port: Some("0".into()),
                    }]),
                )
            })
            .collect();

        let mut env: Vec<String> = self
            .config
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        env.push(format!("MANAFLOW_TASK_RUN_ID={}", self.config.task_run_id));
        env.push(format!("MANAFLOW_TEAM={}", self.config.team_slug_or_id));

        let container_config = Config::<String> {
            image: Some(self.backend.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                // The workspace image launches nested processes.
                privileged: Some(true),
                auto_remove: Some(true),
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        tracing::info!(
            container = %name,
            image = %self.backend.image,
            "creating sandbox container"
        );

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    ..Default::default()
                }),
                container_config,
            )
            .await
            .map_err(|e| SandboxError::Provision(format!("container create failed: {e}")))?;

        if let Err(e) = self.docker.start_container::<String>(&name, None).await {
            self.rollback_container(&name).await;
            return Err(SandboxError::Provision(format!(
                "container start failed: {e}"
            )));
        }

        let inspect = match self.docker.inspect_container(&name, None).await {
            Ok(inspect) => inspect,
            Err(e) => {
                self.rollback_container(&name).await;
                return Err(SandboxError::Provision(format!(
                    "container inspect failed: {e}"
                )));
            }
        };
        let ports = match read_service_ports(&inspect) {
            Ok(ports) => ports,
            Err(e) => {
                self.rollback_container(&name).await;
                return Err(e);
            }
        };

        self.mappings
            .insert(ContainerMapping {
                container_name: name.clone(),
                instance_id: name.clone(),
                team_id: self.config.team_slug_or_id.clone(),
                ports,
                status: ContainerStatus::Starting,
                created_at_unix_ms: chrono::Utc::now().timestamp_millis(),
            })
            .await;

        let worker_url = format!("http://127.0.0.1:{}/health", ports.worker);
        if let Err(e) = readiness::wait_for_http_ok(
            &self.http,
            &worker_url,
            DEFAULT_POLL_ATTEMPTS,
            DEFAULT_POLL_DELAY,
        )
        .await
        {
            self.rollback_container(&name).await;
            return Err(match e {
                SandboxError::Timeout => SandboxError::ServicesNotReady {
                    services: vec!["worker".into()],
                },
                other => other,
            });
        }

        self.mappings
            .set_status(&name, ContainerStatus::Running)
            .await;
        state.ports = Some(ports);
        self.connected.store(true, Ordering::SeqCst);

        tracing::info!(
            container = %name,
            editor_port = ports.editor,
            worker_port = ports.worker,
            proxy_port = ports.proxy,
            "sandbox container ready"
        );

        Ok(self.info_for(ports))
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        let mut state = self.state.write().await;
        if state.stopped {
            return Ok(());
        }
        state.stopped = true;
        state.ports = None;
        self.connected.store(false, Ordering::SeqCst);
        drop(state);

        let name = self.container_name();

        // Teardown failures are logged, never re-thrown: the caller's
        // cleanup path must not block on a half-dead engine.
        if let Err(e) = self
            .docker
            .stop_container(&name, Some(StopContainerOptions { t: 10 }))
            .await
        {
            tracing::warn!(container = %name, error = %e, "container stop failed (may already be gone)");
        }
        if let Err(e) = self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            tracing::debug!(container = %name, error = %e, "container remove failed (auto-remove may have raced)");
        }

        self.mappings.set_status(&name, ContainerStatus::Stopped).await;
        self.mappings.remove(&name).await;
        self.registry.remove(&self.config.task_run_id).await;

        tracing::info!(container = %name, "sandbox container stopped");
        Ok(())
    }

    async fn status(&self) -> Result<SandboxStatusReport, SandboxError> {
        let name = self.container_name();
        match self.docker.inspect_container(&name, None).await {
            Ok(inspect) => {
                let running = inspect
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                let info = read_service_ports(&inspect).ok().map(|p| self.info_for(p));
                Ok(SandboxStatusReport { running, info })
            }
            Err(e) => {
                tracing::debug!(container = %name, error = %e, "status inspect failed");
                Ok(SandboxStatusReport {
                    running: false,
                    info: None,
                })
            }
        }
    }

    async fn exec(&self, req: ExecRequest) -> Result<ExecResult, SandboxError> {
        self.ready_ports().await?;
        let env: Vec<String> = req.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        self.exec_argv(req.argv(), req.cwd.clone(), env, req.timeout)
            .await
    }

    async fn upload_file(&self, path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        self.ready_ports().await?;
        self.exec_shell_checked(file_write_command(path, bytes), "file upload")
            .await
    }

    async fn upload_tar(&self, archive: Vec<u8>) -> Result<(), SandboxError> {
        self.ready_ports().await?;
        self.exec_shell_checked(tar_extract_command(&archive), "tar upload")
            .await
    }

    async fn create_terminal(&self, opts: TerminalOptions) -> Result<TerminalTab, SandboxError> {
        let ports = self.ready_ports().await?;

        for file in &opts.auth_files {
            self.upload_file(&file.path, &file.bytes).await?;
            self.exec_shell_checked(
                format!("chmod {:o} {}", file.mode, shell_escape(&file.path)),
                "auth file chmod",
            )
            .await?;
        }

        let control_url = format!("http://127.0.0.1:{}", ports.worker);
        let command = opts.command.as_deref().unwrap_or(DEFAULT_TERMINAL_COMMAND);
        let terminal_id = self.terminals.create_session(&control_url, command).await?;

        for command in &opts.startup_commands {
            self.exec_shell_checked(command.clone(), "terminal startup command")
                .await?;
        }

        Ok(TerminalTab {
            terminal_id,
            control_url,
        })
    }

    async fn start_file_watch(&self, path: &str) -> Result<(), SandboxError> {
        let ports = self.ready_ports().await?;
        let worker =
            crate::sandbox::worker::WorkerClient::new(format!("http://127.0.0.1:{}", ports.worker));
        worker.start_file_watch(path).await
    }

    async fn stop_file_watch(&self) -> Result<(), SandboxError> {
        let ports = self.ready_ports().await?;
        let worker =
            crate::sandbox::worker::WorkerClient::new(format!("http://127.0.0.1:{}", ports.worker));
        worker.stop_file_watch().await
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

    #[test]
    fn naming_convention() {
        assert_eq!(backend_container_name("run-7"), "manaflow-run-7");
        assert_eq!(caller_facing_name("run-7"), "docker-manaflow-run-7");
        // Stripping the provider tag yields exactly the backend name.
        assert_eq!(
            caller_facing_name("run-7").strip_prefix("docker-").unwrap(),
            backend_container_name("run-7")
        );
    }

    #[test]
    fn file_write_command_encodes_and_escapes() {
        let cmd = file_write_command("/root/workspace/run.sh", b"#!/bin/sh\necho hi");
        assert!(cmd.starts_with("mkdir -p /root/workspace &&"));
        assert!(cmd.contains("base64 -d > /root/workspace/run.sh"));
        // Content never appears raw in the shell line.
        assert!(!cmd.contains("echo hi"));
    }

    #[test]
    fn file_write_command_without_directory() {
        let cmd = file_write_command("notes.txt", b"x");
        assert!(!cmd.contains("mkdir"));
        assert!(cmd.contains("> notes.txt"));
    }

    #[test]
    fn tar_extract_targets_root() {
        let cmd = tar_extract_command(b"fake-archive");
        assert!(cmd.ends_with("tar -xf - -C /"));
    }

    #[test]
    fn host_port_extraction() {
        let mut ports: PortMap = PortMap::new();
        ports.insert(
            "39378/tcp".into(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".into()),
                host_port: Some("32768".into()),
            }]),
        );
        assert_eq!(host_port(&ports, 39378).unwrap(), 32768);
        assert!(host_port(&ports, 39377).is_err());
    }

    #[tokio::test]
    async fn create_registers_and_stop_unregisters() {
        let registry = SandboxRegistry::new();
        let mappings = ContainerMappings::new();
        let backend = DockerBackendConfig::default();

        let mut sandboxes = Vec::new();
        for i in 0..3 {
            let sandbox = DockerSandbox::create(
                run_config(&format!("run-{i}")),
                backend.clone(),
                &registry,
                &mappings,
            )
            .await
            .unwrap();
            sandboxes.push(sandbox);
        }
        assert_eq!(registry.len().await, 3);

        // Stopping one removes exactly that id.
        sandboxes[1].stop().await.unwrap();
        assert_eq!(registry.len().await, 2);
        assert!(registry.get("run-0").await.is_some());
        assert!(registry.get("run-1").await.is_none());
        assert!(registry.get("run-2").await.is_some());

        // Stop is idempotent.
        sandboxes[1].stop().await.unwrap();
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn operations_before_start_are_rejected() {
        let registry = SandboxRegistry::new();
        let mappings = ContainerMappings::new();
        let sandbox = DockerSandbox::create(
            run_config("run-gate"),
            DockerBackendConfig::default(),
            &registry,
            &mappings,
        )
        .await
        .unwrap();

        let err = sandbox.exec(ExecRequest::new("true")).await.unwrap_err();
        assert!(matches!(err, SandboxError::Transport(_)));
        let err = sandbox.upload_file("/tmp/x", b"x").await.unwrap_err();
        assert!(matches!(err, SandboxError::Transport(_)));
        assert!(!sandbox.is_connected());
    }
}
