//! Docker event synchronizer.
//!
//! A single long-lived listener subscribes to the engine's event stream
//! for all containers and reconciles the mapping table when a container
//! starts or stops outside this process's control. Must be started once
//! per process and shut down explicitly. Duplicate or out-of-order events
//! are harmless because status assignment is a last-write-wins patch
//! keyed by container name.

use std::collections::HashMap;

use bollard::Docker;
use bollard::models::EventMessage;
use bollard::system::EventsOptions;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::mapping::{ContainerMappings, ContainerStatus};

/// Translate a runtime event action into a status patch. Actions that do
/// not affect lifecycle (exec_create, attach, ...) map to `None`.
fn status_for_action(action: &str) -> Option<ContainerStatus> {
    match action {
        "start" | "restart" | "unpause" => Some(ContainerStatus::Running),
        "die" | "stop" | "kill" | "pause" => Some(ContainerStatus::Stopped),
        _ => None,
    }
}

/// Apply one runtime event to the mapping table. Events for container
/// names without a mapping are ignored.
async fn apply_event(mappings: &ContainerMappings, event: &EventMessage) {
    let Some(action) = event.action.as_deref() else {
        return;
    };
    let Some(status) = status_for_action(action) else {
        return;
    };
    let name = event
        .actor
        .as_ref()
        .and_then(|actor| actor.attributes.as_ref())
        .and_then(|attrs| attrs.get("name"));
    if let Some(name) = name {
        mappings.set_status(name, status).await;
    }
}

pub struct DockerEventSync {
    docker: Docker,
    mappings: ContainerMappings,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DockerEventSync {
    pub fn new(docker: Docker, mappings: ContainerMappings) -> Self {
        Self {
            docker,
            mappings,
            task: Mutex::new(None),
        }
    }

    /// Start the listener. Calling it again while the listener runs is a
    /// no-op.
    pub async fn spawn(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            tracing::warn!("docker event synchronizer already running");
            return;
        }

        let docker = self.docker.clone();
        let mappings = self.mappings.clone();
        *task = Some(tokio::spawn(async move {
            let mut filters = HashMap::new();
            filters.insert("type".to_string(), vec!["container".to_string()]);

            let mut stream = docker.events(Some(EventsOptions::<String> {
                filters,
                ..Default::default()
            }));

            tracing::info!("docker event synchronizer started");
            while let Some(event) = stream.next().await {
                match event {
                    Ok(message) => apply_event(&mappings, &message).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "docker event stream error");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
            tracing::info!("docker event stream closed");
        }));
    }

    /// Stop the listener. Safe to call when never started.
    pub async fn shutdown(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            tracing::info!("docker event synchronizer stopped");
        }
    }
}
