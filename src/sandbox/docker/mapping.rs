//! Container mapping index for the docker backend.
//!
//! A back-reference from container name to the sandbox that owns it, used
//! by the event synchronizer to patch lifecycle status when a container
//! starts or stops outside this process's control. Deleting a mapping
//! never implies the container itself was deleted, and vice versa.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Host ports assigned to the sandbox's fixed in-container services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServicePorts {
    pub editor: u16,
    pub worker: u16,
    pub proxy: u16,
}

/// Lifecycle status as last observed. Transitions are monotonic within one
/// instance's life (`starting → running → stopped`), except that a
/// container may be `starting` again after resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Starting,
    Running,
    Stopped,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerMapping {
    pub container_name: String,
    pub instance_id: String,
    pub team_id: String,
    pub ports: ServicePorts,
    pub status: ContainerStatus,
    pub created_at_unix_ms: i64,
}

/// Shared handle to the mapping table, keyed by container name. At most
/// one mapping per name; status writes are whole-value last-write-wins
/// patches, so duplicate or out-of-order runtime events are harmless.
#[derive(Clone, Default)]
pub struct ContainerMappings {
    inner: Arc<RwLock<HashMap<String, ContainerMapping>>>,
}

impl ContainerMappings {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, mapping: ContainerMapping) {
        let mut map = self.inner.write().await;
        map.insert(mapping.container_name.clone(), mapping);
    }

    pub async fn get(&self, container_name: &str) -> Option<ContainerMapping> {
        self.inner.read().await.get(container_name).cloned()
    }

    /// Patch the status for a container name. Unknown names are ignored.
    pub async fn set_status(&self, container_name: &str, status: ContainerStatus) {
        let mut map = self.inner.write().await;
        if let Some(mapping) = map.get_mut(container_name) {
            tracing::debug!(
                container = container_name,
                from = %mapping.status,
                to = %status,
                "container mapping status patched"
            );
            mapping.status = status;
        }
    }

    pub async fn remove(&self, container_name: &str) -> Option<ContainerMapping> {
        self.inner.write().await.remove(container_name)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(name: &str) -> ContainerMapping {
        ContainerMapping {
            container_name: name.into(),
            instance_id: name.into(),
            team_id: "acme".into(),
            ports: ServicePorts {
                editor: 32768,
                worker: 32769,
                proxy: 32770,
            },
            status: ContainerStatus::Starting,
            created_at_unix_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[tokio::test]
    async fn insert_is_keyed_by_container_name() {
        let mappings = ContainerMappings::new();
        mappings.insert(mapping("manaflow-run-1")).await;
        mappings.insert(mapping("manaflow-run-1")).await;
        assert_eq!(mappings.len().await, 1);
    }

    #[tokio::test]
    async fn set_status_patches_known_names_only() {
        let mappings = ContainerMappings::new();
        mappings.insert(mapping("manaflow-run-1")).await;

        mappings
            .set_status("manaflow-run-1", ContainerStatus::Running)
            .await;
        assert_eq!(
            mappings.get("manaflow-run-1").await.unwrap().status,
            ContainerStatus::Running
        );

        // Unknown name: no entry springs into existence.
        mappings
            .set_status("manaflow-other", ContainerStatus::Stopped)
            .await;
        assert!(mappings.get("manaflow-other").await.is_none());
        assert_eq!(mappings.len().await, 1);
    }

    #[tokio::test]
    async fn status_patch_is_last_write_wins() {
        let mappings = ContainerMappings::new();
        mappings.insert(mapping("manaflow-run-1")).await;

        // Duplicate / out-of-order events settle on the last write.
        mappings
            .set_status("manaflow-run-1", ContainerStatus::Running)
            .await;
        mappings
            .set_status("manaflow-run-1", ContainerStatus::Running)
            .await;
        mappings
            .set_status("manaflow-run-1", ContainerStatus::Stopped)
            .await;
        assert_eq!(
            mappings.get("manaflow-run-1").await.unwrap().status,
            ContainerStatus::Stopped
        );
    }

    #[tokio::test]
    async fn remove_returns_the_mapping() {
        let mappings = ContainerMappings::new();
        mappings.insert(mapping("manaflow-run-1")).await;
        let removed = mappings.remove("manaflow-run-1").await;
        assert!(removed.is_some());
        assert!(mappings.is_empty().await);
        assert!(mappings.remove("manaflow-run-1").await.is_none());
    }
}
