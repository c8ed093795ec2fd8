pub mod contract;
pub mod daemon;
pub mod docker;
pub mod error;
pub mod morph;
pub mod readiness;
pub mod registry;
pub mod types;
pub mod worker;

pub use contract::Sandbox;
pub use error::SandboxError;
pub use registry::SandboxRegistry;
pub use types::*;

use std::sync::Arc;

use crate::config::Config;
use docker::mapping::ContainerMappings;

/// Create and register the adapter for the requested backend.
///
/// Registration happens as a side effect of construction; constructing two
/// adapters with the same run id overwrites the registry entry.
pub async fn create_sandbox(
    kind: SandboxProviderKind,
    config: SandboxConfig,
    runtime: &Config,
    registry: &SandboxRegistry,
    mappings: &ContainerMappings,
) -> Result<Arc<dyn Sandbox>, SandboxError> {
    match kind {
        SandboxProviderKind::Docker => {
            tracing::info!(task_run_id = %config.task_run_id, "initializing docker sandbox");
            let sandbox =
                docker::DockerSandbox::create(config, runtime.docker.clone(), registry, mappings)
                    .await?;
            Ok(sandbox)
        }
        SandboxProviderKind::Morph => {
            tracing::info!(task_run_id = %config.task_run_id, "initializing morph sandbox");
            let sandbox =
                morph::MorphSandbox::create(config, runtime.morph.clone(), registry).await?;
            Ok(sandbox)
        }
        SandboxProviderKind::Daemon => {
            tracing::info!(task_run_id = %config.task_run_id, "initializing daemon sandbox");
            let sandbox =
                daemon::DaemonSandbox::create(config, runtime.daemon.clone(), registry).await?;
            Ok(sandbox)
        }
        SandboxProviderKind::DevContainer => Err(SandboxError::Unsupported(
            "dev-container backend is retired",
        )),
    }
}

/// Quote a string for safe interpolation into a POSIX shell command line.
pub(crate) fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.bytes().all(|b| {
        b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.' || b == b'/'
    }) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}
