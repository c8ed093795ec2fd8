//! Sandbox lifecycle orchestration for agent workspaces.
//!
//! One lifecycle contract over three heterogeneous backends: a local
//! Docker runtime, Morph Cloud VMs, and an HTTP-controlled sandbox
//! daemon. Around the core contract sit the pieces each backend handles
//! differently: uniform public addressing (`addressing`), reconciliation
//! of external container state (`sandbox::docker::events`), interactive
//! terminal sessions (`terminal`), and a typed push-event/RPC channel
//! (`relay`).
//!
//! ```no_run
//! use manaflow::config::Config;
//! use manaflow::sandbox::docker::mapping::ContainerMappings;
//! use manaflow::sandbox::{self, SandboxConfig, SandboxProviderKind, SandboxRegistry};
//!
//! # async fn run() -> Result<(), manaflow::sandbox::SandboxError> {
//! let runtime = Config::from_env();
//! let registry = SandboxRegistry::new();
//! let mappings = ContainerMappings::new();
//!
//! let config = SandboxConfig {
//!     task_run_id: "run-1".into(),
//!     task_id: "task-1".into(),
//!     team_slug_or_id: "acme".into(),
//!     workspace_path: None,
//!     repo_url: None,
//!     branch: None,
//!     snapshot_id: None,
//!     env: Default::default(),
//! };
//! let sandbox = sandbox::create_sandbox(
//!     SandboxProviderKind::Docker,
//!     config,
//!     &runtime,
//!     &registry,
//!     &mappings,
//! )
//! .await?;
//! let info = sandbox.start().await?;
//! println!("workspace at {}", info.workspace_url);
//! # Ok(())
//! # }
//! ```

pub mod addressing;
pub mod config;
pub mod relay;
pub mod sandbox;
pub mod telemetry;
pub mod terminal;
