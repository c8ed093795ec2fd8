use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Provider identity ───────────────────────────────────────────────

/// Which backend manages a sandbox.
///
/// `DevContainer` is a historical tag kept for serialization compatibility
/// with persisted records; no adapter constructs it anymore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxProviderKind {
    Docker,
    Morph,
    Daemon,
    DevContainer,
}

impl SandboxProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Morph => "morph",
            Self::Daemon => "daemon",
            Self::DevContainer => "dev-container",
        }
    }
}

impl std::fmt::Display for SandboxProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Sandbox spec (input to start) ───────────────────────────────────

/// Immutable per-instance provisioning input. Created by the caller before
/// provisioning; never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Stable identifier; unique per run, guaranteed upstream.
    pub task_run_id: String,
    pub task_id: String,
    pub team_slug_or_id: String,
    #[serde(default)]
    pub workspace_path: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    /// Environment template / snapshot to boot from (cloud-VM backend).
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

// ── Sandbox info (output of start / status) ─────────────────────────

/// Snapshot of a running sandbox's addressing. Re-issued on every status
/// query; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInfo {
    /// Raw internal URL as the backend reports it (pre-rewrite).
    pub url: String,
    /// Editor URL with the workspace folder query appended.
    pub workspace_url: String,
    /// Backend instance id (container name, VM id, or daemon index).
    pub instance_id: String,
    pub task_run_id: String,
    pub provider: SandboxProviderKind,
    /// Whether the caller already durably persisted these URLs.
    pub urls_persisted: bool,
}

#[derive(Debug, Clone)]
pub struct SandboxStatusReport {
    pub running: bool,
    pub info: Option<SandboxInfo>,
}

// ── Exec model ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Aborts the underlying request when exceeded.
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: vec![],
            cwd: None,
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The command with its args as a single argv vector.
    pub fn argv(&self) -> Vec<String> {
        let mut v = Vec::with_capacity(1 + self.args.len());
        v.push(self.command.clone());
        v.extend(self.args.iter().cloned());
        v
    }
}

/// Outcome of a command that ran to completion. A non-zero exit code is a
/// value here, not an error; "could not run the command" is
/// `SandboxError::Transport`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// ── Terminal sessions ───────────────────────────────────────────────

/// A file to place into the sandbox before a terminal session is handed to
/// the user (credentials, ssh keys), with explicit permission bits.
#[derive(Debug, Clone)]
pub struct TerminalAuthFile {
    pub path: String,
    pub bytes: Vec<u8>,
    pub mode: u32,
}

#[derive(Debug, Clone, Default)]
pub struct TerminalOptions {
    /// Disambiguates multiple logical consumers attaching to one sandbox.
    pub context_key: Option<String>,
    /// Overrides the default attach command.
    pub command: Option<String>,
    pub auth_files: Vec<TerminalAuthFile>,
    /// Run in order before the session is considered ready.
    pub startup_commands: Vec<String>,
}

/// An interactive session inside a sandbox, scoped to the control-base URL
/// it was created against. Never implicitly destroyed by this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalTab {
    pub terminal_id: String,
    pub control_url: String,
}

// ── Well-known service ports ────────────────────────────────────────

pub const EDITOR_PORT: u16 = 39378;
pub const WORKER_PORT: u16 = 39377;
pub const PROXY_PORT: u16 = 39379;
pub const REMOTE_DESKTOP_PORT: u16 = 39380;
pub const TERMINAL_PORT: u16 = 39383;

/// Folder query appended to editor URLs for workspaces mounted at
/// `/root/workspace` (docker and cloud-VM backends).
pub const WORKSPACE_FOLDER_QUERY: &str = "/?folder=/root/workspace";

/// Daemon-hosted sandboxes mount the workspace at `/workspace`.
pub const DAEMON_WORKSPACE_FOLDER_QUERY: &str = "/?folder=/workspace";
